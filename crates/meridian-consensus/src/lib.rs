//! Meridian Consensus - Tendermint-style BFT agreement
//!
//! This crate provides weighted vote collection, the round state machine,
//! proposer selection, the evidence pool, and the runner and reactor that
//! connect the state machine to the network.

pub mod application;
pub mod block_builder;
pub mod config;
pub mod error;
pub mod evidence_pool;
pub mod height_votes;
pub mod proposer;
pub mod provider;
pub mod reactor;
pub mod round_state;
pub mod runner;
pub mod state_machine;
pub mod vote_set;

pub use application::{Application, NoopApplication};
pub use block_builder::{BlockBuilder, BlockBuilderConfig};
pub use config::ConsensusConfig;
pub use error::ConsensusError;
pub use evidence_pool::EvidencePool;
pub use height_votes::HeightVoteSet;
pub use proposer::{ProposerSelector, RoundRobin, WeightedRoundRobin};
pub use provider::{ValidatorSchedule, ValidatorSetProvider};
pub use reactor::ConsensusReactor;
pub use round_state::{RoundState, RoundStep};
pub use runner::{recent_evidence, start_position, ConsensusHandle, ConsensusRunner};
pub use state_machine::{
    ConsensusAction, ConsensusEvent, ConsensusMessage, ConsensusState, TimeoutInfo,
};
pub use vote_set::{VoteSet, VoteTally};
