use meridian_core::{Hash, Vote, VoteStep};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("Vote for {got_height}/{got_round}/{got_step} does not belong to {height}/{round}/{step}")]
    VoteMismatch {
        height: u64,
        round: u32,
        step: VoteStep,
        got_height: u64,
        got_round: u32,
        got_step: VoteStep,
    },

    #[error("Validator not found: {0}")]
    UnknownValidator(String),

    #[error("Invalid signature from validator")]
    InvalidSignature,

    #[error("Duplicate vote from {}: {} then {}", .existing.validator, .existing, .conflicting)]
    DuplicateVote {
        existing: Box<Vote>,
        conflicting: Box<Vote>,
    },

    #[error("Safety violation at {height}/{round}/{step}: quorums for {values:?}")]
    SafetyViolation {
        height: u64,
        round: u32,
        step: VoteStep,
        values: Vec<Option<Hash>>,
    },

    #[error("Invalid proposal: {0}")]
    InvalidProposal(String),

    #[error("Invalid block: {0}")]
    InvalidBlock(String),

    #[error("Invalid evidence: {0}")]
    InvalidEvidence(String),

    #[error("No validator set for height {0}")]
    NoValidatorSet(u64),

    #[error("Block height mismatch: expected {expected}, got {got}")]
    HeightMismatch { expected: u64, got: u64 },

    #[error("Previous hash mismatch")]
    PrevHashMismatch,

    #[error("Consensus event queue is full")]
    QueueFull,

    #[error("Consensus task stopped")]
    Stopped,

    #[error("Failed to persist block at height {height}: {reason}")]
    Persistence { height: u64, reason: String },

    #[error("State error: {0}")]
    State(#[from] meridian_state::StateError),

    #[error("Core error: {0}")]
    Core(#[from] meridian_core::CoreError),
}
