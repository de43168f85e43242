pub mod block;
pub mod evidence;
pub mod peer;
pub mod validator;
pub mod vote;

pub use block::{Block, BlockHeader, Commit, CommittedBlock, Proposal};
pub use evidence::{
    DuplicateVoteEvidence, Evidence, EvidenceId, EvidenceRecord, UnknownEvidence,
    DUPLICATE_VOTE_TAG,
};
pub use peer::{Endpoint, Peer};
pub use validator::{Validator, ValidatorSet};
pub use vote::{Vote, VoteStep};
