use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::crypto::{sign_body, verify_body, Address, Hash, KeyPair, PublicKey, Sig};
use crate::error::CoreError;

/// The voting step a vote belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VoteStep {
    PreVote,
    PreCommit,
}

impl fmt::Display for VoteStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoteStep::PreVote => write!(f, "prevote"),
            VoteStep::PreCommit => write!(f, "precommit"),
        }
    }
}

/// A signed vote for a block hash, or for nil when `block_hash` is `None`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub height: u64,
    pub round: u32,
    pub step: VoteStep,
    pub block_hash: Option<Hash>,
    pub validator: PublicKey,
    pub timestamp: DateTime<Utc>,
    pub signature: Sig,
}

#[derive(Serialize)]
struct VoteBody<'a> {
    height: u64,
    round: u32,
    step: VoteStep,
    block_hash: &'a Option<Hash>,
    validator: &'a PublicKey,
    timestamp: &'a DateTime<Utc>,
}

impl Vote {
    /// Create and sign a vote
    pub fn new_signed(
        keypair: &KeyPair,
        height: u64,
        round: u32,
        step: VoteStep,
        block_hash: Option<Hash>,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, CoreError> {
        let mut vote = Vote {
            height,
            round,
            step,
            block_hash,
            validator: keypair.public,
            timestamp,
            signature: Sig::default(),
        };
        vote.signature = sign_body(&keypair.secret, &vote.body())?;
        Ok(vote)
    }

    fn body(&self) -> VoteBody<'_> {
        VoteBody {
            height: self.height,
            round: self.round,
            step: self.step,
            block_hash: &self.block_hash,
            validator: &self.validator,
            timestamp: &self.timestamp,
        }
    }

    /// Verify the vote was signed by `validator`
    pub fn verify(&self) -> Result<(), CoreError> {
        verify_body(&self.validator, &self.body(), &self.signature)
    }

    pub fn validator_address(&self) -> Address {
        self.validator.address()
    }

    pub fn is_nil(&self) -> bool {
        self.block_hash.is_none()
    }

    /// Same signer and (height, round, step) but a different value
    pub fn conflicts_with(&self, other: &Vote) -> bool {
        self.validator == other.validator
            && self.height == other.height
            && self.round == other.round
            && self.step == other.step
            && self.block_hash != other.block_hash
    }
}

impl fmt::Display for Vote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match &self.block_hash {
            Some(hash) => hash.short(),
            None => "nil".to_string(),
        };
        write!(
            f,
            "{} {}/{} for {} by {}",
            self.step,
            self.height,
            self.round,
            value,
            self.validator_address()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash_blake3;

    fn ts() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_vote_signature_roundtrip() {
        let kp = KeyPair::generate();
        let vote = Vote::new_signed(&kp, 5, 0, VoteStep::PreVote, Some(hash_blake3(b"b")), ts()).unwrap();
        vote.verify().unwrap();
    }

    #[test]
    fn test_tampered_vote_fails_verification() {
        let kp = KeyPair::generate();
        let mut vote = Vote::new_signed(&kp, 5, 0, VoteStep::PreVote, None, ts()).unwrap();
        vote.round = 1;
        assert!(matches!(vote.verify(), Err(CoreError::InvalidSignature)));
    }

    #[test]
    fn test_conflicts_with() {
        let kp = KeyPair::generate();
        let a = Vote::new_signed(&kp, 5, 0, VoteStep::PreVote, Some(hash_blake3(b"a")), ts()).unwrap();
        let b = Vote::new_signed(&kp, 5, 0, VoteStep::PreVote, Some(hash_blake3(b"b")), ts()).unwrap();
        let nil = Vote::new_signed(&kp, 5, 0, VoteStep::PreVote, None, ts()).unwrap();
        let later = Vote::new_signed(&kp, 5, 1, VoteStep::PreVote, Some(hash_blake3(b"b")), ts()).unwrap();

        assert!(a.conflicts_with(&b));
        assert!(a.conflicts_with(&nil));
        assert!(!a.conflicts_with(&a.clone()));
        assert!(!a.conflicts_with(&later));
    }
}
