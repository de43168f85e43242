use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::crypto::{hash_blake3, sign_body, verify_body, Hash, KeyPair, PublicKey, Sig};
use crate::error::CoreError;
use crate::serialize;
use crate::types::evidence::Evidence;
use crate::types::validator::ValidatorSet;
use crate::types::vote::{Vote, VoteStep};

/// Block header containing metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Block height (0 for genesis)
    pub height: u64,
    /// Hash of the previous block (zeros for genesis)
    pub prev_hash: Hash,
    pub timestamp: DateTime<Utc>,
    pub proposer: PublicKey,
    /// Hash of the opaque payload handed to the execution engine
    pub payload_hash: Hash,
    /// Hash over the ids of the included evidence
    pub evidence_hash: Hash,
}

impl BlockHeader {
    /// Compute the hash of this header
    pub fn hash(&self) -> Result<Hash, CoreError> {
        let bytes = serialize::to_bytes(self)?;
        Ok(hash_blake3(&bytes))
    }
}

/// A block. The payload is only interpreted by the execution engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub payload: Vec<u8>,
    pub evidence: Vec<Evidence>,
}

impl Block {
    pub fn new(
        height: u64,
        prev_hash: Hash,
        proposer: PublicKey,
        timestamp: DateTime<Utc>,
        payload: Vec<u8>,
        evidence: Vec<Evidence>,
    ) -> Self {
        let header = BlockHeader {
            height,
            prev_hash,
            timestamp,
            proposer,
            payload_hash: hash_blake3(&payload),
            evidence_hash: Self::compute_evidence_hash(&evidence),
        };
        Block {
            header,
            payload,
            evidence,
        }
    }

    /// Compute the block hash (hash of header)
    pub fn hash(&self) -> Result<Hash, CoreError> {
        self.header.hash()
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    fn compute_evidence_hash(evidence: &[Evidence]) -> Hash {
        let mut data = Vec::with_capacity(evidence.len() * Hash::LEN);
        for item in evidence {
            data.extend_from_slice(item.id().as_bytes());
        }
        hash_blake3(&data)
    }

    /// Check that the header commits to the body
    pub fn verify_body(&self) -> bool {
        self.header.payload_hash == hash_blake3(&self.payload)
            && self.header.evidence_hash == Self::compute_evidence_hash(&self.evidence)
    }
}

/// Precommits that committed a block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub height: u64,
    pub round: u32,
    pub block_hash: Hash,
    pub votes: Vec<Vote>,
}

impl Commit {
    /// Verify the votes form a precommit quorum for `block_hash` under `validators`
    pub fn verify(&self, validators: &ValidatorSet) -> Result<(), CoreError> {
        let mut seen = HashSet::new();
        let mut power = 0u64;

        for vote in &self.votes {
            if vote.step != VoteStep::PreCommit
                || vote.height != self.height
                || vote.round != self.round
                || vote.block_hash != Some(self.block_hash)
            {
                return Err(CoreError::InvalidCommit(format!("unexpected vote: {}", vote)));
            }
            if !seen.insert(vote.validator) {
                return Err(CoreError::InvalidCommit(format!(
                    "duplicate vote from {}",
                    vote.validator
                )));
            }
            let validator = validators.get(&vote.validator).ok_or_else(|| {
                CoreError::InvalidCommit(format!("unknown validator {}", vote.validator))
            })?;
            vote.verify()?;
            power += validator.power;
        }

        if !validators.is_quorum(power) {
            return Err(CoreError::InvalidCommit(format!(
                "insufficient power: {} of {}",
                power,
                validators.total_power()
            )));
        }
        Ok(())
    }
}

/// A committed block with the quorum that committed it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommittedBlock {
    pub block: Block,
    pub commit: Commit,
}

/// A block proposed for (height, round) by the round's proposer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub height: u64,
    pub round: u32,
    pub block: Block,
    /// Round of the proof-of-lock this block was re-proposed from
    pub valid_round: Option<u32>,
    pub proposer: PublicKey,
    pub signature: Sig,
}

#[derive(Serialize)]
struct ProposalBody {
    height: u64,
    round: u32,
    block_hash: Hash,
    valid_round: Option<u32>,
    proposer: PublicKey,
}

impl Proposal {
    pub fn new_signed(
        keypair: &KeyPair,
        height: u64,
        round: u32,
        block: Block,
        valid_round: Option<u32>,
    ) -> Result<Self, CoreError> {
        let body = ProposalBody {
            height,
            round,
            block_hash: block.hash()?,
            valid_round,
            proposer: keypair.public,
        };
        let signature = sign_body(&keypair.secret, &body)?;
        Ok(Proposal {
            height,
            round,
            block,
            valid_round,
            proposer: keypair.public,
            signature,
        })
    }

    pub fn block_hash(&self) -> Result<Hash, CoreError> {
        self.block.hash()
    }

    /// Verify the proposer's signature over the proposal
    pub fn verify(&self) -> Result<(), CoreError> {
        let body = ProposalBody {
            height: self.height,
            round: self.round,
            block_hash: self.block.hash()?,
            valid_round: self.valid_round,
            proposer: self.proposer,
        };
        verify_body(&self.proposer, &body, &self.signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::validator::Validator;

    fn ts() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn test_block(proposer: &KeyPair) -> Block {
        Block::new(1, Hash::ZERO, proposer.public, ts(), b"payload".to_vec(), vec![])
    }

    #[test]
    fn test_block_hash_deterministic() {
        let proposer = KeyPair::generate();
        let block = test_block(&proposer);
        assert_eq!(block.hash().unwrap(), block.hash().unwrap());
        assert!(block.verify_body());
    }

    #[test]
    fn test_tampered_payload_detected() {
        let proposer = KeyPair::generate();
        let mut block = test_block(&proposer);
        block.payload = b"other".to_vec();
        assert!(!block.verify_body());
    }

    #[test]
    fn test_proposal_signature() {
        let proposer = KeyPair::generate();
        let proposal = Proposal::new_signed(&proposer, 1, 0, test_block(&proposer), None).unwrap();
        proposal.verify().unwrap();

        let mut forged = proposal.clone();
        forged.round = 2;
        assert!(forged.verify().is_err());
    }

    #[test]
    fn test_commit_verification() {
        let keys: Vec<KeyPair> = (1..=4).map(KeyPair::from_seed).collect();
        let set = ValidatorSet::new(keys.iter().map(|k| Validator::new(k.public, 1)).collect()).unwrap();
        let block = test_block(&keys[0]);
        let hash = block.hash().unwrap();

        let votes: Vec<Vote> = keys[..3]
            .iter()
            .map(|k| Vote::new_signed(k, 1, 0, VoteStep::PreCommit, Some(hash), ts()).unwrap())
            .collect();
        let commit = Commit { height: 1, round: 0, block_hash: hash, votes: votes.clone() };
        commit.verify(&set).unwrap();

        let short = Commit { height: 1, round: 0, block_hash: hash, votes: votes[..2].to_vec() };
        assert!(matches!(short.verify(&set), Err(CoreError::InvalidCommit(_))));

        let mut doubled = votes[..2].to_vec();
        doubled.push(votes[0].clone());
        let doubled = Commit { height: 1, round: 0, block_hash: hash, votes: doubled };
        assert!(doubled.verify(&set).is_err());
    }
}
