use chrono::{DateTime, Utc};
use meridian_core::{Block, Evidence, EvidenceId, Hash, PublicKey};
use std::collections::BTreeSet;
use tracing::{debug, info};

use crate::error::ConsensusError;
use crate::provider::ValidatorSetProvider;

/// Configuration for block building
#[derive(Debug, Clone)]
pub struct BlockBuilderConfig {
    /// Maximum evidence items per block
    pub max_evidence: usize,
    /// Evidence more than this many heights below the block is expired
    pub max_evidence_age: u64,
}

impl Default for BlockBuilderConfig {
    fn default() -> Self {
        BlockBuilderConfig {
            max_evidence: 16,
            max_evidence_age: 100,
        }
    }
}

/// Assembles proposals and checks the blocks other validators propose
#[derive(Debug, Clone, Default)]
pub struct BlockBuilder {
    config: BlockBuilderConfig,
}

impl BlockBuilder {
    pub fn new(config: BlockBuilderConfig) -> Self {
        BlockBuilder { config }
    }

    /// Evidence from `evidence_height` can no longer go into a block at
    /// `block_height`
    pub fn is_expired(&self, evidence_height: u64, block_height: u64) -> bool {
        evidence_height.saturating_add(self.config.max_evidence_age) < block_height
    }

    /// Build the block for `height` on top of `prev_hash`
    pub fn build_block(
        &self,
        height: u64,
        prev_hash: Hash,
        proposer: PublicKey,
        timestamp: DateTime<Utc>,
        payload: Vec<u8>,
        pending_evidence: Vec<Evidence>,
    ) -> Block {
        info!("Building block at height {}", height);

        let offered = pending_evidence.len();
        let mut seen = BTreeSet::new();
        let evidence: Vec<Evidence> = pending_evidence
            .into_iter()
            .filter(|e| !e.is_unknown() && e.height() < height)
            .filter(|e| !self.is_expired(e.height(), height))
            .filter(|e| seen.insert(e.id()))
            .take(self.config.max_evidence)
            .collect();
        debug!(
            "Including {} of {} pending evidence in block {}",
            evidence.len(),
            offered,
            height
        );

        Block::new(height, prev_hash, proposer, timestamp, payload, evidence)
    }

    /// Validate a proposed block against the chain position it claims.
    /// `is_committed` reports evidence already included in an earlier block.
    pub fn validate_block(
        &self,
        block: &Block,
        expected_height: u64,
        prev_hash: Hash,
        validators: &dyn ValidatorSetProvider,
        is_committed: impl Fn(&EvidenceId) -> bool,
    ) -> Result<(), ConsensusError> {
        if block.header.height != expected_height {
            return Err(ConsensusError::HeightMismatch {
                expected: expected_height,
                got: block.header.height,
            });
        }

        if block.header.prev_hash != prev_hash {
            return Err(ConsensusError::PrevHashMismatch);
        }

        // A re-proposed block keeps the header of the round that built it,
        // so only membership is checked here
        let active = validators
            .validator_set(expected_height)
            .ok_or(ConsensusError::NoValidatorSet(expected_height))?;
        if !active.contains(&block.header.proposer) {
            return Err(ConsensusError::InvalidBlock(format!(
                "built by non-validator {}",
                block.header.proposer
            )));
        }

        if !block.verify_body() {
            return Err(ConsensusError::InvalidBlock(
                "header does not match body".to_string(),
            ));
        }

        if block.evidence.len() > self.config.max_evidence {
            return Err(ConsensusError::InvalidBlock(format!(
                "{} evidence items exceed limit of {}",
                block.evidence.len(),
                self.config.max_evidence
            )));
        }

        let mut seen = BTreeSet::new();
        for evidence in &block.evidence {
            let id = evidence.id();
            if !seen.insert(id) {
                return Err(ConsensusError::InvalidBlock(format!(
                    "evidence {} included twice",
                    id
                )));
            }
            if is_committed(&id) {
                return Err(ConsensusError::InvalidBlock(format!(
                    "evidence {} was already committed",
                    id
                )));
            }
            if self.is_expired(evidence.height(), expected_height) {
                return Err(ConsensusError::InvalidBlock(format!(
                    "evidence {} from height {} is expired",
                    id,
                    evidence.height()
                )));
            }

            match evidence {
                Evidence::DuplicateVote(duplicate) => {
                    if duplicate.height() >= expected_height {
                        return Err(ConsensusError::InvalidBlock(format!(
                            "evidence {} from height {} is not in the past",
                            duplicate.id(),
                            duplicate.height()
                        )));
                    }
                    let set = validators
                        .validator_set(duplicate.height())
                        .ok_or(ConsensusError::NoValidatorSet(duplicate.height()))?;
                    duplicate.verify(&set)?;
                }
                Evidence::Unknown(unknown) => {
                    return Err(ConsensusError::InvalidBlock(format!(
                        "unverifiable evidence {} of kind {}",
                        unknown.id, unknown.tag
                    )));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::{DuplicateVoteEvidence, KeyPair, Validator, ValidatorSet, Vote, VoteStep};
    use std::sync::Arc;

    fn setup() -> (Vec<KeyPair>, Arc<ValidatorSet>, BlockBuilder) {
        let keys: Vec<KeyPair> = (1..=4).map(KeyPair::from_seed).collect();
        let set = Arc::new(
            ValidatorSet::new(keys.iter().map(|k| Validator::new(k.public, 1)).collect()).unwrap(),
        );
        let builder = BlockBuilder::new(BlockBuilderConfig {
            max_evidence: 2,
            max_evidence_age: 100,
        });
        (keys, set, builder)
    }

    fn ts() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn equivocation(key: &KeyPair, height: u64) -> Evidence {
        let a = Vote::new_signed(key, height, 0, VoteStep::PreVote, Some(Hash([1; 32])), ts())
            .unwrap();
        let b = Vote::new_signed(key, height, 0, VoteStep::PreVote, Some(Hash([2; 32])), ts())
            .unwrap();
        DuplicateVoteEvidence::new(a, b, 1, 4).unwrap().into()
    }

    #[test]
    fn test_build_and_validate_block() {
        let (keys, set, builder) = setup();
        let prev = Hash([9; 32]);

        let block = builder.build_block(
            5,
            prev,
            keys[0].public,
            ts(),
            b"payload".to_vec(),
            vec![equivocation(&keys[1], 3)],
        );

        assert_eq!(block.height(), 5);
        assert_eq!(block.evidence.len(), 1);
        builder
            .validate_block(&block, 5, prev, &set, |_| false)
            .unwrap();
    }

    #[test]
    fn test_evidence_limited_and_filtered() {
        let (keys, _, builder) = setup();
        let pending = vec![
            equivocation(&keys[1], 2),
            // Same height as the block being built
            equivocation(&keys[2], 4),
            equivocation(&keys[2], 1),
            equivocation(&keys[3], 1),
        ];

        let block = builder.build_block(4, Hash::ZERO, keys[0].public, ts(), vec![], pending);

        assert_eq!(block.evidence.len(), 2);
        assert!(block.evidence.iter().all(|e| e.height() < 4));
    }

    #[test]
    fn test_validate_rejects_wrong_position() {
        let (keys, set, builder) = setup();
        let block = builder.build_block(2, Hash([1; 32]), keys[0].public, ts(), vec![], vec![]);

        assert!(matches!(
            builder.validate_block(&block, 3, Hash([1; 32]), &set, |_| false),
            Err(ConsensusError::HeightMismatch { expected: 3, got: 2 })
        ));
        assert!(matches!(
            builder.validate_block(&block, 2, Hash::ZERO, &set, |_| false),
            Err(ConsensusError::PrevHashMismatch)
        ));

        let outsider = KeyPair::from_seed(50);
        let foreign = builder.build_block(2, Hash([1; 32]), outsider.public, ts(), vec![], vec![]);
        assert!(matches!(
            builder.validate_block(&foreign, 2, Hash([1; 32]), &set, |_| false),
            Err(ConsensusError::InvalidBlock(_))
        ));
    }

    #[test]
    fn test_evidence_deduplicated_and_expired_when_building() {
        let (keys, _, builder) = setup();
        let repeated = equivocation(&keys[1], 150);
        let pending = vec![repeated.clone(), repeated, equivocation(&keys[2], 1)];

        let block = builder.build_block(200, Hash::ZERO, keys[0].public, ts(), vec![], pending);
        assert_eq!(block.evidence.len(), 1);
        assert_eq!(block.evidence[0].height(), 150);
    }

    #[test]
    fn test_validate_rejects_reused_evidence() {
        let (keys, set, builder) = setup();
        let evidence = equivocation(&keys[1], 4);
        let id = evidence.id();

        let first = Block::new(5, Hash::ZERO, keys[0].public, ts(), vec![], vec![evidence.clone()]);
        builder
            .validate_block(&first, 5, Hash::ZERO, &set, |_| false)
            .unwrap();

        let twice = Block::new(
            6,
            Hash::ZERO,
            keys[0].public,
            ts(),
            vec![],
            vec![evidence.clone(), evidence.clone()],
        );
        assert!(matches!(
            builder.validate_block(&twice, 6, Hash::ZERO, &set, |_| false),
            Err(ConsensusError::InvalidBlock(_))
        ));

        let again = Block::new(6, Hash::ZERO, keys[0].public, ts(), vec![], vec![evidence]);
        assert!(matches!(
            builder.validate_block(&again, 6, Hash::ZERO, &set, |seen| *seen == id),
            Err(ConsensusError::InvalidBlock(_))
        ));
    }

    #[test]
    fn test_validate_rejects_expired_evidence() {
        let (keys, set, builder) = setup();
        let old = equivocation(&keys[1], 1);
        let block = Block::new(102, Hash::ZERO, keys[0].public, ts(), vec![], vec![old]);

        assert!(builder.is_expired(1, 102));
        assert!(!builder.is_expired(2, 102));
        assert!(matches!(
            builder.validate_block(&block, 102, Hash::ZERO, &set, |_| false),
            Err(ConsensusError::InvalidBlock(_))
        ));
    }

    #[test]
    fn test_validate_rejects_tampered_body() {
        let (keys, set, builder) = setup();
        let mut block = builder.build_block(1, Hash::ZERO, keys[0].public, ts(), vec![1], vec![]);
        block.payload = vec![2];

        assert!(matches!(
            builder.validate_block(&block, 1, Hash::ZERO, &set, |_| false),
            Err(ConsensusError::InvalidBlock(_))
        ));
    }

    #[test]
    fn test_validate_rejects_evidence_from_outsider() {
        let (keys, set, builder) = setup();
        let outsider = KeyPair::from_seed(50);
        let block = builder.build_block(
            3,
            Hash::ZERO,
            keys[0].public,
            ts(),
            vec![],
            vec![equivocation(&outsider, 1)],
        );

        assert!(matches!(
            builder.validate_block(&block, 3, Hash::ZERO, &set, |_| false),
            Err(ConsensusError::Core(_))
        ));
    }
}
