use meridian_core::{Evidence, EvidenceId};
use meridian_net::EvidenceSource;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::ConsensusError;
use crate::provider::ValidatorSetProvider;

#[derive(Default)]
struct PoolInner {
    pending: BTreeMap<EvidenceId, Evidence>,
    /// Committed evidence ids and the height of the block that included them
    committed: BTreeMap<EvidenceId, u64>,
    /// Evidence below this height is expired
    floor: u64,
}

/// Verified misbehavior evidence waiting for inclusion in a block
pub struct EvidencePool {
    validators: Arc<dyn ValidatorSetProvider>,
    inner: RwLock<PoolInner>,
}

impl EvidencePool {
    pub fn new(validators: Arc<dyn ValidatorSetProvider>) -> Self {
        EvidencePool {
            validators,
            inner: RwLock::new(PoolInner::default()),
        }
    }

    /// Verify and store evidence. Returns false if it was already known.
    pub fn add(&self, evidence: Evidence) -> Result<bool, ConsensusError> {
        let id = evidence.id();
        let duplicate = match &evidence {
            Evidence::DuplicateVote(duplicate) => duplicate,
            Evidence::Unknown(unknown) => {
                return Err(ConsensusError::InvalidEvidence(format!(
                    "cannot verify evidence of kind {}",
                    unknown.tag
                )));
            }
        };

        {
            let inner = self.inner.read();
            if inner.pending.contains_key(&id) || inner.committed.contains_key(&id) {
                return Ok(false);
            }
            if evidence.height() < inner.floor {
                return Err(ConsensusError::InvalidEvidence(format!(
                    "evidence {} from height {} is expired",
                    id,
                    evidence.height()
                )));
            }
        }

        let set = self
            .validators
            .validator_set(evidence.height())
            .ok_or(ConsensusError::NoValidatorSet(evidence.height()))?;
        duplicate.verify(&set)?;

        let mut inner = self.inner.write();
        if inner.committed.contains_key(&id) {
            return Ok(false);
        }
        let added = inner.pending.insert(id, evidence.clone()).is_none();
        if added {
            debug!(
                "Added evidence {} against {} at height {}",
                id,
                evidence.target(),
                evidence.height()
            );
        }
        Ok(added)
    }

    /// Up to `max` pending evidence, oldest height first
    pub fn pending(&self, max: usize) -> Vec<Evidence> {
        let inner = self.inner.read();
        let mut evidence: Vec<Evidence> = inner.pending.values().cloned().collect();
        evidence.sort_by_key(|e| (e.height(), e.id()));
        evidence.truncate(max);
        evidence
    }

    /// Move evidence included in the block at `height` out of the pending set
    pub fn mark_committed(&self, ids: impl IntoIterator<Item = EvidenceId>, height: u64) {
        let mut inner = self.inner.write();
        for id in ids {
            inner.pending.remove(&id);
            inner.committed.insert(id, height);
        }
    }

    /// Drop evidence from heights below `height`
    pub fn prune_below(&self, height: u64) {
        let mut inner = self.inner.write();
        if height <= inner.floor {
            return;
        }
        inner.floor = height;

        let before = inner.pending.len();
        inner.pending.retain(|_, e| e.height() >= height);
        inner.committed.retain(|_, included| *included >= height);
        let pruned = before - inner.pending.len();
        if pruned > 0 {
            debug!("Pruned {} expired evidence below height {}", pruned, height);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().pending.is_empty()
    }
}

impl EvidenceSource for EvidencePool {
    fn get(&self, id: &EvidenceId) -> Option<Evidence> {
        self.inner.read().pending.get(id).cloned()
    }

    fn contains(&self, id: &EvidenceId) -> bool {
        let inner = self.inner.read();
        inner.pending.contains_key(id) || inner.committed.contains_key(id)
    }

    fn ids(&self) -> Vec<EvidenceId> {
        self.inner.read().pending.keys().copied().collect()
    }

    fn insert(&self, evidence: Evidence) -> bool {
        let id = evidence.id();
        match self.add(evidence) {
            Ok(added) => added,
            Err(e) => {
                warn!("Rejected evidence {}: {}", id, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use meridian_core::{
        Address, DuplicateVoteEvidence, Hash, KeyPair, UnknownEvidence, Validator, ValidatorSet,
        Vote, VoteStep,
    };

    fn setup() -> (Vec<KeyPair>, EvidencePool) {
        let keys: Vec<KeyPair> = (1..=4).map(KeyPair::from_seed).collect();
        let set =
            ValidatorSet::new(keys.iter().map(|k| Validator::new(k.public, 1)).collect()).unwrap();
        let provider: Arc<dyn ValidatorSetProvider> = Arc::new(Arc::new(set));
        (keys, EvidencePool::new(provider))
    }

    fn ts() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn equivocation(key: &KeyPair, height: u64, power: u64) -> Evidence {
        let a = Vote::new_signed(key, height, 0, VoteStep::PreVote, Some(Hash([1; 32])), ts())
            .unwrap();
        let b = Vote::new_signed(key, height, 0, VoteStep::PreVote, None, ts()).unwrap();
        DuplicateVoteEvidence::new(a, b, power, 4).unwrap().into()
    }

    #[test]
    fn test_add_and_pending_order() {
        let (keys, pool) = setup();
        let later = equivocation(&keys[0], 9, 1);
        let earlier = equivocation(&keys[1], 3, 1);

        assert!(pool.add(later.clone()).unwrap());
        assert!(pool.add(earlier.clone()).unwrap());
        assert!(!pool.add(earlier.clone()).unwrap());

        assert_eq!(pool.pending(10), vec![earlier.clone(), later]);
        assert_eq!(pool.pending(1), vec![earlier]);
    }

    #[test]
    fn test_rejects_unverifiable() {
        let (keys, pool) = setup();

        // Recorded power disagrees with the validator set
        assert!(pool.add(equivocation(&keys[0], 2, 5)).is_err());
        assert!(pool.add(equivocation(&KeyPair::from_seed(40), 2, 1)).is_err());

        let unknown = Evidence::Unknown(UnknownEvidence {
            id: EvidenceId(Hash([3; 32])),
            tag: "light-client-attack".to_string(),
            height: 2,
            target: Address::default(),
            timestamp: ts(),
        });
        assert!(matches!(
            pool.add(unknown),
            Err(ConsensusError::InvalidEvidence(_))
        ));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_committed_evidence_not_readded() {
        let (keys, pool) = setup();
        let evidence = equivocation(&keys[2], 4, 1);
        pool.add(evidence.clone()).unwrap();

        pool.mark_committed([evidence.id()], 6);
        assert!(pool.is_empty());
        assert!(pool.contains(&evidence.id()));
        assert!(pool.get(&evidence.id()).is_none());
        assert!(!pool.add(evidence).unwrap());
    }

    #[test]
    fn test_prune_expires_old_heights() {
        let (keys, pool) = setup();
        let old = equivocation(&keys[0], 2, 1);
        let fresh = equivocation(&keys[1], 8, 1);
        pool.add(old.clone()).unwrap();
        pool.add(fresh.clone()).unwrap();

        pool.prune_below(5);

        assert_eq!(pool.ids(), vec![fresh.id()]);
        assert!(matches!(
            pool.add(old),
            Err(ConsensusError::InvalidEvidence(_))
        ));
    }

    #[test]
    fn test_insert_from_peer_swallows_errors() {
        let (_, pool) = setup();
        let outsider = equivocation(&KeyPair::from_seed(41), 1, 1);
        assert!(!pool.insert(outsider));
    }
}
