use meridian_core::ValidatorSet;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Source of the active validator set of a height
pub trait ValidatorSetProvider: Send + Sync {
    fn validator_set(&self, height: u64) -> Option<Arc<ValidatorSet>>;
}

/// One set for every height
impl ValidatorSetProvider for Arc<ValidatorSet> {
    fn validator_set(&self, _height: u64) -> Option<Arc<ValidatorSet>> {
        Some(self.clone())
    }
}

/// Validator sets that take effect from a given height onwards
#[derive(Debug, Clone, Default)]
pub struct ValidatorSchedule {
    sets: BTreeMap<u64, Arc<ValidatorSet>>,
}

impl ValidatorSchedule {
    pub fn new(genesis: ValidatorSet) -> Self {
        let mut sets = BTreeMap::new();
        sets.insert(0, Arc::new(genesis));
        ValidatorSchedule { sets }
    }

    /// Switch to `set` starting at `height`
    pub fn schedule(&mut self, height: u64, set: ValidatorSet) {
        self.sets.insert(height, Arc::new(set));
    }
}

impl ValidatorSetProvider for ValidatorSchedule {
    fn validator_set(&self, height: u64) -> Option<Arc<ValidatorSet>> {
        self.sets
            .range(..=height)
            .next_back()
            .map(|(_, set)| set.clone())
    }
}
