use meridian_core::{PublicKey, ValidatorSet};

/// Chooses the proposer of a round. Must be a pure function of its inputs
/// so every validator agrees.
pub trait ProposerSelector: Send + Sync {
    fn proposer(&self, height: u64, round: u32, validators: &ValidatorSet) -> Option<PublicKey>;

    fn is_proposer(
        &self,
        key: &PublicKey,
        height: u64,
        round: u32,
        validators: &ValidatorSet,
    ) -> bool {
        self.proposer(height, round, validators).as_ref() == Some(key)
    }
}

/// Every validator in turn, regardless of power
#[derive(Debug, Clone, Copy, Default)]
pub struct RoundRobin;

impl ProposerSelector for RoundRobin {
    fn proposer(&self, height: u64, round: u32, validators: &ValidatorSet) -> Option<PublicKey> {
        if validators.is_empty() {
            return None;
        }
        let slot = height.wrapping_add(round as u64) % validators.len() as u64;
        validators.validators().get(slot as usize).map(|v| v.public_key)
    }
}

/// Validators propose in proportion to their voting power
#[derive(Debug, Clone, Copy, Default)]
pub struct WeightedRoundRobin;

impl ProposerSelector for WeightedRoundRobin {
    fn proposer(&self, height: u64, round: u32, validators: &ValidatorSet) -> Option<PublicKey> {
        let total = validators.total_power();
        if total == 0 {
            return None;
        }
        let mut slot = height.wrapping_add(round as u64) % total;
        for validator in validators.iter() {
            if slot < validator.power {
                return Some(validator.public_key);
            }
            slot -= validator.power;
        }
        None
    }
}
