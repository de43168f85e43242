use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::crypto::{Address, PublicKey};
use crate::error::CoreError;

/// A consensus participant and its voting power
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Validator {
    pub public_key: PublicKey,
    pub power: u64,
}

impl Validator {
    pub fn new(public_key: PublicKey, power: u64) -> Self {
        Validator { public_key, power }
    }

    pub fn address(&self) -> Address {
        self.public_key.address()
    }
}

/// The validators active at one height.
///
/// Validators are kept sorted by public key so every node derives the same
/// ordering (and therefore the same proposer schedule) from the same set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorSet {
    validators: Vec<Validator>,
    total_power: u64,
}

impl ValidatorSet {
    pub fn new(mut validators: Vec<Validator>) -> Result<Self, CoreError> {
        let mut seen = HashSet::new();
        for validator in &validators {
            if !seen.insert(validator.public_key) {
                return Err(CoreError::InvalidValidatorSet(format!(
                    "duplicate validator {}",
                    validator.public_key
                )));
            }
        }

        let total_power = validators
            .iter()
            .try_fold(0u64, |acc, v| acc.checked_add(v.power))
            .ok_or_else(|| CoreError::InvalidValidatorSet("total power overflows".to_string()))?;

        validators.sort_by(|a, b| a.public_key.cmp(&b.public_key));

        Ok(ValidatorSet {
            validators,
            total_power,
        })
    }

    pub fn total_power(&self) -> u64 {
        self.total_power
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn validators(&self) -> &[Validator] {
        &self.validators
    }

    pub fn iter(&self) -> impl Iterator<Item = &Validator> {
        self.validators.iter()
    }

    pub fn get(&self, public_key: &PublicKey) -> Option<&Validator> {
        self.validators.iter().find(|v| &v.public_key == public_key)
    }

    pub fn get_by_address(&self, address: &Address) -> Option<&Validator> {
        self.validators.iter().find(|v| &v.address() == address)
    }

    pub fn contains(&self, public_key: &PublicKey) -> bool {
        self.get(public_key).is_some()
    }

    /// Voting power of a validator, zero if not in the set
    pub fn power_of(&self, public_key: &PublicKey) -> u64 {
        self.get(public_key).map(|v| v.power).unwrap_or(0)
    }

    /// True iff `power` is strictly more than two thirds of the total
    pub fn is_quorum(&self, power: u64) -> bool {
        self.total_power > 0 && (power as u128) * 3 > (self.total_power as u128) * 2
    }

    /// True iff `power` is strictly more than one third of the total
    /// (at least one honest validator is among the holders)
    pub fn is_one_third(&self, power: u64) -> bool {
        self.total_power > 0 && (power as u128) * 3 > self.total_power as u128
    }
}
