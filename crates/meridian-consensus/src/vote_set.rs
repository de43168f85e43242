use meridian_core::{Hash, PublicKey, ValidatorSet, Vote, VoteStep};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::ConsensusError;

/// Voting power per candidate value, `None` being nil
pub type VoteTally = BTreeMap<Option<Hash>, u64>;

/// Votes of one (height, round, step). Each validator's first vote counts;
/// its first later vote for a different value is kept as equivocation
/// evidence. Further conflicting votes are rejected without being stored.
#[derive(Debug, Clone)]
pub struct VoteSet {
    height: u64,
    round: u32,
    step: VoteStep,
    validators: Arc<ValidatorSet>,
    votes: BTreeMap<PublicKey, Vote>,
    tally: VoteTally,
    conflicts: BTreeMap<PublicKey, Vote>,
    /// Power per value counting conflicting votes too
    observed: VoteTally,
    observed_pairs: BTreeSet<(PublicKey, Option<Hash>)>,
}

impl VoteSet {
    pub fn new(height: u64, round: u32, step: VoteStep, validators: Arc<ValidatorSet>) -> Self {
        VoteSet {
            height,
            round,
            step,
            validators,
            votes: BTreeMap::new(),
            tally: VoteTally::new(),
            conflicts: BTreeMap::new(),
            observed: VoteTally::new(),
            observed_pairs: BTreeSet::new(),
        }
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn step(&self) -> VoteStep {
        self.step
    }

    /// Record a vote and return the power per value
    pub fn add_vote(&mut self, vote: Vote) -> Result<VoteTally, ConsensusError> {
        if vote.height != self.height || vote.round != self.round || vote.step != self.step {
            return Err(ConsensusError::VoteMismatch {
                height: self.height,
                round: self.round,
                step: self.step,
                got_height: vote.height,
                got_round: vote.round,
                got_step: vote.step,
            });
        }

        let Some(validator) = self.validators.get(&vote.validator) else {
            return Err(ConsensusError::UnknownValidator(vote.validator.to_hex()));
        };
        let power = validator.power;
        vote.verify()
            .map_err(|_| ConsensusError::InvalidSignature)?;

        if let Some(existing) = self.votes.get(&vote.validator) {
            if existing.block_hash == vote.block_hash {
                return Ok(self.tally.clone());
            }

            warn!(
                "Equivocation by {} at height {} round {}: {} and {}",
                vote.validator, self.height, self.round, existing, vote
            );
            let existing = Box::new(existing.clone());
            if !self.conflicts.contains_key(&vote.validator) {
                self.observe(&vote, power);
                self.conflicts.insert(vote.validator, vote.clone());
            }
            return Err(ConsensusError::DuplicateVote {
                existing,
                conflicting: Box::new(vote),
            });
        }

        debug!(
            "Added {} from {} at height {}",
            vote.step, vote.validator, self.height
        );
        self.observe(&vote, power);
        *self.tally.entry(vote.block_hash).or_insert(0) += power;
        self.votes.insert(vote.validator, vote);
        Ok(self.tally.clone())
    }

    fn observe(&mut self, vote: &Vote, power: u64) {
        if self.observed_pairs.insert((vote.validator, vote.block_hash)) {
            *self.observed.entry(vote.block_hash).or_insert(0) += power;
        }
    }

    pub fn tally(&self) -> &VoteTally {
        &self.tally
    }

    pub fn power_for(&self, value: &Option<Hash>) -> u64 {
        self.tally.get(value).copied().unwrap_or(0)
    }

    /// Power of all counted votes regardless of value
    pub fn voted_power(&self) -> u64 {
        self.tally.values().sum()
    }

    pub fn total_power(&self) -> u64 {
        self.validators.total_power()
    }

    /// More than two thirds of the power voted for `value`
    pub fn has_quorum(&self, value: &Option<Hash>) -> bool {
        self.validators.is_quorum(self.power_for(value))
    }

    /// The value holding a quorum, if any
    pub fn quorum_value(&self) -> Option<Option<Hash>> {
        self.tally
            .iter()
            .find(|(_, power)| self.validators.is_quorum(**power))
            .map(|(value, _)| *value)
    }

    /// More than two thirds of the power voted, for any mix of values
    pub fn has_two_thirds_any(&self) -> bool {
        self.validators.is_quorum(self.voted_power())
    }

    /// More than one third of the power voted, so at least one honest
    /// validator is among the voters
    pub fn has_one_third_any(&self) -> bool {
        self.validators.is_one_third(self.voted_power())
    }

    pub fn get(&self, validator: &PublicKey) -> Option<&Vote> {
        self.votes.get(validator)
    }

    pub fn votes(&self) -> impl Iterator<Item = &Vote> {
        self.votes.values()
    }

    /// Counted votes for `value`, ordered by validator key
    pub fn votes_for(&self, value: &Option<Hash>) -> Vec<Vote> {
        self.votes
            .values()
            .filter(|vote| vote.block_hash == *value)
            .cloned()
            .collect()
    }

    pub fn voters(&self) -> impl Iterator<Item = &PublicKey> {
        self.votes.keys()
    }

    pub fn len(&self) -> usize {
        self.votes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }

    /// First vote rejected per signer that had already voted differently
    pub fn conflicts(&self) -> impl Iterator<Item = &Vote> {
        self.conflicts.values()
    }

    /// Two values both above two thirds once equivocations are counted
    /// means more than a third of the power is byzantine
    pub fn safety_check(&self) -> Result<(), ConsensusError> {
        let values: Vec<Option<Hash>> = self
            .observed
            .iter()
            .filter(|(_, power)| self.validators.is_quorum(**power))
            .map(|(value, _)| *value)
            .collect();

        if values.len() > 1 {
            return Err(ConsensusError::SafetyViolation {
                height: self.height,
                round: self.round,
                step: self.step,
                values,
            });
        }
        Ok(())
    }
}
