use meridian_core::{Hash, VoteStep};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RoundStep {
    /// Waiting out the commit timeout before round 0 of a new height
    NewHeight,
    Propose,
    PreVote,
    PreCommit,
}

impl From<VoteStep> for RoundStep {
    fn from(step: VoteStep) -> Self {
        match step {
            VoteStep::PreVote => RoundStep::PreVote,
            VoteStep::PreCommit => RoundStep::PreCommit,
        }
    }
}

impl fmt::Display for RoundStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoundStep::NewHeight => write!(f, "new-height"),
            RoundStep::Propose => write!(f, "propose"),
            RoundStep::PreVote => write!(f, "prevote"),
            RoundStep::PreCommit => write!(f, "precommit"),
        }
    }
}

/// Position and locks of the state machine within a height
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundState {
    pub height: u64,
    pub round: u32,
    pub step: RoundStep,
    /// Value precommitted at `locked_round`
    pub locked_value: Option<Hash>,
    pub locked_round: Option<u32>,
    /// Most recent value seen with a prevote quorum
    pub valid_value: Option<Hash>,
    pub valid_round: Option<u32>,
    /// Block hash proposed for the current round
    pub proposal: Option<Hash>,
}

impl RoundState {
    pub fn new(height: u64) -> Self {
        RoundState {
            height,
            round: 0,
            step: RoundStep::NewHeight,
            locked_value: None,
            locked_round: None,
            valid_value: None,
            valid_round: None,
            proposal: None,
        }
    }

    /// Enter `round` at the propose step, keeping locks
    pub fn enter_round(&mut self, round: u32) {
        self.round = round;
        self.step = RoundStep::Propose;
        self.proposal = None;
    }

    pub fn lock(&mut self, value: Hash, round: u32) {
        self.locked_value = Some(value);
        self.locked_round = Some(round);
    }

    /// Whether the lock allows voting for `value` in a proposal carrying
    /// proof-of-lock round `pol_round`
    pub fn lock_permits(&self, value: &Hash, pol_round: Option<u32>) -> bool {
        match (self.locked_round, pol_round) {
            (None, _) => true,
            (Some(_), _) if self.locked_value.as_ref() == Some(value) => true,
            (Some(locked), Some(pol)) => locked <= pol,
            (Some(_), None) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_rules() {
        let mut state = RoundState::new(1);
        let a = Hash([1; 32]);
        let b = Hash([2; 32]);
        assert!(state.lock_permits(&b, None));

        state.lock(a, 1);
        assert!(state.lock_permits(&a, None));
        assert!(!state.lock_permits(&b, None));
        // A prevote quorum for b from a round at or after the lock unlocks
        assert!(!state.lock_permits(&b, Some(0)));
        assert!(state.lock_permits(&b, Some(1)));
        assert!(state.lock_permits(&b, Some(2)));
    }

    #[test]
    fn test_enter_round_keeps_lock() {
        let mut state = RoundState::new(3);
        state.lock(Hash([7; 32]), 0);
        state.step = RoundStep::PreCommit;
        state.enter_round(1);

        assert_eq!(state.step, RoundStep::Propose);
        assert_eq!(state.locked_round, Some(0));
    }
}
