use meridian_core::{Hash, PublicKey, ValidatorSet, Vote, VoteStep};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::error::ConsensusError;
use crate::vote_set::{VoteSet, VoteTally};

#[derive(Debug, Clone)]
struct RoundVotes {
    prevotes: VoteSet,
    precommits: VoteSet,
}

/// All vote sets of one height, created per round on first use
#[derive(Debug, Clone)]
pub struct HeightVoteSet {
    height: u64,
    validators: Arc<ValidatorSet>,
    rounds: BTreeMap<u32, RoundVotes>,
}

impl HeightVoteSet {
    pub fn new(height: u64, validators: Arc<ValidatorSet>) -> Self {
        HeightVoteSet {
            height,
            validators,
            rounds: BTreeMap::new(),
        }
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn add_vote(&mut self, vote: Vote) -> Result<VoteTally, ConsensusError> {
        if vote.height != self.height {
            return Err(ConsensusError::VoteMismatch {
                height: self.height,
                round: vote.round,
                step: vote.step,
                got_height: vote.height,
                got_round: vote.round,
                got_step: vote.step,
            });
        }
        // Outsiders and forged votes must not allocate rounds
        if !self.validators.contains(&vote.validator) {
            return Err(ConsensusError::UnknownValidator(vote.validator.to_hex()));
        }
        if !self.rounds.contains_key(&vote.round) {
            vote.verify().map_err(|_| ConsensusError::InvalidSignature)?;
        }

        let height = self.height;
        let validators = &self.validators;
        let round = self.rounds.entry(vote.round).or_insert_with(|| RoundVotes {
            prevotes: VoteSet::new(height, vote.round, VoteStep::PreVote, validators.clone()),
            precommits: VoteSet::new(height, vote.round, VoteStep::PreCommit, validators.clone()),
        });

        match vote.step {
            VoteStep::PreVote => round.prevotes.add_vote(vote),
            VoteStep::PreCommit => round.precommits.add_vote(vote),
        }
    }

    pub fn prevotes(&self, round: u32) -> Option<&VoteSet> {
        self.rounds.get(&round).map(|r| &r.prevotes)
    }

    pub fn precommits(&self, round: u32) -> Option<&VoteSet> {
        self.rounds.get(&round).map(|r| &r.precommits)
    }

    pub fn vote_set(&self, round: u32, step: VoteStep) -> Option<&VoteSet> {
        match step {
            VoteStep::PreVote => self.prevotes(round),
            VoteStep::PreCommit => self.precommits(round),
        }
    }

    /// Rounds with at least one vote, ascending
    pub fn rounds(&self) -> impl Iterator<Item = u32> + '_ {
        self.rounds.keys().copied()
    }

    /// Highest round with a prevote quorum for a block, and that block
    pub fn pol_round(&self) -> Option<(u32, Hash)> {
        self.rounds.iter().rev().find_map(|(round, votes)| match votes.prevotes.quorum_value() {
            Some(Some(hash)) => Some((*round, hash)),
            _ => None,
        })
    }

    /// Power of distinct validators that voted in `round` at any step
    pub fn round_participation(&self, round: u32) -> u64 {
        let Some(votes) = self.rounds.get(&round) else {
            return 0;
        };
        let voters: BTreeSet<&PublicKey> = votes
            .prevotes
            .voters()
            .chain(votes.precommits.voters())
            .collect();
        voters
            .into_iter()
            .map(|key| self.validators.power_of(key))
            .sum()
    }

    /// Highest round above `current` where more than a third of the power
    /// already participates
    pub fn skip_round(&self, current: u32) -> Option<u32> {
        self.rounds
            .range(current.saturating_add(1)..)
            .rev()
            .map(|(round, _)| *round)
            .find(|round| {
                self.validators
                    .is_one_third(self.round_participation(*round))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use meridian_core::{KeyPair, Validator};

    fn setup() -> (Vec<KeyPair>, HeightVoteSet) {
        let keys: Vec<KeyPair> = (1..=4).map(KeyPair::from_seed).collect();
        let validators = keys.iter().map(|k| Validator::new(k.public, 1)).collect();
        let set = ValidatorSet::new(validators).unwrap();
        (keys, HeightVoteSet::new(7, Arc::new(set)))
    }

    fn vote(key: &KeyPair, round: u32, step: VoteStep, value: Option<Hash>) -> Vote {
        let ts = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        Vote::new_signed(key, 7, round, step, value, ts).unwrap()
    }

    #[test]
    fn test_votes_routed_by_round_and_step() {
        let (keys, mut votes) = setup();
        votes.add_vote(vote(&keys[0], 0, VoteStep::PreVote, None)).unwrap();
        votes.add_vote(vote(&keys[0], 0, VoteStep::PreCommit, None)).unwrap();
        votes.add_vote(vote(&keys[1], 2, VoteStep::PreVote, None)).unwrap();

        assert_eq!(votes.prevotes(0).unwrap().len(), 1);
        assert_eq!(votes.precommits(0).unwrap().len(), 1);
        assert_eq!(votes.prevotes(2).unwrap().len(), 1);
        assert!(votes.prevotes(1).is_none());
        assert_eq!(votes.rounds().collect::<Vec<_>>(), vec![0, 2]);
    }

    #[test]
    fn test_forged_vote_allocates_no_round() {
        let (keys, mut votes) = setup();
        let mut forged = vote(&keys[0], 9, VoteStep::PreVote, None);
        forged.round = 10;

        assert!(matches!(
            votes.add_vote(forged),
            Err(ConsensusError::InvalidSignature)
        ));
        assert!(votes.rounds().next().is_none());
    }

    #[test]
    fn test_wrong_height_rejected() {
        let (keys, mut votes) = setup();
        let ts = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        let other = Vote::new_signed(&keys[0], 8, 0, VoteStep::PreVote, None, ts).unwrap();
        assert!(matches!(
            votes.add_vote(other),
            Err(ConsensusError::VoteMismatch { .. })
        ));
    }

    #[test]
    fn test_pol_round_is_highest_block_quorum() {
        let (keys, mut votes) = setup();
        let a = Some(Hash([1; 32]));
        let b = Some(Hash([2; 32]));
        for key in &keys[..3] {
            votes.add_vote(vote(key, 0, VoteStep::PreVote, a)).unwrap();
            votes.add_vote(vote(key, 1, VoteStep::PreVote, None)).unwrap();
            votes.add_vote(vote(key, 2, VoteStep::PreVote, b)).unwrap();
        }
        assert_eq!(votes.pol_round(), Some((2, Hash([2; 32]))));
    }

    #[test]
    fn test_skip_round_needs_one_third() {
        let (keys, mut votes) = setup();
        votes.add_vote(vote(&keys[0], 3, VoteStep::PreVote, None)).unwrap();
        votes.add_vote(vote(&keys[0], 3, VoteStep::PreCommit, None)).unwrap();
        // One of four validators is not more than a third
        assert_eq!(votes.skip_round(0), None);

        votes.add_vote(vote(&keys[1], 3, VoteStep::PreCommit, None)).unwrap();
        assert_eq!(votes.round_participation(3), 2);
        assert_eq!(votes.skip_round(0), Some(3));
        assert_eq!(votes.skip_round(3), None);
    }
}
