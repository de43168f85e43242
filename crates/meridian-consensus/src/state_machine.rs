use chrono::{DateTime, Utc};
use meridian_core::{
    Block, Commit, CommittedBlock, DuplicateVoteEvidence, Evidence, EvidenceId, Hash, KeyPair,
    Proposal, PublicKey, ValidatorSet, Vote, VoteStep,
};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::application::{Application, NoopApplication};
use crate::block_builder::{BlockBuilder, BlockBuilderConfig};
use crate::config::ConsensusConfig;
use crate::error::ConsensusError;
use crate::height_votes::HeightVoteSet;
use crate::proposer::{ProposerSelector, RoundRobin};
use crate::provider::ValidatorSetProvider;
use crate::round_state::{RoundState, RoundStep};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimeoutInfo {
    pub height: u64,
    pub round: u32,
    pub step: RoundStep,
}

/// Input of the state machine. Everything that can change consensus state
/// arrives as one of these, in a single order.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsensusEvent {
    Start,
    ProposalReceived(Proposal),
    VoteReceived(Vote),
    Timeout(TimeoutInfo),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConsensusMessage {
    Proposal(Proposal),
    Vote(Vote),
}

/// Side effects requested by the state machine, executed by the runner
#[derive(Debug)]
pub enum ConsensusAction {
    Broadcast(ConsensusMessage),
    ScheduleTimeout(TimeoutInfo, Duration),
    Commit(CommittedBlock),
    Evidence(Evidence),
    SafetyAlarm(ConsensusError),
}

#[derive(Debug, Clone)]
struct KnownBlock {
    block: Block,
    valid: bool,
}

/// Tendermint round state machine for one validator.
///
/// `handle` is synchronous and performs no I/O: the same sequence of events
/// (and clock readings set through `set_time`) always yields the same
/// actions.
pub struct ConsensusState {
    keypair: Option<KeyPair>,
    provider: Arc<dyn ValidatorSetProvider>,
    validators: Arc<ValidatorSet>,
    selector: Box<dyn ProposerSelector>,
    app: Box<dyn Application>,
    config: ConsensusConfig,
    builder: BlockBuilder,
    round_state: RoundState,
    votes: HeightVoteSet,
    /// First valid-looking proposal per round and its block hash
    proposals: BTreeMap<u32, (Proposal, Hash)>,
    blocks: BTreeMap<Hash, KnownBlock>,
    prev_hash: Hash,
    now: DateTime<Utc>,
    pending_evidence: Vec<Evidence>,
    /// Evidence committed within the expiry window, with its height
    committed_evidence: BTreeMap<EvidenceId, u64>,
    future: VecDeque<ConsensusEvent>,
    /// Offenders already reported per (round, step)
    reported: BTreeSet<(PublicKey, u32, VoteStep)>,
    alarms: BTreeSet<(u32, VoteStep)>,
    prevote_timeouts: BTreeSet<u32>,
    precommit_timeouts: BTreeSet<u32>,
    valid_updates: BTreeSet<u32>,
    started: bool,
}

impl ConsensusState {
    /// State machine about to decide `height` on top of `prev_hash`.
    /// Without a keypair the node follows consensus without voting.
    pub fn new(
        height: u64,
        prev_hash: Hash,
        provider: Arc<dyn ValidatorSetProvider>,
        keypair: Option<KeyPair>,
        config: ConsensusConfig,
    ) -> Result<Self, ConsensusError> {
        let validators = provider
            .validator_set(height)
            .ok_or(ConsensusError::NoValidatorSet(height))?;
        let builder = BlockBuilder::new(BlockBuilderConfig {
            max_evidence: config.max_block_evidence,
            max_evidence_age: config.evidence_max_age,
        });

        Ok(ConsensusState {
            keypair,
            provider,
            votes: HeightVoteSet::new(height, validators.clone()),
            validators,
            selector: Box::new(RoundRobin),
            app: Box::new(NoopApplication),
            config,
            builder,
            round_state: RoundState::new(height),
            proposals: BTreeMap::new(),
            blocks: BTreeMap::new(),
            prev_hash,
            now: DateTime::<Utc>::UNIX_EPOCH,
            pending_evidence: Vec::new(),
            committed_evidence: BTreeMap::new(),
            future: VecDeque::new(),
            reported: BTreeSet::new(),
            alarms: BTreeSet::new(),
            prevote_timeouts: BTreeSet::new(),
            precommit_timeouts: BTreeSet::new(),
            valid_updates: BTreeSet::new(),
            started: false,
        })
    }

    pub fn with_selector(mut self, selector: Box<dyn ProposerSelector>) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_application(mut self, app: Box<dyn Application>) -> Self {
        self.app = app;
        self
    }

    /// Evidence committed before this state machine was created, so that
    /// no later block includes it again
    pub fn with_committed_evidence<'a>(
        mut self,
        evidence: impl IntoIterator<Item = &'a Evidence>,
    ) -> Self {
        for e in evidence {
            self.committed_evidence.insert(e.id(), e.height());
        }
        self
    }

    /// Clock reading used for vote and block timestamps
    pub fn set_time(&mut self, now: DateTime<Utc>) {
        self.now = now;
    }

    /// Evidence offered for the next block this node proposes
    pub fn set_pending_evidence(&mut self, evidence: Vec<Evidence>) {
        self.pending_evidence = evidence;
    }

    pub fn height(&self) -> u64 {
        self.round_state.height
    }

    pub fn round(&self) -> u32 {
        self.round_state.round
    }

    pub fn step(&self) -> RoundStep {
        self.round_state.step
    }

    pub fn round_state(&self) -> &RoundState {
        &self.round_state
    }

    pub fn votes(&self) -> &HeightVoteSet {
        &self.votes
    }

    pub fn validators(&self) -> &Arc<ValidatorSet> {
        &self.validators
    }

    pub fn prev_hash(&self) -> Hash {
        self.prev_hash
    }

    /// Messages held for heights not reached yet
    pub fn buffered_len(&self) -> usize {
        self.future.len()
    }

    pub fn handle(&mut self, event: ConsensusEvent) -> Vec<ConsensusAction> {
        let mut actions = Vec::new();
        match event {
            ConsensusEvent::Start => {
                if !self.started {
                    self.started = true;
                    self.start_round(0, &mut actions);
                }
            }
            ConsensusEvent::ProposalReceived(proposal) => self.on_proposal(proposal),
            ConsensusEvent::VoteReceived(vote) => self.on_vote(vote, &mut actions),
            ConsensusEvent::Timeout(timeout) => self.on_timeout(timeout, &mut actions),
        }
        self.apply_rules(&mut actions);
        actions
    }

    fn is_validator(&self) -> bool {
        self.keypair
            .as_ref()
            .is_some_and(|kp| self.validators.contains(&kp.public))
    }

    /// Rounds beyond the lookahead window are not tracked
    fn round_in_window(&self, round: u32) -> bool {
        round <= self
            .round_state
            .round
            .saturating_add(self.config.max_round_lookahead)
    }

    /// Hold a signed message of a current validator for the next height.
    /// Each validator gets an equal share of the buffer.
    fn buffer_future(&mut self, event: ConsensusEvent) {
        let (height, signer, signed) = match &event {
            ConsensusEvent::ProposalReceived(p) => (p.height, p.proposer, p.verify().is_ok()),
            ConsensusEvent::VoteReceived(v) => (v.height, v.validator, v.verify().is_ok()),
            _ => return,
        };
        if height != self.round_state.height.saturating_add(1) {
            debug!(
                "Dropping message for height {} at height {}",
                height, self.round_state.height
            );
            return;
        }
        if !signed || !self.validators.contains(&signer) {
            debug!("Dropping unverifiable message for height {} from {}", height, signer);
            return;
        }

        let quota = (self.config.future_buffer / self.validators.len().max(1)).max(1);
        let held = self
            .future
            .iter()
            .filter(|event| event_signer(event) == Some(signer))
            .count();
        if held >= quota || self.future.len() >= self.config.future_buffer {
            debug!(
                "Future message buffer full for {} at height {}, dropping message",
                signer, self.round_state.height
            );
            return;
        }
        self.future.push_back(event);
    }

    fn on_proposal(&mut self, proposal: Proposal) {
        let height = self.round_state.height;
        if proposal.height < height {
            debug!(
                "Ignoring proposal for past height {} at height {}",
                proposal.height, height
            );
            return;
        }
        if proposal.height > height {
            self.buffer_future(ConsensusEvent::ProposalReceived(proposal));
            return;
        }

        if !self.round_in_window(proposal.round) {
            debug!(
                "Ignoring proposal for round {} at round {}",
                proposal.round, self.round_state.round
            );
            return;
        }

        if let Err(e) = self.check_proposal(&proposal) {
            warn!(
                "Rejected proposal from {} at height {} round {}: {}",
                proposal.proposer, proposal.height, proposal.round, e
            );
            return;
        }

        let hash = match proposal.block_hash() {
            Ok(hash) => hash,
            Err(e) => {
                warn!("Cannot hash proposed block: {}", e);
                return;
            }
        };

        if let Some((_, existing)) = self.proposals.get(&proposal.round) {
            if *existing != hash {
                warn!(
                    "Conflicting proposal from {} at height {} round {}: {} then {}",
                    proposal.proposer,
                    height,
                    proposal.round,
                    existing.short(),
                    hash.short()
                );
            }
            return;
        }

        if !self.blocks.contains_key(&hash) {
            let valid = match self.validate_proposed_block(&proposal.block) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Proposed block {} is invalid: {}", hash.short(), e);
                    false
                }
            };
            self.blocks.insert(
                hash,
                KnownBlock {
                    block: proposal.block.clone(),
                    valid,
                },
            );
        }

        info!(
            "Received proposal {} from {} at height {} round {}",
            hash.short(),
            proposal.proposer,
            height,
            proposal.round
        );
        if proposal.round == self.round_state.round {
            self.round_state.proposal = Some(hash);
        }
        self.proposals.insert(proposal.round, (proposal, hash));
    }

    /// Checks that make a proposal worth remembering at all
    fn check_proposal(&self, proposal: &Proposal) -> Result<(), ConsensusError> {
        let designated =
            self.selector
                .proposer(proposal.height, proposal.round, &self.validators);
        if designated != Some(proposal.proposer) {
            return Err(ConsensusError::InvalidProposal(format!(
                "{} is not the proposer of round {}",
                proposal.proposer, proposal.round
            )));
        }
        if proposal.block.height() != proposal.height {
            return Err(ConsensusError::InvalidProposal(format!(
                "block height {} in proposal for height {}",
                proposal.block.height(),
                proposal.height
            )));
        }
        if let Some(valid_round) = proposal.valid_round {
            if valid_round >= proposal.round {
                return Err(ConsensusError::InvalidProposal(format!(
                    "valid round {} not below round {}",
                    valid_round, proposal.round
                )));
            }
        }
        proposal
            .verify()
            .map_err(|_| ConsensusError::InvalidSignature)
    }

    fn validate_proposed_block(&self, block: &Block) -> Result<(), ConsensusError> {
        self.builder.validate_block(
            block,
            self.round_state.height,
            self.prev_hash,
            self.provider.as_ref(),
            |id| self.committed_evidence.contains_key(id),
        )?;
        self.app
            .validate_block(block)
            .map_err(ConsensusError::InvalidBlock)
    }

    fn on_vote(&mut self, vote: Vote, actions: &mut Vec<ConsensusAction>) {
        let height = self.round_state.height;
        if vote.height < height {
            return;
        }
        if vote.height > height {
            self.buffer_future(ConsensusEvent::VoteReceived(vote));
            return;
        }

        let (round, step) = (vote.round, vote.step);
        if !self.round_in_window(round) {
            debug!(
                "Ignoring {} for round {} at round {}",
                step, round, self.round_state.round
            );
            return;
        }
        match self.votes.add_vote(vote) {
            Ok(_) => {}
            Err(ConsensusError::DuplicateVote {
                existing,
                conflicting,
            }) => {
                self.report_equivocation(*existing, *conflicting, actions);
                self.check_safety(round, step, actions);
            }
            Err(e) => debug!("Rejected vote at height {}: {}", height, e),
        }
    }

    fn report_equivocation(
        &mut self,
        existing: Vote,
        conflicting: Vote,
        actions: &mut Vec<ConsensusAction>,
    ) {
        let offence = (existing.validator, existing.round, existing.step);
        if self.reported.contains(&offence) {
            return;
        }
        let power = self.validators.power_of(&existing.validator);
        let total = self.validators.total_power();
        match DuplicateVoteEvidence::new(existing, conflicting, power, total) {
            Ok(evidence) => {
                if self.reported.insert(offence) {
                    warn!(
                        "Recorded duplicate vote evidence {} against {}",
                        evidence.id(),
                        evidence.target()
                    );
                    actions.push(ConsensusAction::Evidence(evidence.into()));
                }
            }
            Err(e) => warn!("Cannot build duplicate vote evidence: {}", e),
        }
    }

    fn check_safety(&mut self, round: u32, step: VoteStep, actions: &mut Vec<ConsensusAction>) {
        let Some(votes) = self.votes.vote_set(round, step) else {
            return;
        };
        if let Err(violation) = votes.safety_check() {
            if self.alarms.insert((round, step)) {
                error!("{}", violation);
                actions.push(ConsensusAction::SafetyAlarm(violation));
            }
        }
    }

    fn on_timeout(&mut self, timeout: TimeoutInfo, actions: &mut Vec<ConsensusAction>) {
        if !self.started
            || timeout.height != self.round_state.height
            || timeout.round != self.round_state.round
        {
            return;
        }

        match timeout.step {
            RoundStep::NewHeight if self.round_state.step == RoundStep::NewHeight => {
                self.start_round(0, actions);
            }
            RoundStep::Propose if self.round_state.step == RoundStep::Propose => {
                info!(
                    "Propose timeout at height {} round {}",
                    timeout.height, timeout.round
                );
                self.cast_vote(VoteStep::PreVote, None, actions);
                self.round_state.step = RoundStep::PreVote;
            }
            RoundStep::PreVote if self.round_state.step == RoundStep::PreVote => {
                info!(
                    "Prevote timeout at height {} round {}",
                    timeout.height, timeout.round
                );
                self.cast_vote(VoteStep::PreCommit, None, actions);
                self.round_state.step = RoundStep::PreCommit;
            }
            RoundStep::PreCommit if self.round_state.step != RoundStep::NewHeight => {
                info!(
                    "Precommit timeout at height {} round {}",
                    timeout.height, timeout.round
                );
                self.start_round(timeout.round.saturating_add(1), actions);
            }
            _ => {}
        }
    }

    fn schedule_timeout(&self, step: RoundStep, actions: &mut Vec<ConsensusAction>) {
        let info = TimeoutInfo {
            height: self.round_state.height,
            round: self.round_state.round,
            step,
        };
        actions.push(ConsensusAction::ScheduleTimeout(
            info,
            self.config.timeout(step, info.round),
        ));
    }

    fn start_round(&mut self, round: u32, actions: &mut Vec<ConsensusAction>) {
        let height = self.round_state.height;
        self.round_state.enter_round(round);
        self.round_state.proposal = self.proposals.get(&round).map(|(_, hash)| *hash);
        debug!("Entering round {} at height {}", round, height);

        let proposing = self
            .keypair
            .as_ref()
            .is_some_and(|kp| self.selector.is_proposer(&kp.public, height, round, &self.validators));
        if proposing && !self.proposals.contains_key(&round) {
            self.propose(round, actions);
        }
        self.schedule_timeout(RoundStep::Propose, actions);
    }

    fn propose(&mut self, round: u32, actions: &mut Vec<ConsensusAction>) {
        let Some(keypair) = self.keypair.clone() else {
            return;
        };
        let height = self.round_state.height;

        let reproposal = match (self.round_state.valid_value, self.round_state.valid_round) {
            (Some(value), Some(valid_round)) => self
                .blocks
                .get(&value)
                .map(|known| (known.block.clone(), Some(valid_round))),
            _ => None,
        };
        let (block, valid_round) = match reproposal {
            Some(reproposal) => reproposal,
            None => {
                let payload = self.app.propose_payload(height);
                let evidence = self
                    .pending_evidence
                    .iter()
                    .filter(|e| !self.committed_evidence.contains_key(&e.id()))
                    .cloned()
                    .collect();
                let block = self.builder.build_block(
                    height,
                    self.prev_hash,
                    keypair.public,
                    self.now,
                    payload,
                    evidence,
                );
                (block, None)
            }
        };

        match Proposal::new_signed(&keypair, height, round, block, valid_round) {
            Ok(proposal) => {
                info!("Proposing at height {} round {}", height, round);
                actions.push(ConsensusAction::Broadcast(ConsensusMessage::Proposal(
                    proposal.clone(),
                )));
                self.on_proposal(proposal);
            }
            Err(e) => error!("Failed to sign proposal at height {}: {}", height, e),
        }
    }

    /// Sign, broadcast and count our own vote for the current round
    fn cast_vote(
        &mut self,
        step: VoteStep,
        value: Option<Hash>,
        actions: &mut Vec<ConsensusAction>,
    ) {
        if !self.is_validator() {
            return;
        }
        let Some(keypair) = self.keypair.as_ref() else {
            return;
        };
        let signed = Vote::new_signed(
            keypair,
            self.round_state.height,
            self.round_state.round,
            step,
            value,
            self.now,
        );
        match signed {
            Ok(vote) => {
                actions.push(ConsensusAction::Broadcast(ConsensusMessage::Vote(
                    vote.clone(),
                )));
                self.on_vote(vote, actions);
            }
            Err(e) => error!("Failed to sign {} vote: {}", step, e),
        }
    }

    /// Apply protocol rules until none fires
    fn apply_rules(&mut self, actions: &mut Vec<ConsensusAction>) {
        if !self.started {
            return;
        }
        while self.apply_rule(actions) {}
    }

    fn apply_rule(&mut self, actions: &mut Vec<ConsensusAction>) -> bool {
        if self.try_commit(actions) {
            return true;
        }
        // Only a commit may cut the pause after the previous height short
        if self.round_state.step == RoundStep::NewHeight {
            return false;
        }
        if let Some(round) = self.votes.skip_round(self.round_state.round) {
            info!(
                "Skipping to round {} at height {}",
                round, self.round_state.height
            );
            self.start_round(round, actions);
            return true;
        }

        let round = self.round_state.round;
        let step = self.round_state.step;
        let proposal = self
            .proposals
            .get(&round)
            .map(|(proposal, hash)| (proposal.valid_round, *hash));
        let proposal_valid = proposal
            .as_ref()
            .and_then(|(_, hash)| self.blocks.get(hash))
            .is_some_and(|known| known.valid);
        let prevotes = self.votes.prevotes(round);
        let precommits = self.votes.precommits(round);

        // Prevote on the proposal of this round
        if step == RoundStep::Propose {
            if let Some((valid_round, hash)) = proposal {
                let vote = match valid_round {
                    None => Some(proposal_valid && self.round_state.lock_permits(&hash, None)),
                    Some(vr) => self
                        .votes
                        .prevotes(vr)
                        .filter(|votes| votes.has_quorum(&Some(hash)))
                        .map(|_| proposal_valid && self.round_state.lock_permits(&hash, Some(vr))),
                };
                if let Some(for_block) = vote {
                    let value = for_block.then_some(hash);
                    self.cast_vote(VoteStep::PreVote, value, actions);
                    self.round_state.step = RoundStep::PreVote;
                    return true;
                }
            }
        }

        if step >= RoundStep::PreVote {
            if prevotes.is_some_and(|votes| votes.has_two_thirds_any())
                && step == RoundStep::PreVote
                && self.prevote_timeouts.insert(round)
            {
                self.schedule_timeout(RoundStep::PreVote, actions);
                return true;
            }

            // Lock and precommit on a prevote quorum for the proposal
            if let Some((_, hash)) = proposal {
                if proposal_valid
                    && prevotes.is_some_and(|votes| votes.has_quorum(&Some(hash)))
                    && self.valid_updates.insert(round)
                {
                    if step == RoundStep::PreVote {
                        self.round_state.lock(hash, round);
                        self.cast_vote(VoteStep::PreCommit, Some(hash), actions);
                        self.round_state.step = RoundStep::PreCommit;
                    }
                    self.round_state.valid_value = Some(hash);
                    self.round_state.valid_round = Some(round);
                    return true;
                }
            }

            if step == RoundStep::PreVote && prevotes.is_some_and(|votes| votes.has_quorum(&None))
            {
                self.cast_vote(VoteStep::PreCommit, None, actions);
                self.round_state.step = RoundStep::PreCommit;
                return true;
            }
        }

        if precommits.is_some_and(|votes| votes.has_two_thirds_any())
            && self.precommit_timeouts.insert(round)
        {
            self.schedule_timeout(RoundStep::PreCommit, actions);
            return true;
        }

        if let Some(next) = round.checked_add(1) {
            if precommits.is_some_and(|votes| votes.has_quorum(&None)) {
                info!(
                    "Precommit quorum for nil at height {} round {}",
                    self.round_state.height, round
                );
                self.start_round(next, actions);
                return true;
            }
        }

        false
    }

    /// Commit once any round holds a precommit quorum for a known valid block
    fn try_commit(&mut self, actions: &mut Vec<ConsensusAction>) -> bool {
        let decision = self.votes.rounds().find_map(|round| {
            let value = self.votes.precommits(round)?.quorum_value()??;
            self.blocks
                .get(&value)
                .filter(|known| known.valid)
                .map(|_| (round, value))
        });
        let Some((round, hash)) = decision else {
            return false;
        };
        let Some(known) = self.blocks.get(&hash) else {
            return false;
        };

        let height = self.round_state.height;
        let votes = self
            .votes
            .precommits(round)
            .map(|votes| votes.votes_for(&Some(hash)))
            .unwrap_or_default();
        let committed = CommittedBlock {
            block: known.block.clone(),
            commit: Commit {
                height,
                round,
                block_hash: hash,
                votes,
            },
        };

        info!(
            "Committed block {} at height {} in round {}",
            hash.short(),
            height,
            round
        );
        self.app.on_commit(&committed);
        for evidence in &committed.block.evidence {
            self.committed_evidence.insert(evidence.id(), evidence.height());
        }
        let committed_evidence = &self.committed_evidence;
        self.pending_evidence
            .retain(|e| !committed_evidence.contains_key(&e.id()));
        actions.push(ConsensusAction::Commit(committed));

        self.advance_height(hash, actions);
        true
    }

    fn advance_height(&mut self, committed_hash: Hash, actions: &mut Vec<ConsensusAction>) {
        let height = self.round_state.height + 1;
        match self.provider.validator_set(height) {
            Some(validators) => self.validators = validators,
            None => error!(
                "No validator set for height {}, keeping the previous one",
                height
            ),
        }

        self.prev_hash = committed_hash;
        let builder = &self.builder;
        self.committed_evidence
            .retain(|_, evidence_height| !builder.is_expired(*evidence_height, height));
        self.round_state = RoundState::new(height);
        self.votes = HeightVoteSet::new(height, self.validators.clone());
        self.proposals.clear();
        self.blocks.clear();
        self.reported.clear();
        self.alarms.clear();
        self.prevote_timeouts.clear();
        self.precommit_timeouts.clear();
        self.valid_updates.clear();
        self.schedule_timeout(RoundStep::NewHeight, actions);

        let buffered = std::mem::take(&mut self.future);
        debug!(
            "Replaying {} buffered messages at height {}",
            buffered.len(),
            height
        );
        for event in buffered {
            match event {
                ConsensusEvent::ProposalReceived(proposal) => self.on_proposal(proposal),
                ConsensusEvent::VoteReceived(vote) => self.on_vote(vote, actions),
                other => self.future.push_back(other),
            }
        }
    }
}

fn event_signer(event: &ConsensusEvent) -> Option<PublicKey> {
    match event {
        ConsensusEvent::ProposalReceived(p) => Some(p.proposer),
        ConsensusEvent::VoteReceived(v) => Some(v.validator),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::Validator;

    fn ts() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn keys() -> Vec<KeyPair> {
        let set = validator_set();
        // Ordered as the validator set orders them
        let mut keys: Vec<KeyPair> = (1..=4).map(KeyPair::from_seed).collect();
        keys.sort_by_key(|kp| {
            set.validators()
                .iter()
                .position(|v| v.public_key == kp.public)
        });
        keys
    }

    fn validator_set() -> ValidatorSet {
        let validators = (1..=4)
            .map(|seed| Validator::new(KeyPair::from_seed(seed).public, 1))
            .collect();
        ValidatorSet::new(validators).unwrap()
    }

    fn node(key: Option<KeyPair>) -> ConsensusState {
        node_with(key, ConsensusConfig::default())
    }

    fn node_with(key: Option<KeyPair>, config: ConsensusConfig) -> ConsensusState {
        let provider: Arc<dyn ValidatorSetProvider> = Arc::new(Arc::new(validator_set()));
        let mut state = ConsensusState::new(1, Hash::ZERO, provider, key, config).unwrap();
        state.set_time(ts());
        state
    }

    fn proposer_index(height: u64, round: u32) -> usize {
        let set = validator_set();
        let key = RoundRobin.proposer(height, round, &set).unwrap();
        keys().iter().position(|kp| kp.public == key).unwrap()
    }

    /// Synchronous network of state machines with a FIFO message queue
    struct Cluster {
        nodes: Vec<ConsensusState>,
        down: BTreeSet<usize>,
        queue: VecDeque<(usize, ConsensusEvent)>,
        timeouts: Vec<(usize, TimeoutInfo)>,
        commits: Vec<Vec<CommittedBlock>>,
        log: Vec<Vec<ConsensusEvent>>,
    }

    impl Cluster {
        fn new() -> Self {
            let nodes: Vec<ConsensusState> = keys().into_iter().map(|k| node(Some(k))).collect();
            let n = nodes.len();
            Cluster {
                nodes,
                down: BTreeSet::new(),
                queue: VecDeque::new(),
                timeouts: Vec::new(),
                commits: vec![Vec::new(); n],
                log: vec![Vec::new(); n],
            }
        }

        fn start(&mut self) {
            for i in 0..self.nodes.len() {
                self.queue.push_back((i, ConsensusEvent::Start));
            }
        }

        fn deliver(&mut self, target: usize, event: ConsensusEvent) {
            if self.down.contains(&target) {
                return;
            }
            self.log[target].push(event.clone());
            let actions = self.nodes[target].handle(event);
            for action in actions {
                match action {
                    ConsensusAction::Broadcast(message) => {
                        let event = match message {
                            ConsensusMessage::Proposal(p) => ConsensusEvent::ProposalReceived(p),
                            ConsensusMessage::Vote(v) => ConsensusEvent::VoteReceived(v),
                        };
                        for other in 0..self.nodes.len() {
                            if other != target {
                                self.queue.push_back((other, event.clone()));
                            }
                        }
                    }
                    // The commit pause elapses at once
                    ConsensusAction::ScheduleTimeout(info, _)
                        if info.step == RoundStep::NewHeight =>
                    {
                        self.queue.push_back((target, ConsensusEvent::Timeout(info)))
                    }
                    ConsensusAction::ScheduleTimeout(info, _) => {
                        self.timeouts.push((target, info))
                    }
                    ConsensusAction::Commit(committed) => self.commits[target].push(committed),
                    ConsensusAction::Evidence(_) | ConsensusAction::SafetyAlarm(_) => {}
                }
            }
        }

        /// Run until every live node committed `height`
        fn run_until(&mut self, height: usize) {
            while let Some((target, event)) = self.queue.pop_front() {
                self.deliver(target, event);
                let done = (0..self.nodes.len())
                    .filter(|i| !self.down.contains(i))
                    .all(|i| self.commits[i].len() >= height);
                if done {
                    return;
                }
            }
        }

        fn fire_timeouts(&mut self) {
            let timeouts = std::mem::take(&mut self.timeouts);
            for (target, info) in timeouts {
                self.queue.push_back((target, ConsensusEvent::Timeout(info)));
            }
        }
    }

    fn proposal(key: &KeyPair, round: u32, payload: &[u8], valid_round: Option<u32>) -> Proposal {
        let block = Block::new(1, Hash::ZERO, key.public, ts(), payload.to_vec(), vec![]);
        Proposal::new_signed(key, 1, round, block, valid_round).unwrap()
    }

    fn vote(key: &KeyPair, round: u32, step: VoteStep, value: Option<Hash>) -> Vote {
        Vote::new_signed(key, 1, round, step, value, ts()).unwrap()
    }

    fn own_votes(actions: &[ConsensusAction], step: VoteStep) -> Vec<Vote> {
        actions
            .iter()
            .filter_map(|action| match action {
                ConsensusAction::Broadcast(ConsensusMessage::Vote(v)) if v.step == step => {
                    Some(v.clone())
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_four_validators_commit_heights() {
        let mut cluster = Cluster::new();
        cluster.start();
        cluster.run_until(3);

        for commits in &cluster.commits {
            assert!(commits.len() >= 3);
        }
        for height in 0..3 {
            let hash = cluster.commits[0][height].commit.block_hash;
            for commits in &cluster.commits {
                assert_eq!(commits[height].commit.block_hash, hash);
                assert_eq!(commits[height].block.height(), height as u64 + 1);
                commits[height].commit.verify(&validator_set()).unwrap();
            }
        }
        // Each block links to the previous one
        let chain = &cluster.commits[0];
        assert_eq!(chain[1].block.header.prev_hash, chain[0].commit.block_hash);
        assert_eq!(chain[2].block.header.prev_hash, chain[1].commit.block_hash);
    }

    #[test]
    fn test_round_advances_when_proposer_is_down() {
        let mut cluster = Cluster::new();
        let silent = proposer_index(1, 0);
        cluster.down.insert(silent);
        cluster.start();
        cluster.run_until(1);
        assert!(cluster.commits.iter().all(|c| c.is_empty()));

        // Propose timeouts lead to nil prevotes, nil precommits and round 1
        cluster.fire_timeouts();
        cluster.run_until(1);

        for (i, commits) in cluster.commits.iter().enumerate() {
            if i == silent {
                continue;
            }
            assert_eq!(commits.len(), 1);
            assert_eq!(commits[0].commit.round, 1);
            assert_eq!(commits[0].block.header.proposer, keys()[proposer_index(1, 1)].public);
        }
    }

    #[test]
    fn test_lock_is_kept_across_rounds() {
        let keys = keys();
        let me = 3;
        assert_ne!(proposer_index(1, 0), me);
        assert_ne!(proposer_index(1, 1), me);
        let mut state = node(Some(keys[me].clone()));
        state.handle(ConsensusEvent::Start);

        // Round 0: prevote quorum for X locks it
        let x = proposal(&keys[proposer_index(1, 0)], 0, b"x", None);
        let x_hash = x.block_hash().unwrap();
        let actions = state.handle(ConsensusEvent::ProposalReceived(x));
        assert_eq!(own_votes(&actions, VoteStep::PreVote)[0].block_hash, Some(x_hash));

        let mut precommits = Vec::new();
        for other in keys.iter().take(2) {
            let actions = state.handle(ConsensusEvent::VoteReceived(vote(
                other,
                0,
                VoteStep::PreVote,
                Some(x_hash),
            )));
            precommits.extend(own_votes(&actions, VoteStep::PreCommit));
        }
        assert_eq!(precommits.len(), 1);
        assert_eq!(precommits[0].block_hash, Some(x_hash));
        assert_eq!(state.round_state().locked_value, Some(x_hash));
        assert_eq!(state.round_state().locked_round, Some(0));

        // Round 1: a fresh block Y is refused while locked on X
        state.handle(ConsensusEvent::Timeout(TimeoutInfo {
            height: 1,
            round: 0,
            step: RoundStep::PreCommit,
        }));
        assert_eq!(state.round(), 1);
        let y = proposal(&keys[proposer_index(1, 1)], 1, b"y", None);
        let actions = state.handle(ConsensusEvent::ProposalReceived(y));
        assert_eq!(own_votes(&actions, VoteStep::PreVote)[0].block_hash, None);
        assert_eq!(state.round_state().locked_value, Some(x_hash));

        // Round 2: as proposer we re-propose the locked block with its POL round
        assert_eq!(proposer_index(1, 2), me);
        let actions = state.handle(ConsensusEvent::Timeout(TimeoutInfo {
            height: 1,
            round: 1,
            step: RoundStep::PreCommit,
        }));
        let reproposed = actions
            .iter()
            .find_map(|action| match action {
                ConsensusAction::Broadcast(ConsensusMessage::Proposal(p)) => Some(p.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(reproposed.round, 2);
        assert_eq!(reproposed.valid_round, Some(0));
        assert_eq!(reproposed.block_hash().unwrap(), x_hash);
        assert_eq!(own_votes(&actions, VoteStep::PreVote)[0].block_hash, Some(x_hash));
    }

    #[test]
    fn test_deterministic_replay() {
        let mut cluster = Cluster::new();
        cluster.start();
        cluster.run_until(2);

        let record = |state: &mut ConsensusState, events: &[ConsensusEvent]| -> Vec<String> {
            events
                .iter()
                .map(|event| format!("{:?}", state.handle(event.clone())))
                .collect()
        };

        let events = cluster.log[1].clone();
        let mut first = node(Some(keys()[1].clone()));
        let mut second = node(Some(keys()[1].clone()));
        let a = record(&mut first, &events);
        let b = record(&mut second, &events);

        assert_eq!(a, b);
        assert_eq!(first.height(), cluster.nodes[1].height());
        assert_eq!(first.prev_hash(), cluster.nodes[1].prev_hash());
    }

    #[test]
    fn test_equivocation_reported_and_safety_alarm_raised() {
        let keys = keys();
        let mut state = node(None);
        let x = Some(Hash([1; 32]));
        let y = Some(Hash([2; 32]));

        let mut evidence = Vec::new();
        let mut alarms = Vec::new();
        let mut collect = |actions: Vec<ConsensusAction>| {
            for action in actions {
                match action {
                    ConsensusAction::Evidence(e) => evidence.push(e),
                    ConsensusAction::SafetyAlarm(e) => alarms.push(e),
                    _ => {}
                }
            }
        };

        for key in keys.iter().take(3) {
            collect(state.handle(ConsensusEvent::VoteReceived(vote(key, 0, VoteStep::PreVote, x))));
        }
        for key in keys.iter().take(3) {
            collect(state.handle(ConsensusEvent::VoteReceived(vote(key, 0, VoteStep::PreVote, y))));
        }
        // Repeating an equivocation does not report it again
        collect(state.handle(ConsensusEvent::VoteReceived(vote(
            &keys[0],
            0,
            VoteStep::PreVote,
            y,
        ))));

        assert_eq!(evidence.len(), 3);
        assert!(evidence.iter().all(|e| e.height() == 1));
        assert_eq!(alarms.len(), 1);
        assert!(matches!(
            alarms[0],
            ConsensusError::SafetyViolation { round: 0, .. }
        ));
        // First votes stay counted
        assert!(state.votes().prevotes(0).unwrap().has_quorum(&x));
    }

    #[test]
    fn test_future_messages_buffered_and_past_ignored() {
        let keys = keys();
        let mut state = node(Some(keys[0].clone()));
        state.handle(ConsensusEvent::Start);

        let future = Vote::new_signed(&keys[1], 2, 0, VoteStep::PreVote, None, ts()).unwrap();
        state.handle(ConsensusEvent::VoteReceived(future));
        assert_eq!(state.buffered_len(), 1);
        assert!(state.votes().prevotes(0).is_none());

        let past = Vote::new_signed(&keys[1], 0, 0, VoteStep::PreVote, None, ts()).unwrap();
        state.handle(ConsensusEvent::VoteReceived(past));
        assert_eq!(state.buffered_len(), 1);
        assert!(state.votes().rounds().next().is_none());
    }

    #[test]
    fn test_votes_beyond_round_window_dropped() {
        let keys = keys();
        let mut state = node(None);
        let limit = ConsensusConfig::default().max_round_lookahead;

        for round in [limit + 1, u32::MAX] {
            state.handle(ConsensusEvent::VoteReceived(vote(
                &keys[0],
                round,
                VoteStep::PreVote,
                None,
            )));
        }
        assert!(state.votes().rounds().next().is_none());

        state.handle(ConsensusEvent::VoteReceived(vote(
            &keys[0],
            limit,
            VoteStep::PreVote,
            None,
        )));
        assert_eq!(state.votes().rounds().collect::<Vec<_>>(), vec![limit]);
    }

    #[test]
    fn test_future_buffer_holds_next_height_per_validator() {
        let keys = keys();
        let config = ConsensusConfig {
            future_buffer: 8,
            ..ConsensusConfig::default()
        };
        let mut state = node_with(Some(keys[0].clone()), config);
        let at = |key: &KeyPair, height: u64, round: u32| {
            ConsensusEvent::VoteReceived(
                Vote::new_signed(key, height, round, VoteStep::PreVote, None, ts()).unwrap(),
            )
        };

        // Far heights and outsiders are never held
        state.handle(at(&keys[1], u64::MAX, 0));
        state.handle(at(&keys[1], 3, 0));
        state.handle(at(&KeyPair::from_seed(9), 2, 0));
        assert_eq!(state.buffered_len(), 0);

        // One validator cannot take more than its share
        for round in 0..20 {
            state.handle(at(&keys[1], 2, round));
        }
        assert_eq!(state.buffered_len(), 2);
        state.handle(at(&keys[2], 2, 0));
        assert_eq!(state.buffered_len(), 3);
    }

    #[test]
    fn test_buffered_votes_wait_for_commit_pause() {
        let keys = keys();
        let me = (0..4).find(|i| *i != proposer_index(1, 0)).unwrap();
        let mut state = node(Some(keys[me].clone()));
        state.handle(ConsensusEvent::Start);

        // Two validators already moved to round 1 of the next height
        for key in keys.iter().take(2) {
            let early = Vote::new_signed(key, 2, 1, VoteStep::PreVote, None, ts()).unwrap();
            state.handle(ConsensusEvent::VoteReceived(early));
        }
        assert_eq!(state.buffered_len(), 2);

        let x = proposal(&keys[proposer_index(1, 0)], 0, b"x", None);
        let x_hash = x.block_hash().unwrap();
        state.handle(ConsensusEvent::ProposalReceived(x));
        let mut committed = false;
        for key in keys.iter().filter(|k| k.public != keys[me].public) {
            let actions = state.handle(ConsensusEvent::VoteReceived(vote(
                key,
                0,
                VoteStep::PreCommit,
                Some(x_hash),
            )));
            committed |= actions
                .iter()
                .any(|action| matches!(action, ConsensusAction::Commit(_)));
        }
        assert!(committed);
        assert_eq!(state.height(), 2);
        assert_eq!(state.round(), 0);
        assert_eq!(state.step(), RoundStep::NewHeight);

        state.handle(ConsensusEvent::Timeout(TimeoutInfo {
            height: 2,
            round: 0,
            step: RoundStep::NewHeight,
        }));
        assert_eq!(state.round(), 1);
    }

    #[test]
    fn test_prevotes_nil_on_committed_evidence() {
        let keys = keys();
        let me = (0..4).find(|i| *i != proposer_index(1, 0)).unwrap();
        let evidence: Evidence = DuplicateVoteEvidence::new(
            Vote::new_signed(&keys[2], 0, 0, VoteStep::PreVote, Some(Hash([1; 32])), ts()).unwrap(),
            Vote::new_signed(&keys[2], 0, 0, VoteStep::PreVote, Some(Hash([2; 32])), ts()).unwrap(),
            1,
            4,
        )
        .unwrap()
        .into();
        let mut state =
            node(Some(keys[me].clone())).with_committed_evidence(std::slice::from_ref(&evidence));
        state.handle(ConsensusEvent::Start);

        let proposer = &keys[proposer_index(1, 0)];
        let block = Block::new(1, Hash::ZERO, proposer.public, ts(), b"x".to_vec(), vec![evidence]);
        let proposal = Proposal::new_signed(proposer, 1, 0, block, None).unwrap();
        let actions = state.handle(ConsensusEvent::ProposalReceived(proposal));

        assert_eq!(own_votes(&actions, VoteStep::PreVote)[0].block_hash, None);
    }

    #[test]
    fn test_proposal_from_wrong_proposer_ignored() {
        let keys = keys();
        let me = proposer_index(1, 1);
        let mut state = node(Some(keys[me].clone()));
        state.handle(ConsensusEvent::Start);

        let impostor = (0..4)
            .find(|i| *i != proposer_index(1, 0) && *i != me)
            .unwrap();
        let actions = state.handle(ConsensusEvent::ProposalReceived(proposal(
            &keys[impostor],
            0,
            b"z",
            None,
        )));

        assert!(own_votes(&actions, VoteStep::PreVote).is_empty());
        assert_eq!(state.round_state().proposal, None);
        assert_eq!(state.step(), RoundStep::Propose);
    }

    #[test]
    fn test_start_schedules_propose_timeout() {
        let keys = keys();
        let me = (0..4).find(|i| *i != proposer_index(1, 0)).unwrap();
        let mut state = node(Some(keys[me].clone()));
        let actions = state.handle(ConsensusEvent::Start);

        assert!(matches!(
            actions.as_slice(),
            [ConsensusAction::ScheduleTimeout(
                TimeoutInfo {
                    height: 1,
                    round: 0,
                    step: RoundStep::Propose
                },
                _
            )]
        ));

        let proposer: PublicKey = keys[proposer_index(1, 0)].public;
        assert!(!state.selector.is_proposer(&keys[me].public, 1, 0, state.validators()));
        assert!(state.selector.is_proposer(&proposer, 1, 0, state.validators()));
    }
}
