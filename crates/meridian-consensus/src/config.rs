use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::round_state::RoundStep;

/// Step timeouts grow linearly with the round: `base + delta * round`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub timeout_propose_ms: u64,
    pub timeout_propose_delta_ms: u64,
    pub timeout_prevote_ms: u64,
    pub timeout_prevote_delta_ms: u64,
    pub timeout_precommit_ms: u64,
    pub timeout_precommit_delta_ms: u64,
    /// Pause between committing a block and starting the next height
    pub timeout_commit_ms: u64,
    /// Proposals and votes held for the next height, shared evenly
    /// between validators
    pub future_buffer: usize,
    /// Votes and proposals more than this many rounds ahead are dropped
    pub max_round_lookahead: u32,
    /// Evidence older than this many heights is dropped from the pool
    pub evidence_max_age: u64,
    pub max_block_evidence: usize,
    /// Capacity of the consensus event queue
    pub queue_capacity: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        ConsensusConfig {
            timeout_propose_ms: 3000,
            timeout_propose_delta_ms: 500,
            timeout_prevote_ms: 1000,
            timeout_prevote_delta_ms: 500,
            timeout_precommit_ms: 1000,
            timeout_precommit_delta_ms: 500,
            timeout_commit_ms: 1000,
            future_buffer: 1024,
            max_round_lookahead: 32,
            evidence_max_age: 100,
            max_block_evidence: 16,
            queue_capacity: 4096,
        }
    }
}

impl ConsensusConfig {
    pub fn timeout(&self, step: RoundStep, round: u32) -> Duration {
        let (base, delta) = match step {
            RoundStep::NewHeight => (self.timeout_commit_ms, 0),
            RoundStep::Propose => (self.timeout_propose_ms, self.timeout_propose_delta_ms),
            RoundStep::PreVote => (self.timeout_prevote_ms, self.timeout_prevote_delta_ms),
            RoundStep::PreCommit => (self.timeout_precommit_ms, self.timeout_precommit_delta_ms),
        };
        Duration::from_millis(base.saturating_add(delta.saturating_mul(round as u64)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeouts_grow_per_round() {
        let config = ConsensusConfig::default();
        assert_eq!(config.timeout(RoundStep::Propose, 0), Duration::from_millis(3000));
        assert_eq!(config.timeout(RoundStep::Propose, 2), Duration::from_millis(4000));
        assert_eq!(config.timeout(RoundStep::PreCommit, 1), Duration::from_millis(1500));
        assert_eq!(config.timeout(RoundStep::NewHeight, 3), Duration::from_millis(1000));
    }
}
