use chrono::Utc;
use meridian_core::{CommittedBlock, Evidence, Hash, Peer};
use meridian_net::Transport;
use meridian_state::{BlockStore, Storage};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::ConsensusConfig;
use crate::error::ConsensusError;
use crate::evidence_pool::EvidencePool;
use crate::reactor::to_message;
use crate::state_machine::{ConsensusAction, ConsensusEvent, ConsensusState};

/// Height to decide next and the hash it builds on, read from the store
pub fn start_position<S: Storage>(store: &BlockStore<S>) -> Result<(u64, Hash), ConsensusError> {
    match store.tip()? {
        Some(tip) => Ok((tip.block.height() + 1, tip.commit.block_hash)),
        None => Ok((1, Hash::ZERO)),
    }
}

/// Evidence included in the blocks of the last `max_age` heights, with the
/// height of the block that included it
pub fn recent_evidence<S: Storage>(
    store: &BlockStore<S>,
    max_age: u64,
) -> Result<Vec<(Evidence, u64)>, ConsensusError> {
    let Some(tip) = store.tip_height()? else {
        return Ok(Vec::new());
    };
    let mut evidence = Vec::new();
    for height in tip.saturating_sub(max_age)..=tip {
        if let Some(committed) = store.get(height)? {
            evidence.extend(committed.block.evidence.into_iter().map(|e| (e, height)));
        }
    }
    Ok(evidence)
}

/// Feeds events to a running consensus task
#[derive(Clone)]
pub struct ConsensusHandle {
    sender: mpsc::Sender<ConsensusEvent>,
    committed: watch::Receiver<Option<u64>>,
}

impl ConsensusHandle {
    pub async fn send(&self, event: ConsensusEvent) -> Result<(), ConsensusError> {
        self.sender
            .send(event)
            .await
            .map_err(|_| ConsensusError::Stopped)
    }

    /// Enqueue without waiting. Fails when the queue is full.
    pub fn try_send(&self, event: ConsensusEvent) -> Result<(), ConsensusError> {
        self.sender.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ConsensusError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => ConsensusError::Stopped,
        })
    }

    /// Highest height committed since the task started
    pub fn committed_height(&self) -> Option<u64> {
        *self.committed.borrow()
    }

    /// Wait until `height` is committed
    pub async fn wait_for_height(&self, height: u64) -> Result<(), ConsensusError> {
        let mut committed = self.committed.clone();
        committed
            .wait_for(|tip| tip.is_some_and(|tip| tip >= height))
            .await
            .map(|_| ())
            .map_err(|_| ConsensusError::Stopped)
    }
}

/// Owns the state machine and executes its actions. Proposals, votes and
/// timer firings all pass through one queue, so transitions happen in
/// receipt order.
pub struct ConsensusRunner<T: Transport, S: Storage> {
    state: ConsensusState,
    transport: Arc<T>,
    peers: Vec<Peer>,
    store: Arc<RwLock<BlockStore<S>>>,
    pool: Arc<EvidencePool>,
    config: ConsensusConfig,
    timers: mpsc::WeakSender<ConsensusEvent>,
    receiver: mpsc::Receiver<ConsensusEvent>,
    committed: watch::Sender<Option<u64>>,
}

impl<T: Transport, S: Storage + 'static> ConsensusRunner<T, S> {
    /// `peers` are the validators messages are broadcast to; the local
    /// peer is skipped.
    pub fn new(
        state: ConsensusState,
        transport: Arc<T>,
        peers: Vec<Peer>,
        store: Arc<RwLock<BlockStore<S>>>,
        pool: Arc<EvidencePool>,
        config: ConsensusConfig,
    ) -> (Self, ConsensusHandle) {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let (committed, committed_rx) = watch::channel(None);
        let local = transport.local_peer().address();
        let peers = peers
            .into_iter()
            .filter(|peer| peer.address() != local)
            .collect();

        let runner = ConsensusRunner {
            state,
            transport,
            peers,
            store,
            pool,
            config,
            timers: sender.downgrade(),
            receiver,
            committed,
        };
        let handle = ConsensusHandle {
            sender,
            committed: committed_rx,
        };
        (runner, handle)
    }

    /// Process events until every handle is dropped. Fails, and stops
    /// deciding heights, when a committed block cannot be persisted.
    pub async fn run(mut self) -> Result<(), ConsensusError> {
        info!(
            "Consensus started at height {} with {} peers",
            self.state.height(),
            self.peers.len()
        );
        self.process(ConsensusEvent::Start).await?;
        while let Some(event) = self.receiver.recv().await {
            self.process(event).await?;
        }
        info!("Consensus stopped at height {}", self.state.height());
        Ok(())
    }

    async fn process(&mut self, event: ConsensusEvent) -> Result<(), ConsensusError> {
        self.state.set_time(Utc::now());
        self.state
            .set_pending_evidence(self.pool.pending(self.config.max_block_evidence));
        for action in self.state.handle(event) {
            self.execute(action).await?;
        }
        Ok(())
    }

    async fn execute(&mut self, action: ConsensusAction) -> Result<(), ConsensusError> {
        match action {
            ConsensusAction::Broadcast(message) => {
                let message = to_message(message);
                let transport = self.transport.clone();
                let peers = self.peers.clone();
                tokio::spawn(async move {
                    let results = futures_util::future::join_all(
                        peers
                            .iter()
                            .map(|peer| transport.post(peer, message.clone(), None)),
                    )
                    .await;
                    for (peer, result) in peers.iter().zip(results) {
                        if let Err(e) = result {
                            debug!("Broadcast to {} failed: {}", peer.address(), e);
                        }
                    }
                });
            }
            ConsensusAction::ScheduleTimeout(timeout, duration) => {
                let timers = self.timers.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(duration).await;
                    if let Some(sender) = timers.upgrade() {
                        let _ = sender.send(ConsensusEvent::Timeout(timeout)).await;
                    }
                });
            }
            ConsensusAction::Commit(committed) => {
                let height = committed.block.height();
                let included: Vec<_> = committed.block.evidence.iter().map(|e| e.id()).collect();
                if let Err(e) = self.persist(committed).await {
                    error!("{}", e);
                    return Err(e);
                }
                self.pool.mark_committed(included, height);
                // Evidence the next block may no longer include
                self.pool.prune_below(
                    height
                        .saturating_add(1)
                        .saturating_sub(self.config.evidence_max_age),
                );
                self.committed.send_replace(Some(height));
            }
            ConsensusAction::Evidence(evidence) => {
                let id = evidence.id();
                match self.pool.add(evidence) {
                    Ok(true) => info!("Added evidence {} to pool", id),
                    Ok(false) => {}
                    Err(e) => warn!("Evidence {} not pooled: {}", id, e),
                }
            }
            ConsensusAction::SafetyAlarm(violation) => {
                error!(
                    "SAFETY ALARM at height {}: {}",
                    self.state.height(),
                    violation
                );
            }
        }
        Ok(())
    }

    /// Append to the store off the async workers
    async fn persist(&mut self, committed: CommittedBlock) -> Result<(), ConsensusError> {
        let height = committed.block.height();
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.write().append(committed))
            .await
            .map_err(|e| ConsensusError::Persistence {
                height,
                reason: e.to_string(),
            })?
            .map_err(|e| ConsensusError::Persistence {
                height,
                reason: e.to_string(),
            })
    }
}
