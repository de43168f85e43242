//! Batch exchange of misbehavior evidence between peers.

use meridian_core::{Address, Evidence, EvidenceId, Peer};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::dispatcher::{Dispatcher, MessageHandler, Outbound};
use crate::error::{HandlerError, NetError};
use crate::message::{Envelope, Message, MessageKind};
use crate::request::RequestTracker;
use crate::transport::Transport;

/// Local evidence storage the exchange reads from and writes into
pub trait EvidenceSource: Send + Sync {
    fn get(&self, id: &EvidenceId) -> Option<Evidence>;

    fn contains(&self, id: &EvidenceId) -> bool;

    /// Ids of all evidence available to peers
    fn ids(&self) -> Vec<EvidenceId>;

    /// Store evidence fetched from a peer. Returns true if it was new.
    fn insert(&self, evidence: Evidence) -> bool;
}

/// Advertisers tracked at once before new ones are ignored
pub const DEFAULT_MAX_WANTED_PEERS: usize = 64;
/// Missing ids remembered per advertiser
pub const DEFAULT_MAX_WANTED_IDS: usize = 1024;

/// Ids advertised by peers that we do not hold yet, keyed by advertiser
struct Wanted {
    by_peer: HashMap<Address, (Peer, BTreeSet<EvidenceId>)>,
    max_peers: usize,
    max_ids: usize,
}

impl Wanted {
    fn new(max_peers: usize, max_ids: usize) -> Self {
        Wanted {
            by_peer: HashMap::new(),
            max_peers,
            max_ids,
        }
    }

    /// Queue `ids` under `peer`. Returns how many were accepted.
    fn queue(&mut self, peer: &Peer, ids: impl IntoIterator<Item = EvidenceId>) -> usize {
        let address = peer.address();
        if !self.by_peer.contains_key(&address) && self.by_peer.len() >= self.max_peers {
            return 0;
        }
        let max_ids = self.max_ids;
        let (_, queued) = self
            .by_peer
            .entry(address)
            .or_insert_with(|| (peer.clone(), BTreeSet::new()));
        let mut accepted = 0;
        for id in ids {
            if queued.len() >= max_ids {
                break;
            }
            if queued.insert(id) {
                accepted += 1;
            }
        }
        accepted
    }
}

impl Default for Wanted {
    fn default() -> Self {
        Wanted::new(DEFAULT_MAX_WANTED_PEERS, DEFAULT_MAX_WANTED_IDS)
    }
}

/// Answers `GetEvidences` with the requested records we hold, in request
/// order. Unknown ids are skipped.
pub struct GetEvidencesHandler<E> {
    source: Arc<E>,
}

impl<E: EvidenceSource> MessageHandler for GetEvidencesHandler<E> {
    fn handle(
        &self,
        envelope: &Envelope,
        message: &Message,
    ) -> Result<Vec<Outbound>, HandlerError> {
        let Message::GetEvidences { ids } = message else {
            return Err(HandlerError::UnexpectedMessage(message.kind()));
        };

        let evidences: Vec<Evidence> = ids.iter().filter_map(|id| self.source.get(id)).collect();
        debug!(
            "Serving {} of {} requested evidences to {}",
            evidences.len(),
            ids.len(),
            envelope.sender.address()
        );
        Ok(vec![Outbound::reply_to(
            envelope,
            Message::EvidencesResponse { evidences },
        )])
    }
}

/// Records ids a peer advertised that we are missing
pub struct EvidenceIdsHandler<E> {
    source: Arc<E>,
    wanted: Arc<Mutex<Wanted>>,
}

impl<E: EvidenceSource> MessageHandler for EvidenceIdsHandler<E> {
    fn handle(
        &self,
        envelope: &Envelope,
        message: &Message,
    ) -> Result<Vec<Outbound>, HandlerError> {
        let Message::EvidenceIds { ids } = message else {
            return Err(HandlerError::UnexpectedMessage(message.kind()));
        };

        let missing = ids.iter().filter(|id| !self.source.contains(id)).copied();
        let accepted = self.wanted.lock().queue(&envelope.sender, missing);
        if accepted > 0 {
            debug!(
                "Peer {} advertised {} evidences we lack",
                envelope.sender.address(),
                accepted
            );
        }
        Ok(Vec::new())
    }
}

pub struct EvidenceExchange<T: Transport, E: EvidenceSource> {
    transport: Arc<T>,
    tracker: Arc<RequestTracker>,
    source: Arc<E>,
    wanted: Arc<Mutex<Wanted>>,
    timeout: Duration,
}

impl<T: Transport, E: EvidenceSource + 'static> EvidenceExchange<T, E> {
    pub fn new(
        transport: Arc<T>,
        tracker: Arc<RequestTracker>,
        source: Arc<E>,
        timeout: Duration,
    ) -> Self {
        EvidenceExchange {
            transport,
            tracker,
            source,
            wanted: Arc::new(Mutex::new(Wanted::default())),
            timeout,
        }
    }

    /// Bound how many advertisers and how many ids per advertiser are
    /// remembered between fetch rounds
    pub fn with_limits(mut self, max_peers: usize, max_ids_per_peer: usize) -> Self {
        self.wanted = Arc::new(Mutex::new(Wanted::new(max_peers, max_ids_per_peer)));
        self
    }

    pub fn register(&self, dispatcher: &mut Dispatcher) {
        dispatcher.register(
            MessageKind::GetEvidences,
            Arc::new(GetEvidencesHandler {
                source: self.source.clone(),
            }),
        );
        dispatcher.register(
            MessageKind::EvidenceIds,
            Arc::new(EvidenceIdsHandler {
                source: self.source.clone(),
                wanted: self.wanted.clone(),
            }),
        );
    }

    /// Ids advertised by `peer` that are still missing locally
    pub fn missing_from(&self, peer: &Address) -> Vec<EvidenceId> {
        self.wanted
            .lock()
            .by_peer
            .get(peer)
            .map(|(_, ids)| {
                ids.iter()
                    .filter(|id| !self.source.contains(id))
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Request `ids` from `peer`. Records whose id was not requested are
    /// discarded; the rest are stored and returned.
    pub async fn fetch(&self, peer: &Peer, ids: &[EvidenceId]) -> Result<Vec<Evidence>, NetError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let request = Message::GetEvidences { ids: ids.to_vec() };
        let (_, reply) = self
            .tracker
            .request(self.transport.as_ref(), peer, request, self.timeout)
            .await?;
        let Message::EvidencesResponse { evidences } = reply else {
            return Err(NetError::UnexpectedReply {
                expected: MessageKind::EvidencesResponse,
                got: reply.kind(),
            });
        };

        let requested: HashSet<EvidenceId> = ids.iter().copied().collect();
        let mut accepted = Vec::with_capacity(evidences.len());
        for evidence in evidences {
            let id = evidence.id();
            if !requested.contains(&id) {
                warn!("Peer {} sent unrequested evidence {}", peer.address(), id);
                continue;
            }
            self.source.insert(evidence.clone());
            accepted.push(evidence);
        }

        debug!(
            "Fetched {} of {} evidences from {}",
            accepted.len(),
            ids.len(),
            peer.address()
        );
        Ok(accepted)
    }

    /// Fetch everything peers advertised that we are still missing.
    /// Returns the number of records received.
    pub async fn fetch_missing(&self) -> usize {
        let queued: Vec<(Peer, BTreeSet<EvidenceId>)> = {
            let mut wanted = self.wanted.lock();
            wanted.by_peer.drain().map(|(_, entry)| entry).collect()
        };

        let mut received = 0;
        for (peer, ids) in queued {
            let ids: Vec<EvidenceId> = ids
                .into_iter()
                .filter(|id| !self.source.contains(id))
                .collect();
            match self.fetch(&peer, &ids).await {
                Ok(evidences) => received += evidences.len(),
                Err(e) => warn!("Evidence fetch from {} failed: {}", peer.address(), e),
            }
        }
        received
    }

    /// Gossip the ids we hold. Returns how many peers accepted the message.
    pub async fn broadcast_ids(&self, peers: &[Peer]) -> usize {
        let ids = self.source.ids();
        if ids.is_empty() {
            return 0;
        }

        let mut delivered = 0;
        for peer in peers {
            let message = Message::EvidenceIds { ids: ids.clone() };
            match self.transport.post(peer, message, None).await {
                Ok(()) => delivered += 1,
                Err(e) => debug!("Evidence gossip to {} failed: {}", peer.address(), e),
            }
        }
        info!("Gossiped {} evidence ids to {} peers", ids.len(), delivered);
        delivered
    }
}
