//! Kademlia peer discovery.
//!
//! Every inbound message teaches the directory about its sender. Peers
//! answer `PeerRequest` with their closest known neighbors, which drives the
//! iterative `lookup` used for bootstrap.

use meridian_core::{Address, Peer};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::dispatcher::{Dispatcher, MessageHandler, MessageObserver, Outbound};
use crate::error::{HandlerError, NetError};
use crate::message::{Envelope, Message, MessageKind};
use crate::peer_directory::PeerDirectory;
use crate::request::RequestTracker;
use crate::transport::Transport;

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Neighbors requested per query and kept per lookup
    pub k: usize,
    /// Parallel queries per lookup round
    pub alpha: usize,
    pub max_rounds: usize,
    pub request_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            k: 16,
            alpha: 3,
            max_rounds: 8,
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Adds the sender of every inbound message to the directory
pub struct PassiveLearning {
    directory: Arc<PeerDirectory>,
}

impl PassiveLearning {
    pub fn new(directory: Arc<PeerDirectory>) -> Self {
        PassiveLearning { directory }
    }
}

impl MessageObserver for PassiveLearning {
    fn observe(&self, envelope: &Envelope) {
        // The directory ignores our own address
        self.directory.add_or_update(envelope.sender.clone());
    }
}

/// Answers `PeerRequest` with the closest known peers to the target
pub struct PeerRequestHandler {
    local: Peer,
    directory: Arc<PeerDirectory>,
    /// Upper bound on peers per response, whatever the requester asks for
    max_peers: usize,
}

impl PeerRequestHandler {
    pub fn new(local: Peer, directory: Arc<PeerDirectory>, max_peers: usize) -> Self {
        PeerRequestHandler {
            local,
            directory,
            max_peers,
        }
    }
}

impl MessageHandler for PeerRequestHandler {
    fn handle(
        &self,
        envelope: &Envelope,
        message: &Message,
    ) -> Result<Vec<Outbound>, HandlerError> {
        let Message::PeerRequest { target, k } = message else {
            return Err(HandlerError::UnexpectedMessage(message.kind()));
        };
        if envelope.sender.address() == self.local.address() {
            return Err(HandlerError::SelfPing);
        }

        let k = usize::try_from(*k).unwrap_or(usize::MAX).min(self.max_peers);
        let mut peers = Vec::new();
        if *target == self.local.address() && k > 0 {
            peers.push(self.local.clone());
        }
        peers.extend(self.directory.get_neighbors(target, k, true));
        peers.truncate(k);

        debug!(
            "Answering peer request from {} with {} peers",
            envelope.sender.address(),
            peers.len()
        );
        Ok(vec![Outbound::reply_to(
            envelope,
            Message::PeerResponse { peers },
        )])
    }
}

/// Answers `Ping` with `Pong`
pub struct PingHandler;

impl MessageHandler for PingHandler {
    fn handle(
        &self,
        envelope: &Envelope,
        message: &Message,
    ) -> Result<Vec<Outbound>, HandlerError> {
        match message {
            Message::Ping => Ok(vec![Outbound::reply_to(envelope, Message::Pong)]),
            other => Err(HandlerError::UnexpectedMessage(other.kind())),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub pinged: usize,
    pub responsive: usize,
    pub dropped: usize,
}

/// Client side of discovery
pub struct Discovery<T: Transport> {
    transport: Arc<T>,
    tracker: Arc<RequestTracker>,
    directory: Arc<PeerDirectory>,
    config: DiscoveryConfig,
}

impl<T: Transport> Discovery<T> {
    pub fn new(
        transport: Arc<T>,
        tracker: Arc<RequestTracker>,
        directory: Arc<PeerDirectory>,
        config: DiscoveryConfig,
    ) -> Self {
        Discovery {
            transport,
            tracker,
            directory,
            config,
        }
    }

    /// Install passive learning and the discovery handlers
    pub fn register(&self, dispatcher: &mut Dispatcher) {
        let local = self.transport.local_peer().clone();
        dispatcher.register_observer(Arc::new(PassiveLearning::new(self.directory.clone())));
        dispatcher.register(
            MessageKind::PeerRequest,
            Arc::new(PeerRequestHandler::new(
                local,
                self.directory.clone(),
                self.config.k,
            )),
        );
        dispatcher.register(MessageKind::Ping, Arc::new(PingHandler));
    }

    pub fn directory(&self) -> &Arc<PeerDirectory> {
        &self.directory
    }

    fn local_address(&self) -> Address {
        self.transport.local_peer().address()
    }

    /// Liveness check. The outcome is recorded in the directory.
    pub async fn ping(&self, peer: &Peer) -> Result<(), NetError> {
        let result = self
            .tracker
            .request(
                self.transport.as_ref(),
                peer,
                Message::Ping,
                self.config.request_timeout,
            )
            .await;

        match result {
            Ok((_, Message::Pong)) => {
                self.directory.add_or_update(peer.clone());
                self.directory.record_success(&peer.address());
                Ok(())
            }
            Ok((_, other)) => {
                self.directory.record_failure(&peer.address());
                Err(NetError::UnexpectedReply {
                    expected: MessageKind::Pong,
                    got: other.kind(),
                })
            }
            Err(e) => {
                self.directory.record_failure(&peer.address());
                Err(e.into())
            }
        }
    }

    /// Ask `peer` for its `k` closest neighbors to `target`. Returned peers
    /// other than ourselves are added to the directory.
    pub async fn find_neighbors(
        &self,
        peer: &Peer,
        target: &Address,
        k: usize,
    ) -> Result<Vec<Peer>, NetError> {
        let request = Message::PeerRequest {
            target: *target,
            k: u32::try_from(k).unwrap_or(u32::MAX),
        };
        let reply = self
            .tracker
            .request(
                self.transport.as_ref(),
                peer,
                request,
                self.config.request_timeout,
            )
            .await;

        let peers = match reply {
            Ok((_, Message::PeerResponse { peers })) => peers,
            Ok((_, other)) => {
                self.directory.record_failure(&peer.address());
                return Err(NetError::UnexpectedReply {
                    expected: MessageKind::PeerResponse,
                    got: other.kind(),
                });
            }
            Err(e) => {
                self.directory.record_failure(&peer.address());
                return Err(e.into());
            }
        };

        self.directory.record_success(&peer.address());
        let local = self.local_address();
        let peers: Vec<Peer> = peers
            .into_iter()
            .filter(|p| p.address() != local)
            .take(k)
            .collect();
        for p in &peers {
            self.directory.add_or_update(p.clone());
        }
        Ok(peers)
    }

    /// Iterative lookup: query the `alpha` closest unqueried peers each
    /// round until a round learns nothing closer. Returns the `k` closest
    /// peers found.
    pub async fn lookup(&self, target: &Address) -> Vec<Peer> {
        let k = self.config.k;
        let mut closest = self.directory.get_neighbors(target, k, true);
        let mut queried: HashSet<Address> = HashSet::new();

        for round in 0..self.config.max_rounds {
            let batch: Vec<Peer> = closest
                .iter()
                .filter(|p| !queried.contains(&p.address()))
                .take(self.config.alpha)
                .cloned()
                .collect();
            if batch.is_empty() {
                break;
            }
            for peer in &batch {
                queried.insert(peer.address());
            }

            let best_before = closest.first().map(|p| p.address());
            let responses = futures_util::future::join_all(
                batch.iter().map(|peer| self.find_neighbors(peer, target, k)),
            )
            .await;

            let mut learned = 0;
            for (peer, response) in batch.iter().zip(responses) {
                match response {
                    Ok(found) => {
                        for candidate in found {
                            if !closest.iter().any(|c| c.address() == candidate.address()) {
                                closest.push(candidate);
                                learned += 1;
                            }
                        }
                    }
                    Err(e) => {
                        debug!("Lookup query to {} failed: {}", peer.address(), e);
                        closest.retain(|c| c.address() != peer.address());
                    }
                }
            }

            closest.sort_by(|a, b| target.cmp_distance(&a.address(), &b.address()));
            closest.truncate(k);

            let best_after = closest.first().map(|p| p.address());
            debug!(
                "Lookup round {} for {}: learned {} peers",
                round, target, learned
            );
            let improved = match (best_before, best_after) {
                (Some(before), Some(after)) => target.cmp_distance(&after, &before).is_lt(),
                (None, Some(_)) => true,
                _ => false,
            };
            if !improved && closest.iter().all(|p| queried.contains(&p.address())) {
                break;
            }
        }

        closest
    }

    /// Ping the seeds, then look up our own address to fill the directory.
    /// Returns the number of responsive seeds.
    pub async fn bootstrap(&self, seeds: &[Peer]) -> usize {
        let local = self.local_address();
        let mut responsive = 0;
        for seed in seeds.iter().filter(|s| s.address() != local) {
            match self.ping(seed).await {
                Ok(()) => responsive += 1,
                Err(e) => warn!("Seed {} unreachable: {}", seed, e),
            }
        }

        if responsive == 0 && !seeds.is_empty() {
            warn!("No seed peer responded");
        }
        let found = self.lookup(&local).await;
        info!(
            "Bootstrap complete: {} seeds responsive, {} peers near self, {} known",
            responsive,
            found.len(),
            self.directory.len()
        );
        responsive
    }

    /// Ping peers not seen within `stale_after`
    pub async fn refresh(&self, stale_after: Duration) -> RefreshReport {
        let stale = self.directory.stale_peers(stale_after);
        let mut report = RefreshReport {
            pinged: stale.len(),
            ..Default::default()
        };

        for peer in stale {
            match self.ping(&peer).await {
                Ok(()) => report.responsive += 1,
                Err(_) if !self.directory.contains(&peer.address()) => report.dropped += 1,
                Err(_) => {}
            }
        }

        if report.pinged > 0 {
            debug!(
                "Refreshed {} stale peers: {} responsive, {} dropped",
                report.pinged, report.responsive, report.dropped
            );
        }
        report
    }

    /// Refresh stale peers every `interval` until the task is dropped
    pub async fn run_refresh(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.refresh(interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer_directory::PeerDirectoryConfig;
    use crate::message::Identity;
    use meridian_core::{Endpoint, KeyPair};

    fn peer(seed: u8) -> Peer {
        Peer::new(KeyPair::from_seed(seed).public, Endpoint::new("mem", seed as u16))
    }

    fn request_from(seed: u8, target: Address, k: u32) -> (Envelope, Message) {
        let envelope = Envelope {
            sender: peer(seed),
            identity: Some(Identity::random()),
            kind: MessageKind::PeerRequest,
        };
        (envelope, Message::PeerRequest { target, k })
    }

    fn directory_for(seed: u8) -> Arc<PeerDirectory> {
        Arc::new(PeerDirectory::new(
            peer(seed).address(),
            PeerDirectoryConfig::default(),
        ))
    }

    #[test]
    fn test_peer_request_from_self_rejected() {
        let directory = directory_for(1);
        let handler = PeerRequestHandler::new(peer(1), directory, 16);

        let (envelope, message) = request_from(1, peer(2).address(), 4);
        assert!(matches!(
            handler.handle(&envelope, &message),
            Err(HandlerError::SelfPing)
        ));
    }

    #[test]
    fn test_peer_request_returns_closest() {
        let directory = directory_for(1);
        for seed in 2..12 {
            directory.add_or_update(peer(seed));
        }
        let handler = PeerRequestHandler::new(peer(1), directory.clone(), 16);

        let target = peer(5).address();
        let (envelope, message) = request_from(20, target, 3);
        let replies = handler.handle(&envelope, &message).unwrap();

        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].destination, peer(20));
        assert_eq!(replies[0].identity, envelope.identity);
        let Message::PeerResponse { peers } = &replies[0].message else {
            panic!("expected peer response");
        };
        assert_eq!(peers.len(), 3);
        // Exact match is included for peer requests
        assert_eq!(peers[0], peer(5));
        assert_eq!(*peers, directory.get_neighbors(&target, 3, true));
    }

    #[test]
    fn test_responder_includes_itself_for_own_address() {
        let directory = directory_for(1);
        directory.add_or_update(peer(2));
        let handler = PeerRequestHandler::new(peer(1), directory, 16);

        let (envelope, message) = request_from(3, peer(1).address(), 2);
        let replies = handler.handle(&envelope, &message).unwrap();
        let Message::PeerResponse { peers } = &replies[0].message else {
            panic!("expected peer response");
        };
        assert_eq!(peers[0], peer(1));
        assert_eq!(peers.len(), 2);
    }

    #[test]
    fn test_peer_request_count_is_capped() {
        let directory = directory_for(1);
        for seed in 2..12 {
            directory.add_or_update(peer(seed));
        }
        let handler = PeerRequestHandler::new(peer(1), directory, 4);

        let (envelope, message) = request_from(20, peer(1).address(), u32::MAX);
        let replies = handler.handle(&envelope, &message).unwrap();
        let Message::PeerResponse { peers } = &replies[0].message else {
            panic!("expected peer response");
        };
        assert_eq!(peers.len(), 4);
        assert_eq!(peers[0], peer(1));
    }

    #[test]
    fn test_passive_learning_skips_self() {
        let directory = directory_for(1);
        let observer = PassiveLearning::new(directory.clone());

        observer.observe(&Envelope {
            sender: peer(1),
            identity: None,
            kind: MessageKind::Ping,
        });
        observer.observe(&Envelope {
            sender: peer(2),
            identity: None,
            kind: MessageKind::Ping,
        });

        assert_eq!(directory.peers(), vec![peer(2)]);
    }

    #[test]
    fn test_ping_handler_replies_pong() {
        let envelope = Envelope {
            sender: peer(4),
            identity: Some(Identity::random()),
            kind: MessageKind::Ping,
        };
        let replies = PingHandler.handle(&envelope, &Message::Ping).unwrap();
        assert_eq!(replies, vec![Outbound::reply_to(&envelope, Message::Pong)]);
    }
}
