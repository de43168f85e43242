use meridian_core::{Address, Peer};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use super::{decode_stream, InboundStream, Transport};
use crate::codec;
use crate::error::TransportError;
use crate::message::{Identity, Message};

const INBOX_CAPACITY: usize = 1024;

#[derive(Default)]
struct Hub {
    inboxes: HashMap<Address, mpsc::Sender<Vec<u8>>>,
    disconnected: HashSet<Address>,
}

/// In-process network connecting `MemoryTransport`s. Messages still pass
/// through the wire codec.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a peer, replacing any previous attachment of the same address
    pub fn connect(&self, local: Peer) -> MemoryTransport {
        let (sender, receiver) = mpsc::channel(INBOX_CAPACITY);
        let mut hub = self.hub.lock();
        hub.inboxes.insert(local.address(), sender);
        hub.disconnected.remove(&local.address());

        MemoryTransport {
            local,
            network: self.clone(),
            inbox: Mutex::new(Some(receiver)),
        }
    }

    /// Make a peer unreachable in both directions
    pub fn disconnect(&self, address: &Address) {
        self.hub.lock().disconnected.insert(*address);
    }

    pub fn reconnect(&self, address: &Address) {
        self.hub.lock().disconnected.remove(address);
    }

    fn route(&self, from: &Address, to: &Address) -> Result<mpsc::Sender<Vec<u8>>, String> {
        let hub = self.hub.lock();
        if hub.disconnected.contains(from) || hub.disconnected.contains(to) {
            return Err("peer disconnected".to_string());
        }
        hub.inboxes
            .get(to)
            .cloned()
            .ok_or_else(|| "no such peer".to_string())
    }
}

pub struct MemoryTransport {
    local: Peer,
    network: MemoryNetwork,
    inbox: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
}

impl MemoryTransport {
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

impl Transport for MemoryTransport {
    fn local_peer(&self) -> &Peer {
        &self.local
    }

    async fn post(
        &self,
        destination: &Peer,
        message: Message,
        identity: Option<Identity>,
    ) -> Result<(), TransportError> {
        let bytes = codec::encode(&self.local, identity, &message)?;
        let failure = |reason: String| TransportError::DeliveryFailure {
            peer: destination.to_string(),
            reason,
        };

        let inbox = self
            .network
            .route(&self.local.address(), &destination.address())
            .map_err(failure)?;
        inbox
            .send(bytes)
            .await
            .map_err(|_| failure("inbox closed".to_string()))?;

        debug!("Posted {:?} to {}", message.kind(), destination.address());
        Ok(())
    }

    fn receive(&self) -> Result<InboundStream, TransportError> {
        let receiver = self
            .inbox
            .lock()
            .take()
            .ok_or(TransportError::AlreadyReceiving)?;
        Ok(decode_stream(receiver))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use meridian_core::{Endpoint, KeyPair};

    fn peer(seed: u8) -> Peer {
        Peer::new(KeyPair::from_seed(seed).public, Endpoint::new("mem", seed as u16))
    }

    #[tokio::test]
    async fn test_post_and_receive() {
        let network = MemoryNetwork::new();
        let a = network.connect(peer(1));
        let b = network.connect(peer(2));

        let identity = Identity::random();
        a.post(b.local_peer(), Message::Ping, Some(identity))
            .await
            .unwrap();

        let mut inbound = b.receive().unwrap();
        let (envelope, message) = inbound.next().await.unwrap().unwrap();
        assert_eq!(envelope.sender, peer(1));
        assert_eq!(envelope.identity, Some(identity));
        assert_eq!(message, Message::Ping);
    }

    #[tokio::test]
    async fn test_receive_only_once() {
        let network = MemoryNetwork::new();
        let a = network.connect(peer(1));

        let _inbound = a.receive().unwrap();
        assert!(matches!(a.receive(), Err(TransportError::AlreadyReceiving)));
    }

    #[tokio::test]
    async fn test_unreachable_peer() {
        let network = MemoryNetwork::new();
        let a = network.connect(peer(1));
        let b = network.connect(peer(2));

        let err = a.post(&peer(3), Message::Ping, None).await.unwrap_err();
        assert!(matches!(err, TransportError::DeliveryFailure { .. }));

        network.disconnect(&b.local_peer().address());
        assert!(a.post(b.local_peer(), Message::Ping, None).await.is_err());

        network.reconnect(&b.local_peer().address());
        assert!(a.post(b.local_peer(), Message::Ping, None).await.is_ok());
    }
}
