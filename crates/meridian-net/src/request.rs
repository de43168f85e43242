use meridian_core::{Address, Peer};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::TransportError;
use crate::message::{Envelope, Identity, Message};
use crate::transport::Transport;

type Reply = (Envelope, Message);

struct Waiter {
    /// Only the addressed peer may answer
    peer: Address,
    sender: oneshot::Sender<Reply>,
}

/// Correlates replies with outstanding requests by `Identity`
#[derive(Default)]
pub struct RequestTracker {
    pending: Mutex<HashMap<Identity, Waiter>>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Post `message` and wait for the correlated reply
    pub async fn request<T: Transport>(
        &self,
        transport: &T,
        destination: &Peer,
        message: Message,
        timeout: Duration,
    ) -> Result<Reply, TransportError> {
        let identity = Identity::random();
        let (sender, receiver) = oneshot::channel();
        self.pending.lock().insert(
            identity,
            Waiter {
                peer: destination.address(),
                sender,
            },
        );

        if let Err(e) = transport.post(destination, message, Some(identity)).await {
            self.pending.lock().remove(&identity);
            return Err(e);
        }

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.pending.lock().remove(&identity);
                Err(TransportError::Timeout {
                    peer: destination.to_string(),
                })
            }
        }
    }

    /// Hand a reply to its waiting request. Anything that is not a reply
    /// from the addressed peer is returned for regular dispatch.
    pub fn try_complete(&self, envelope: Envelope, message: Message) -> Option<Reply> {
        let identity = match envelope.identity {
            Some(identity) if envelope.kind.is_reply() => identity,
            _ => return Some((envelope, message)),
        };

        let waiter = {
            let mut pending = self.pending.lock();
            let addressed = pending
                .get(&identity)
                .is_some_and(|waiter| waiter.peer == envelope.sender.address());
            if addressed {
                pending.remove(&identity)
            } else {
                None
            }
        };
        let Some(waiter) = waiter else {
            return Some((envelope, message));
        };

        if waiter.sender.send((envelope, message)).is_err() {
            debug!("Reply {:?} arrived after its request gave up", identity);
        }
        None
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}
