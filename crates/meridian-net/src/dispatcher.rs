//! Routes inbound messages to the handler registered for their kind.

use futures_util::StreamExt;
use meridian_core::{Address, Peer};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::error::{HandlerError, TransportError};
use crate::message::{Envelope, Identity, Message, MessageKind};
use crate::peer_directory::PeerDirectory;
use crate::request::RequestTracker;
use crate::transport::Transport;

/// A message a handler wants sent
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub destination: Peer,
    pub message: Message,
    pub identity: Option<Identity>,
}

impl Outbound {
    /// Answer `envelope`, correlated with its identity
    pub fn reply_to(envelope: &Envelope, message: Message) -> Self {
        Outbound {
            destination: envelope.sender.clone(),
            message,
            identity: envelope.identity,
        }
    }

    pub fn send(destination: Peer, message: Message) -> Self {
        Outbound {
            destination,
            message,
            identity: None,
        }
    }
}

pub trait MessageHandler: Send + Sync {
    fn handle(&self, envelope: &Envelope, message: &Message)
        -> Result<Vec<Outbound>, HandlerError>;
}

impl<F> MessageHandler for F
where
    F: Fn(&Envelope, &Message) -> Result<Vec<Outbound>, HandlerError> + Send + Sync,
{
    fn handle(
        &self,
        envelope: &Envelope,
        message: &Message,
    ) -> Result<Vec<Outbound>, HandlerError> {
        self(envelope, message)
    }
}

/// Sees every inbound message before its handler runs
pub trait MessageObserver: Send + Sync {
    fn observe(&self, envelope: &Envelope);
}

#[derive(Debug)]
pub enum DispatchOutcome {
    Handled(Vec<Outbound>),
    Unhandled,
    Failed(HandlerError),
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub max_concurrent_handlers: usize,
    /// Protocol errors from one sender before its priority is lowered
    pub protocol_error_threshold: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            max_concurrent_handlers: 64,
            protocol_error_threshold: 3,
        }
    }
}

pub struct Dispatcher {
    config: DispatcherConfig,
    handlers: HashMap<MessageKind, Arc<dyn MessageHandler>>,
    observers: Vec<Arc<dyn MessageObserver>>,
    directory: Option<Arc<PeerDirectory>>,
    protocol_errors: Mutex<HashMap<Address, u32>>,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        Dispatcher {
            config,
            handlers: HashMap::new(),
            observers: Vec::new(),
            directory: None,
            protocol_errors: Mutex::new(HashMap::new()),
        }
    }

    /// Report misbehaving and unreachable peers to `directory`
    pub fn with_directory(mut self, directory: Arc<PeerDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Register the handler for `kind`, returning any handler it replaces
    pub fn register(
        &mut self,
        kind: MessageKind,
        handler: Arc<dyn MessageHandler>,
    ) -> Option<Arc<dyn MessageHandler>> {
        debug!("Registered handler for {:?}", kind);
        self.handlers.insert(kind, handler)
    }

    pub fn register_observer(&mut self, observer: Arc<dyn MessageObserver>) {
        self.observers.push(observer);
    }

    pub fn has_handler(&self, kind: MessageKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Run the observers, then the handler for the message's kind
    pub fn dispatch(&self, envelope: &Envelope, message: &Message) -> DispatchOutcome {
        self.observe(envelope);
        self.route(envelope, message)
    }

    fn observe(&self, envelope: &Envelope) {
        for observer in &self.observers {
            observer.observe(envelope);
        }
    }

    fn route(&self, envelope: &Envelope, message: &Message) -> DispatchOutcome {
        let Some(handler) = self.handlers.get(&message.kind()) else {
            // A reply whose request already timed out is not the sender's fault
            if message.kind().is_reply() {
                debug!(
                    "Dropping uncorrelated {:?} from {}",
                    message.kind(),
                    envelope.sender.address()
                );
                return DispatchOutcome::Unhandled;
            }
            debug!(
                "No handler for {:?} from {}",
                message.kind(),
                envelope.sender.address()
            );
            self.record_protocol_error(&envelope.sender.address());
            return DispatchOutcome::Unhandled;
        };

        match handler.handle(envelope, message) {
            Ok(replies) => DispatchOutcome::Handled(replies),
            Err(e) => {
                warn!(
                    "Handler for {:?} from {} failed: {}",
                    message.kind(),
                    envelope.sender.address(),
                    e
                );
                DispatchOutcome::Failed(e)
            }
        }
    }

    /// Count a protocol error. Every `protocol_error_threshold` errors the
    /// sender's directory priority drops.
    pub fn record_protocol_error(&self, sender: &Address) {
        let reached = {
            let mut counts = self.protocol_errors.lock();
            let count = counts.entry(*sender).or_insert(0);
            *count += 1;
            if *count >= self.config.protocol_error_threshold {
                *count = 0;
                true
            } else {
                false
            }
        };

        if reached {
            info!("Peer {} exceeded protocol error threshold", sender);
            if let Some(directory) = &self.directory {
                directory.record_failure(sender);
            }
        }
    }

    pub fn protocol_errors(&self, sender: &Address) -> u32 {
        self.protocol_errors.lock().get(sender).copied().unwrap_or(0)
    }

    /// Receive loop. Correlated replies go to `tracker`; everything else is
    /// dispatched on its own task and the handler's replies are posted.
    pub async fn run<T: Transport>(
        self: Arc<Self>,
        transport: Arc<T>,
        tracker: Arc<RequestTracker>,
    ) -> Result<(), TransportError> {
        let mut inbound = transport.receive()?;
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_handlers.max(1)));
        info!("Dispatcher started for {}", transport.local_peer().address());

        while let Some(item) = inbound.next().await {
            let (envelope, message) = match item {
                Ok(received) => received,
                Err(e) => {
                    warn!("Dropping undecodable message: {}", e);
                    if let Some(sender) = &e.sender {
                        self.record_protocol_error(&sender.address());
                    }
                    continue;
                }
            };

            // Replies prove liveness too, so observers see them before the
            // tracker claims them
            self.observe(&envelope);
            let Some((envelope, message)) = tracker.try_complete(envelope, message) else {
                continue;
            };

            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };
            let dispatcher = self.clone();
            let transport = transport.clone();
            tokio::spawn(async move {
                let _permit = permit;
                if let DispatchOutcome::Handled(replies) = dispatcher.route(&envelope, &message) {
                    dispatcher.post_all(transport.as_ref(), replies).await;
                }
            });
        }

        info!("Dispatcher stopped: inbound stream ended");
        Ok(())
    }

    /// Post handler output. Delivery errors are logged and scored.
    pub async fn post_all<T: Transport>(&self, transport: &T, outbound: Vec<Outbound>) {
        for item in outbound {
            let destination = item.destination.address();
            if let Err(e) = transport
                .post(&item.destination, item.message, item.identity)
                .await
            {
                warn!("Failed to post to {}: {}", destination, e);
                if !e.is_local() {
                    if let Some(directory) = &self.directory {
                        directory.record_failure(&destination);
                    }
                }
            }
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DispatcherConfig::default())
    }
}
