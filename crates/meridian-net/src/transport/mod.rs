//! Message transports.

mod memory;
mod tcp;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use tcp::{TcpTransport, TcpTransportConfig};

use futures_util::stream::BoxStream;
use meridian_core::Peer;
use std::future::Future;

use crate::codec::DecodeError;
use crate::error::TransportError;
use crate::message::{Envelope, Identity, Message};

/// Inbound messages in arrival order. Undecodable input is yielded as an
/// error so the receiver can account for it.
pub type InboundStream = BoxStream<'static, Result<(Envelope, Message), DecodeError>>;

pub trait Transport: Send + Sync + 'static {
    /// The peer this transport sends as
    fn local_peer(&self) -> &Peer;

    /// Deliver a message to `destination`. Failures are per-peer and
    /// retryable.
    fn post(
        &self,
        destination: &Peer,
        message: Message,
        identity: Option<Identity>,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Take the inbound stream. Only the first call succeeds.
    fn receive(&self) -> Result<InboundStream, TransportError>;
}

/// Turn a channel of raw message bytes into an inbound stream
pub(crate) fn decode_stream(
    receiver: tokio::sync::mpsc::Receiver<Vec<u8>>,
) -> InboundStream {
    use futures_util::StreamExt;

    futures_util::stream::unfold(receiver, |mut receiver| async move {
        let bytes = receiver.recv().await?;
        Some((crate::codec::decode(&bytes), receiver))
    })
    .boxed()
}
