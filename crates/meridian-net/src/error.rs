use meridian_core::CoreError;
use thiserror::Error;

use crate::message::MessageKind;

/// Protocol errors: the bytes on the wire are not a valid message
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Unknown message kind: {0:#04x}")]
    UnknownMessageKind(u8),

    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Delivery to {peer} failed: {reason}")]
    DeliveryFailure { peer: String, reason: String },

    #[error("Request to {peer} timed out")]
    Timeout { peer: String },

    #[error("Inbound stream already taken")]
    AlreadyReceiving,

    #[error("Transport closed")]
    Closed,

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Errors that say nothing about the remote peer's health
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            TransportError::AlreadyReceiving | TransportError::Closed | TransportError::Codec(_)
        )
    }
}

/// Validation failures raised by message handlers
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Peer request from own address")]
    SelfPing,

    #[error("Unexpected message kind {0:?}")]
    UnexpectedMessage(MessageKind),

    #[error("Rejected: {0}")]
    Rejected(String),

    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

#[derive(Debug, Error)]
pub enum NetError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Unexpected reply: expected {expected:?}, got {got:?}")]
    UnexpectedReply {
        expected: MessageKind,
        got: MessageKind,
    },

    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),
}
