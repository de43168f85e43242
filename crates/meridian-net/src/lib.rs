//! Meridian Net - Peer-to-peer messaging
//!
//! This crate provides the wire codec, the Kademlia peer directory,
//! transports with request/response correlation, typed message dispatch,
//! peer discovery and evidence exchange.

pub mod codec;
pub mod discovery;
pub mod dispatcher;
pub mod error;
pub mod evidence_exchange;
pub mod message;
pub mod peer_directory;
pub mod request;
pub mod transport;

pub use codec::{DecodeError, Frame, MAX_MESSAGE_SIZE};
pub use discovery::{
    Discovery, DiscoveryConfig, PassiveLearning, PeerRequestHandler, PingHandler, RefreshReport,
};
pub use dispatcher::{
    DispatchOutcome, Dispatcher, DispatcherConfig, MessageHandler, MessageObserver, Outbound,
};
pub use error::{CodecError, HandlerError, NetError, TransportError};
pub use evidence_exchange::{EvidenceExchange, EvidenceSource};
pub use message::{Envelope, Identity, Message, MessageKind};
pub use peer_directory::{AddOutcome, DirectoryStats, PeerDirectory, PeerDirectoryConfig, PeerRecord};
pub use request::RequestTracker;
pub use transport::{
    InboundStream, MemoryNetwork, MemoryTransport, TcpTransport, TcpTransportConfig, Transport,
};
