use serde::{Deserialize, Serialize};
use std::fmt;

use crate::crypto::{Address, PublicKey};
use crate::error::CoreError;

/// Network endpoint of a peer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Endpoint {
            host: host.into(),
            port,
        }
    }

    /// Parse a `host:port` string
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| CoreError::InvalidEndpoint(s.to_string()))?;
        if host.is_empty() {
            return Err(CoreError::InvalidEndpoint(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| CoreError::InvalidEndpoint(s.to_string()))?;
        Ok(Endpoint::new(host, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A remote node: its public key and where to reach it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Peer {
    pub public_key: PublicKey,
    pub endpoint: Endpoint,
}

impl Peer {
    pub fn new(public_key: PublicKey, endpoint: Endpoint) -> Self {
        Peer {
            public_key,
            endpoint,
        }
    }

    /// Identity of the peer in the routing table
    pub fn address(&self) -> Address {
        self.public_key.address()
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.address(), self.endpoint)
    }
}
