use meridian_core::{Address, Endpoint, Peer};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{decode_stream, InboundStream, Transport};
use crate::codec::{self, MAX_MESSAGE_SIZE};
use crate::error::{CodecError, TransportError};
use crate::message::{Identity, Message};

const INBOX_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    pub listen_addr: SocketAddr,
    pub connect_timeout: Duration,
    /// A peer that does not drain a message within this time is dropped
    pub write_timeout: Duration,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        TcpTransportConfig {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 7600)),
            connect_timeout: Duration::from_secs(3),
            write_timeout: Duration::from_secs(3),
        }
    }
}

type Connection = Arc<tokio::sync::Mutex<Option<TcpStream>>>;

/// TCP transport. Each message travels as `[len: u32][encoded message]`;
/// outbound connections are cached per destination and re-dialed once
/// when a write fails.
pub struct TcpTransport {
    local: Peer,
    config: TcpTransportConfig,
    bound_addr: SocketAddr,
    connections: Mutex<HashMap<Address, Connection>>,
    inbox: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    accept_task: JoinHandle<()>,
}

impl TcpTransport {
    /// Bind the listener and start accepting connections. A local endpoint
    /// with port 0 advertises the port the listener was given.
    pub async fn bind(local: Peer, config: TcpTransportConfig) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        let bound_addr = listener.local_addr()?;
        let local = match local.endpoint.port {
            0 => Peer::new(
                local.public_key,
                Endpoint::new(local.endpoint.host, bound_addr.port()),
            ),
            _ => local,
        };
        let (sender, receiver) = mpsc::channel(INBOX_CAPACITY);

        info!("Listening for peers on {}", bound_addr);
        let accept_task = tokio::spawn(accept_loop(listener, sender));

        Ok(TcpTransport {
            local,
            config,
            bound_addr,
            connections: Mutex::new(HashMap::new()),
            inbox: Mutex::new(Some(receiver)),
            accept_task,
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.bound_addr
    }

    fn connection(&self, address: Address) -> Connection {
        self.connections.lock().entry(address).or_default().clone()
    }

    async fn dial(&self, destination: &Peer) -> Result<TcpStream, String> {
        let target = (destination.endpoint.host.as_str(), destination.endpoint.port);
        match tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(target)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("connect timed out".to_string()),
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

impl Transport for TcpTransport {
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
        let connection = self.connection(destination.address());
        let mut slot = connection.lock().await;

        // A cached connection may have been closed by the remote side
        for attempt in 0..2 {
            let mut stream = match slot.take() {
                Some(stream) => stream,
                None => self.dial(destination).await.map_err(|reason| {
                    TransportError::DeliveryFailure {
                        peer: destination.to_string(),
                        reason,
                    }
                })?,
            };

            match write_message(&mut stream, &bytes, self.config.write_timeout).await {
                Ok(()) => {
                    *slot = Some(stream);
                    debug!("Posted {:?} to {}", message.kind(), destination.address());
                    return Ok(());
                }
                Err(e) if attempt == 1 => {
                    return Err(TransportError::DeliveryFailure {
                        peer: destination.to_string(),
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    debug!("Re-dialing {} after write error: {}", destination.address(), e);
                }
            }
        }

        Err(TransportError::DeliveryFailure {
            peer: destination.to_string(),
            reason: "no connection".to_string(),
        })
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

async fn accept_loop(listener: TcpListener, inbox: mpsc::Sender<Vec<u8>>) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                debug!("Accepted connection from {}", remote);
                tokio::spawn(read_loop(stream, remote, inbox.clone()));
            }
            Err(e) => {
                warn!("Accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn read_loop(mut stream: TcpStream, remote: SocketAddr, inbox: mpsc::Sender<Vec<u8>>) {
    loop {
        match read_message(&mut stream).await {
            Ok(Some(bytes)) => {
                if inbox.send(bytes).await.is_err() {
                    return;
                }
            }
            Ok(None) => {
                debug!("Connection from {} closed", remote);
                return;
            }
            Err(e) => {
                warn!("Dropping connection from {}: {}", remote, e);
                return;
            }
        }
    }
}

async fn write_message(
    stream: &mut TcpStream,
    bytes: &[u8],
    timeout: Duration,
) -> std::io::Result<()> {
    let write = async {
        stream.write_u32(bytes.len() as u32).await?;
        stream.write_all(bytes).await?;
        stream.flush().await
    };
    tokio::time::timeout(timeout, write)
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "write timed out"))?
}

/// Read one length-prefixed message. `None` on a clean close.
async fn read_message(stream: &mut TcpStream) -> Result<Option<Vec<u8>>, TransportError> {
    let len = match stream.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_MESSAGE_SIZE {
        return Err(CodecError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        }
        .into());
    }

    let mut bytes = vec![0u8; len];
    stream.read_exact(&mut bytes).await?;
    Ok(Some(bytes))
}
