use log::{debug, info};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::protocol::{read_message, write_message, Message, PeerIdentity, PROTOCOL_VERSION};
use super::registry::{PeerRecord, PeerRegistry};
use crate::error::{PeerError, Result};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(3);

/// Open a TCP connection, mapping expiry to `Timeout` and refusal to `Unreachable`.
pub(crate) async fn connect_with_timeout(addr: SocketAddr, wait: Duration) -> Result<TcpStream> {
    match timeout(wait, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(PeerError::Unreachable { addr, source }),
        Err(_) => Err(PeerError::timeout("connecting", wait)),
    }
}

/// Runs the handshake as the initiating side.
#[derive(Clone)]
pub struct PeerConnector {
    identity: PeerIdentity,
    local_name: String,
    local_port: u16,
    registry: PeerRegistry,
    connect_timeout: Duration,
    ack_timeout: Duration,
}

impl PeerConnector {
    pub fn new(
        identity: PeerIdentity,
        local_name: String,
        local_port: u16,
        registry: PeerRegistry,
    ) -> Self {
        Self {
            identity,
            local_name,
            local_port,
            registry,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, connect_timeout: Duration, ack_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self.ack_timeout = ack_timeout;
        self
    }

    /// Connect to `ip:port`, handshake, and register the remote under its own peer id.
    ///
    /// Nothing is registered unless the acknowledgment is valid. The stream is
    /// closed on return either way.
    pub async fn connect(&self, ip: IpAddr, port: u16, display_name: &str) -> Result<PeerRecord> {
        let addr = SocketAddr::new(ip, port);
        debug!("Connecting to {} ({})", addr, display_name);

        let mut stream = connect_with_timeout(addr, self.connect_timeout).await?;

        let handshake = Message::Handshake {
            protocol_version: PROTOCOL_VERSION,
            peer_id: self.identity.to_string(),
            name: self.local_name.clone(),
            port: self.local_port,
        };
        write_message(&mut stream, &handshake).await?;

        let remote_id = match read_message(&mut stream, self.ack_timeout).await? {
            Message::HandshakeAck {
                protocol_version,
                peer_id,
            } => {
                if protocol_version != PROTOCOL_VERSION {
                    return Err(PeerError::ProtocolViolation(format!(
                        "peer {} speaks protocol version {}, expected {}",
                        addr, protocol_version, PROTOCOL_VERSION
                    )));
                }
                if peer_id.is_empty() {
                    return Err(PeerError::ProtocolViolation(
                        "handshake_ack carried an empty peer_id".to_string(),
                    ));
                }
                peer_id
            }
            other => {
                return Err(PeerError::ProtocolViolation(format!(
                    "expected handshake_ack, got {}",
                    other.type_name()
                )))
            }
        };

        let record = PeerRecord::new(remote_id, ip, port, display_name);
        self.registry.upsert(record.clone());
        info!("Handshake with {} complete, peer id {}", addr, record.peer_id);
        Ok(record)
    }
}
