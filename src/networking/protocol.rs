use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use uuid::Uuid;

use crate::error::{PeerError, Result};

/// Version carried by `handshake` and `handshake_ack`.
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound for any in-band JSON message, read in a single `recv`.
pub const MAX_MESSAGE_SIZE: usize = 4096;

/// Plain-text reply tokens for a transfer request.
pub const ACCEPTED: &[u8] = b"accepted";
pub const REJECTED: &[u8] = b"rejected";

/// Random per-process identity token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerIdentity(String);

impl PeerIdentity {
    /// Generate a fresh 8 hex character identity
    pub fn generate() -> Self {
        let uuid = Uuid::new_v4().simple().to_string();
        Self(uuid[..8].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether an advertised id refers to this process
    pub fn is_self(&self, peer_id: &str) -> bool {
        self.0 == peer_id
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Every JSON message exchanged between peers, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Discovery {
        peer_id: String,
        ip: String,
        port: u16,
    },
    DiscoveryResponse {
        peer_id: String,
        port: u16,
        name: String,
    },
    Handshake {
        protocol_version: u32,
        peer_id: String,
        name: String,
        port: u16,
    },
    HandshakeAck {
        protocol_version: u32,
        peer_id: String,
    },
    FileTransfer {
        file_name: String,
        file_size: u64,
    },
}

impl Message {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Discovery { .. } => "discovery",
            Self::DiscoveryResponse { .. } => "discovery_response",
            Self::Handshake { .. } => "handshake",
            Self::HandshakeAck { .. } => "handshake_ack",
            Self::FileTransfer { .. } => "file_transfer",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse one message from a datagram or a single read.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(PeerError::ProtocolViolation(format!(
                "message of {} bytes exceeds the {} byte limit",
                bytes.len(),
                MAX_MESSAGE_SIZE
            )));
        }
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Write a message as the whole payload of one write.
pub async fn write_message<W>(stream: &mut W, message: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = message.encode()?;
    debug!("-> {} ({} bytes)", message.type_name(), bytes.len());
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one message with a single `read` call, bounded by `wait`.
///
/// End-of-stream before any byte arrives is a protocol violation.
pub async fn read_message<R>(stream: &mut R, wait: Duration) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
    let n = timeout(wait, stream.read(&mut buf))
        .await
        .map_err(|_| PeerError::timeout("waiting for a message", wait))??;

    if n == 0 {
        return Err(PeerError::ProtocolViolation(
            "connection closed before a message arrived".to_string(),
        ));
    }

    let message = Message::decode(&buf[..n])?;
    debug!("<- {} ({} bytes)", message.type_name(), n);
    Ok(message)
}
