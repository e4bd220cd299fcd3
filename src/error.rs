use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Errors produced by the peer communication layer.
///
/// Only `BindFailure` is ever fatal (to `start`). Everything else is scoped
/// to a single connection or transfer.
#[derive(Debug, Error)]
pub enum PeerError {
    /// The data port could not be bound.
    #[error("Failed to bind {addr}: {source}")]
    BindFailure {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// A connect or response wait expired.
    #[error("Timed out after {after:?} while {operation}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// The remote host refused or could not be reached.
    #[error("Peer {addr} is unreachable: {source}")]
    Unreachable {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Malformed JSON, missing `type`, wrong version or an unexpected message.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Read or write failure on a socket or file.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The receiver answered the transfer request with something other than `accepted`.
    #[error("Transfer of {file_name} was rejected")]
    Rejected { file_name: String },

    /// No registry entry for the requested peer.
    #[error("Unknown peer: {0}")]
    UnknownPeer(String),
}

/// Flat discriminant of [`PeerError`], handy for callers that only branch on the category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    BindFailure,
    Timeout,
    Unreachable,
    ProtocolViolation,
    IoFailure,
    Rejected,
    UnknownPeer,
}

impl PeerError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::BindFailure { .. } => FailureKind::BindFailure,
            Self::Timeout { .. } => FailureKind::Timeout,
            Self::Unreachable { .. } => FailureKind::Unreachable,
            Self::ProtocolViolation(_) => FailureKind::ProtocolViolation,
            Self::Io(_) => FailureKind::IoFailure,
            Self::Rejected { .. } => FailureKind::Rejected,
            Self::UnknownPeer(_) => FailureKind::UnknownPeer,
        }
    }

    /// Whether the caller may reasonably retry the same operation.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::BindFailure { .. })
    }

    pub(crate) fn timeout(operation: &'static str, after: Duration) -> Self {
        Self::Timeout { operation, after }
    }
}

impl From<serde_json::Error> for PeerError {
    fn from(err: serde_json::Error) -> Self {
        Self::ProtocolViolation(format!("malformed message: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, PeerError>;
