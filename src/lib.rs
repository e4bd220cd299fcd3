//! Serverless file sharing between peers on one LAN.
//!
//! Peers find each other with UDP broadcast, introduce themselves over a
//! TCP handshake and push files as a raw byte stream after a JSON header.

pub mod config;
pub mod error;
pub mod networking;
pub mod node;

pub use config::NodeConfig;
pub use error::{FailureKind, PeerError, Result};
pub use node::PeerNode;
