pub mod connector;
pub mod discovery;
pub mod file_transfer;
pub mod interface;
pub mod listener;
pub mod protocol;
pub mod registry;
pub mod status;

use tokio::sync::watch;

// Re-export key components for easier access
pub use connector::PeerConnector;
pub use discovery::{DiscoveryConfig, DiscoveryService};
pub use file_transfer::{
    FileTransferConfig, FileTransferEngine, ProgressCallback, Transfer, TransferRequest, TransferState,
    TransferStatus,
};
pub use listener::{ConnectionListener, ListenerContext};
pub use protocol::{Message, PeerIdentity, PROTOCOL_VERSION};
pub use registry::{PeerRecord, PeerRegistry};
pub use status::{StatusEvent, StatusLevel, StatusNotifier};

/// Resolve once the shutdown flag is set or its sender is gone
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
