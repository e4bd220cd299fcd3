use log::{debug, info};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};

use super::file_transfer::{FileTransferEngine, TransferRequest};
use super::protocol::{read_message, write_message, Message, PeerIdentity, PROTOCOL_VERSION};
use super::registry::{PeerRecord, PeerRegistry};
use super::status::StatusNotifier;
use super::wait_for_shutdown;
use crate::error::{PeerError, Result};

pub const DEFAULT_DATA_PORT: u16 = 5000;
pub const DEFAULT_MAX_CONNECTIONS: usize = 10;
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Everything a connection handler needs, shared by all handlers
pub struct ListenerContext {
    pub identity: PeerIdentity,
    pub registry: PeerRegistry,
    pub notifier: StatusNotifier,
    pub engine: FileTransferEngine,
    /// Where accepted files are written
    pub download_dir: PathBuf,
    /// Wait for the first message of a connection
    pub read_timeout: Duration,
}

/// Accepts inbound TCP connections on the data port
pub struct ConnectionListener {
    listener: TcpListener,
    context: Arc<ListenerContext>,
    slots: Arc<Semaphore>,
}

impl ConnectionListener {
    /// Bind the data port. Failure here is the only fatal error of a node.
    pub async fn bind(addr: SocketAddr, context: ListenerContext, max_connections: usize) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| PeerError::BindFailure { addr, source })?;

        Ok(Self {
            listener,
            context: Arc::new(context),
            slots: Arc::new(Semaphore::new(max_connections.max(1))),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept until `shutdown` flips, then close the listening socket.
    ///
    /// In-flight handlers are not joined; they end with their sockets.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let addr = self.listener.local_addr().ok();
        info!("Accepting connections on {:?}", addr);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => self.dispatch(stream, peer_addr),
                    Err(e) => {
                        self.context.notifier.error(format!("Connection error: {}", e));
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
                _ = wait_for_shutdown(&mut shutdown) => break,
            }
        }

        info!("Stopped accepting connections on {:?}", addr);
    }

    fn dispatch(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let permit = match self.slots.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.context.notifier.warning(format!(
                    "Connection limit reached, dropping connection from {}",
                    peer_addr
                ));
                return;
            }
        };

        debug!("New connection from {}", peer_addr);
        let context = self.context.clone();
        tokio::spawn(async move {
            let _permit = permit;
            handle_connection(stream, peer_addr, &context).await;
        });
    }
}

async fn handle_connection(mut stream: TcpStream, peer_addr: SocketAddr, context: &ListenerContext) {
    if let Err(e) = serve_connection(&mut stream, peer_addr, context).await {
        context
            .notifier
            .error(format!("Error handling connection from {}: {}", peer_addr, e));
    }
}

/// Route a connection by its first message
async fn serve_connection(stream: &mut TcpStream, peer_addr: SocketAddr, context: &ListenerContext) -> Result<()> {
    match read_message(stream, context.read_timeout).await? {
        Message::Handshake {
            protocol_version,
            peer_id,
            name,
            port,
        } => {
            if protocol_version != PROTOCOL_VERSION {
                return Err(PeerError::ProtocolViolation(format!(
                    "unsupported protocol version {}, expected {}",
                    protocol_version, PROTOCOL_VERSION
                )));
            }
            if peer_id.is_empty() || port == 0 {
                return Err(PeerError::ProtocolViolation(
                    "handshake needs a peer_id and a non-zero port".to_string(),
                ));
            }
            if context.identity.is_self(&peer_id) {
                return Err(PeerError::ProtocolViolation(
                    "handshake carries this node's own peer id".to_string(),
                ));
            }

            // Address from the transport, port from the payload
            let record = PeerRecord::new(peer_id, peer_addr.ip(), port, name);
            context.registry.upsert(record.clone());

            let ack = Message::HandshakeAck {
                protocol_version: PROTOCOL_VERSION,
                peer_id: context.identity.to_string(),
            };
            write_message(stream, &ack).await?;

            context.notifier.info(format!(
                "Peer connected: {} ({})",
                record.display_name, record.ip
            ));
            Ok(())
        }
        Message::FileTransfer { file_name, file_size } => {
            let request = TransferRequest { file_name, file_size };
            context
                .engine
                .receive_request(stream, request, &context.download_dir)
                .await?;
            Ok(())
        }
        other => Err(PeerError::ProtocolViolation(format!(
            "unexpected {} on the data port",
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::networking::connector::PeerConnector;
    use crate::networking::file_transfer::FileTransferConfig;
    use std::net::{IpAddr, Ipv4Addr};
    use tempfile::tempdir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    struct Running {
        identity: PeerIdentity,
        registry: PeerRegistry,
        addr: SocketAddr,
        shutdown: watch::Sender<bool>,
        task: tokio::task::JoinHandle<()>,
    }

    async fn start_listener(download_dir: PathBuf, max_connections: usize) -> Running {
        let identity = PeerIdentity::generate();
        let registry = PeerRegistry::new();
        let notifier = StatusNotifier::log_only();
        let context = ListenerContext {
            identity: identity.clone(),
            registry: registry.clone(),
            notifier: notifier.clone(),
            engine: FileTransferEngine::new(FileTransferConfig::default(), notifier),
            download_dir,
            read_timeout: Duration::from_secs(2),
        };
        let listener = ConnectionListener::bind(SocketAddr::new(LOCALHOST, 0), context, max_connections)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(listener.run(rx));
        Running {
            identity,
            registry,
            addr,
            shutdown,
            task,
        }
    }

    fn connector(port: u16) -> (PeerConnector, PeerIdentity, PeerRegistry) {
        let identity = PeerIdentity::generate();
        let registry = PeerRegistry::new();
        let connector = PeerConnector::new(identity.clone(), "initiator".to_string(), port, registry.clone())
            .with_timeouts(Duration::from_secs(1), Duration::from_secs(1));
        (connector, identity, registry)
    }

    #[tokio::test]
    async fn test_handshake_registers_both_sides() {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempdir().unwrap();
        let server = start_listener(dir.path().to_path_buf(), 10).await;
        let (client, client_id, client_registry) = connector(6123);

        let record = client.connect(LOCALHOST, server.addr.port(), "listener").await.unwrap();
        assert_eq!(record.peer_id, server.identity.as_str());

        let seen_by_client = client_registry.get(server.identity.as_str()).unwrap();
        assert_eq!(seen_by_client.port, server.addr.port());

        let seen_by_server = server.registry.get(client_id.as_str()).unwrap();
        assert_eq!(seen_by_server.port, 6123);
        assert_eq!(seen_by_server.ip, LOCALHOST);
        assert_eq!(seen_by_server.display_name, "initiator");

        server.shutdown.send(true).unwrap();
        server.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_connection_is_isolated() {
        let dir = tempdir().unwrap();
        let server = start_listener(dir.path().to_path_buf(), 10).await;

        let mut junk = TcpStream::connect(server.addr).await.unwrap();
        junk.write_all(b"{\"type\": \"handshake\", \"peer_id\": ").await.unwrap();

        // A peer that never says anything
        let _idle = TcpStream::connect(server.addr).await.unwrap();

        let (client, client_id, _) = connector(6124);
        client.connect(LOCALHOST, server.addr.port(), "good").await.unwrap();

        let mut buf = [0u8; 64];
        let n = tokio::time::timeout(Duration::from_secs(2), junk.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0, "listener answered a malformed handshake");

        assert_eq!(server.registry.len(), 1);
        assert!(server.registry.get(client_id.as_str()).is_some());

        server.shutdown.send(true).unwrap();
        server.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_legacy_peer_info_is_refused() {
        let dir = tempdir().unwrap();
        let server = start_listener(dir.path().to_path_buf(), 10).await;

        let mut legacy = TcpStream::connect(server.addr).await.unwrap();
        legacy
            .write_all(br#"{"peer_id": "legacy01", "name": "old", "port": 5000}"#)
            .await
            .unwrap();
        let mut reply = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), legacy.read_to_end(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert!(reply.is_empty());
        assert!(server.registry.is_empty());

        server.shutdown.send(true).unwrap();
        server.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_file_transfer_dispatch() {
        let download = tempdir().unwrap();
        let source_dir = tempdir().unwrap();
        let source = source_dir.path().join("notes.txt");
        std::fs::write(&source, b"shared over the data port").unwrap();

        let server = start_listener(download.path().to_path_buf(), 10).await;
        let sender = FileTransferEngine::new(FileTransferConfig::default(), StatusNotifier::log_only());
        sender.send(&source, LOCALHOST, server.addr.port()).await.unwrap();

        // The receiving handler finishes after the sender closes
        let target = download.path().join("notes.txt");
        for _ in 0..100 {
            if std::fs::read(&target).map(|b| b.len() == 25).unwrap_or(false) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(std::fs::read(&target).unwrap(), b"shared over the data port");
        assert!(server.registry.is_empty());

        server.shutdown.send(true).unwrap();
        server.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_conflict_is_bind_failure() {
        let dir = tempdir().unwrap();
        let server = start_listener(dir.path().to_path_buf(), 10).await;

        let context = ListenerContext {
            identity: PeerIdentity::generate(),
            registry: PeerRegistry::new(),
            notifier: StatusNotifier::log_only(),
            engine: FileTransferEngine::new(FileTransferConfig::default(), StatusNotifier::log_only()),
            download_dir: dir.path().to_path_buf(),
            read_timeout: Duration::from_secs(1),
        };
        let err = ConnectionListener::bind(server.addr, context, 10).await.err().unwrap();
        assert_eq!(err.kind(), FailureKind::BindFailure);

        server.shutdown.send(true).unwrap();
        server.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_closes_listening_socket() {
        let dir = tempdir().unwrap();
        let server = start_listener(dir.path().to_path_buf(), 10).await;
        server.shutdown.send(true).unwrap();
        server.task.await.unwrap();

        let (client, _, registry) = connector(6125);
        let err = client.connect(LOCALHOST, server.addr.port(), "gone").await.unwrap_err();
        assert!(matches!(err.kind(), FailureKind::Unreachable | FailureKind::Timeout));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_connection_limit_drops_excess() {
        let dir = tempdir().unwrap();
        let server = start_listener(dir.path().to_path_buf(), 1).await;

        // Holds the only slot until the read timeout
        let _idle = TcpStream::connect(server.addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let (client, _, registry) = connector(6126);
        let err = client.connect(LOCALHOST, server.addr.port(), "excess").await.unwrap_err();
        // Closed before the ack: clean EOF or a reset, depending on timing
        assert!(matches!(
            err.kind(),
            FailureKind::ProtocolViolation | FailureKind::IoFailure
        ));
        assert!(registry.is_empty());

        server.shutdown.send(true).unwrap();
        server.task.await.unwrap();
    }
}
