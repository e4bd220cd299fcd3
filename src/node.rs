use log::{info, warn};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::NodeConfig;
use crate::error::{PeerError, Result};
use crate::networking::file_transfer::{FileTransferConfig, ProgressCallback};
use crate::networking::interface::{default_broadcast_targets, get_local_ip};
use crate::networking::{
    ConnectionListener, DiscoveryConfig, DiscoveryService, FileTransferEngine, ListenerContext, PeerConnector,
    PeerIdentity, PeerRecord, PeerRegistry, StatusNotifier, Transfer,
};

struct RunningNode {
    shutdown: watch::Sender<bool>,
    local_addr: SocketAddr,
    listener_task: JoinHandle<()>,
    discovery_task: JoinHandle<()>,
}

pub struct PeerNode {
    config: NodeConfig,
    identity: PeerIdentity,
    registry: PeerRegistry,
    notifier: StatusNotifier,
    engine: FileTransferEngine,
    running: Option<RunningNode>,
}

impl PeerNode {
    pub fn new(config: NodeConfig, notifier: StatusNotifier) -> Self {
        let engine = FileTransferEngine::new(transfer_config(&config, None), notifier.clone());
        Self {
            config,
            identity: PeerIdentity::generate(),
            registry: PeerRegistry::new(),
            notifier,
            engine,
            running: None,
        }
    }

    /// Report per-chunk progress of every transfer to `callback`
    pub fn with_progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.engine = FileTransferEngine::new(
            transfer_config(&self.config, Some(callback)),
            self.notifier.clone(),
        );
        self
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Bound data address while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    fn advertised_port(&self) -> u16 {
        self.local_addr()
            .map(|addr| addr.port())
            .unwrap_or(self.config.data_port)
    }

    fn connector(&self) -> PeerConnector {
        PeerConnector::new(
            self.identity.clone(),
            self.config.display_name.clone(),
            self.advertised_port(),
            self.registry.clone(),
        )
        .with_timeouts(self.config.connect_timeout, self.config.ack_timeout)
    }

    /// Bind the data port and start the accept and discovery loops.
    ///
    /// A bind failure is reported and returned; nothing is left running.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if let Some(running) = &self.running {
            warn!("Node already running on {}", running.local_addr);
            return Ok(running.local_addr);
        }

        let addr = SocketAddr::new(self.config.bind_host, self.config.data_port);
        let context = ListenerContext {
            identity: self.identity.clone(),
            registry: self.registry.clone(),
            notifier: self.notifier.clone(),
            engine: self.engine.clone(),
            download_dir: self.config.download_dir.clone(),
            read_timeout: self.config.read_timeout,
        };

        let (listener, local_addr) = match self.bind_listener(addr, context).await {
            Ok(bound) => bound,
            Err(e) => {
                self.notifier.error(format!("Error starting server: {}", e));
                return Err(e);
            }
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        let listener_task = tokio::spawn(listener.run(shutdown_rx.clone()));

        let targets = if self.config.broadcast_targets.is_empty() {
            default_broadcast_targets(self.config.discovery_port)
        } else {
            self.config.broadcast_targets.clone()
        };
        let discovery = DiscoveryService::new(
            DiscoveryConfig {
                bind_host: self.config.bind_host,
                discovery_port: self.config.discovery_port,
                data_port: local_addr.port(),
                display_name: self.config.display_name.clone(),
                interval: self.config.discovery_interval,
                response_timeout: self.config.discovery_response_timeout,
                peer_ttl: self.config.peer_ttl,
                targets,
                advertised_ip: get_local_ip(),
            },
            self.identity.clone(),
            self.registry.clone(),
            self.notifier.clone(),
        );
        let discovery_task = tokio::spawn(discovery.run(shutdown_rx));

        self.running = Some(RunningNode {
            shutdown,
            local_addr,
            listener_task,
            discovery_task,
        });
        self.notifier.info(format!(
            "Server started on {} as {} ({})",
            local_addr, self.config.display_name, self.identity
        ));
        Ok(local_addr)
    }

    async fn bind_listener(
        &self,
        addr: SocketAddr,
        context: ListenerContext,
    ) -> Result<(ConnectionListener, SocketAddr)> {
        let listener = ConnectionListener::bind(addr, context, self.config.max_connections).await?;
        let local_addr = listener.local_addr()?;
        Ok((listener, local_addr))
    }

    /// Close the listening socket and end discovery. In-flight connections are left to finish.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        let _ = running.shutdown.send(true);
        if let Err(e) = running.listener_task.await {
            warn!("Listener task ended abnormally: {}", e);
        }
        if let Err(e) = running.discovery_task.await {
            warn!("Discovery task ended abnormally: {}", e);
        }
        self.notifier.info("Server stopped");
    }

    /// Handshake with `ip:port` and register the peer under `display_name`
    pub async fn connect_to_peer(&self, ip: IpAddr, port: u16, display_name: &str) -> Result<PeerRecord> {
        match self.connector().connect(ip, port, display_name).await {
            Ok(record) => {
                self.notifier.info(format!(
                    "Connected to peer: {} ({}:{})",
                    display_name, ip, port
                ));
                Ok(record)
            }
            Err(e) => {
                let message = match &e {
                    PeerError::Timeout { .. } => {
                        format!("Connection timeout: Peer {}:{} not responding", ip, port)
                    }
                    PeerError::Unreachable { .. } => {
                        format!("Connection refused: Peer {}:{} is offline", ip, port)
                    }
                    other => format!("Failed to connect to peer {}:{}: {}", ip, port, other),
                };
                self.notifier.error(message);
                Err(e)
            }
        }
    }

    /// Point-in-time list of known peers
    pub fn get_peers(&self) -> Vec<PeerRecord> {
        self.registry.list()
    }

    pub async fn send_file<P: AsRef<Path>>(&self, path: P, ip: IpAddr, port: u16) -> Result<Transfer> {
        let path = path.as_ref();
        info!("Sending {} to {}:{}", path.display(), ip, port);
        self.engine.send(path, ip, port).await.map_err(|e| {
            self.notifier.error(format!("Error sending file: {}", e));
            e
        })
    }

    /// Send to a peer known by id, using its registered address
    pub async fn send_file_to_peer<P: AsRef<Path>>(&self, peer_id: &str, path: P) -> Result<Transfer> {
        match self.registry.get(peer_id) {
            Some(record) => self.send_file(path, record.ip, record.port).await,
            None => {
                let err = PeerError::UnknownPeer(peer_id.to_string());
                self.notifier.error(format!("Error sending file: {}", err));
                Err(err)
            }
        }
    }
}

impl Drop for PeerNode {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            let _ = running.shutdown.send(true);
        }
    }
}

fn transfer_config(config: &NodeConfig, progress_callback: Option<ProgressCallback>) -> FileTransferConfig {
    FileTransferConfig {
        chunk_size: config.chunk_size,
        connect_timeout: config.connect_timeout,
        response_timeout: config.ack_timeout,
        idle_timeout: config.idle_timeout,
        max_file_size: config.max_file_size,
        progress_callback,
    }
}
