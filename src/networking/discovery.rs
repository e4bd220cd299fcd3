use log::{debug, info, warn};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};

use super::protocol::{Message, PeerIdentity, MAX_MESSAGE_SIZE};
use super::registry::{PeerRecord, PeerRegistry};
use super::status::StatusNotifier;
use super::wait_for_shutdown;
use crate::error::{PeerError, Result};

pub const DEFAULT_DISCOVERY_PORT: u16 = 5001;
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_PEER_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Address the UDP socket binds to
    pub bind_host: IpAddr,
    /// Well-known UDP port, distinct from the data port
    pub discovery_port: u16,
    /// TCP data port advertised to other peers
    pub data_port: u16,
    pub display_name: String,
    pub interval: Duration,
    /// How long each cycle waits for its first response
    pub response_timeout: Duration,
    /// Records older than this are pruned every cycle
    pub peer_ttl: Duration,
    /// Broadcast or unicast destinations for announcements
    pub targets: Vec<SocketAddr>,
    /// Informational address put in the `ip` field of announcements
    pub advertised_ip: IpAddr,
}

enum Next {
    Datagram(usize, SocketAddr),
    Deadline,
    Shutdown,
}

/// Periodic UDP broadcast announcer and responder.
pub struct DiscoveryService {
    config: DiscoveryConfig,
    identity: PeerIdentity,
    registry: PeerRegistry,
    notifier: StatusNotifier,
}

impl DiscoveryService {
    pub fn new(
        config: DiscoveryConfig,
        identity: PeerIdentity,
        registry: PeerRegistry,
        notifier: StatusNotifier,
    ) -> Self {
        Self {
            config,
            identity,
            registry,
            notifier,
        }
    }

    /// Run until `shutdown` flips to true.
    ///
    /// Socket failures never end the loop; they are reported and the socket
    /// is rebound on the next interval.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Discovery running on UDP {} every {:?} (targets: {:?})",
            self.config.discovery_port, self.config.interval, self.config.targets
        );

        let mut socket: Option<UdpSocket> = None;

        while !*shutdown.borrow() {
            let cycle_start = Instant::now();
            let cycle_end = cycle_start + self.config.interval;

            if socket.is_none() {
                match self.bind().await {
                    Ok(bound) => socket = Some(bound),
                    Err(e) => self.notifier.error(format!("Discovery error: {}", e)),
                }
            }

            if let Some(bound) = &socket {
                match self.run_cycle(bound, cycle_start, cycle_end, &mut shutdown).await {
                    Ok(true) => break,
                    Ok(false) => {}
                    Err(e) => {
                        self.notifier.error(format!("Discovery error: {}", e));
                        socket = None;
                    }
                }
            }

            for expired in self.registry.prune_stale(self.config.peer_ttl) {
                self.notifier.info(format!(
                    "Peer expired: {} ({})",
                    expired.display_name, expired.peer_id
                ));
            }

            if socket.is_none() {
                tokio::select! {
                    _ = sleep_until(cycle_end) => {}
                    _ = wait_for_shutdown(&mut shutdown) => break,
                }
            }
        }

        info!("Discovery stopped");
    }

    async fn bind(&self) -> Result<UdpSocket> {
        let addr = SocketAddr::new(self.config.bind_host, self.config.discovery_port);
        let socket = UdpSocket::bind(addr).await?;
        socket.set_broadcast(true)?;
        debug!("Discovery socket bound to {}", socket.local_addr()?);
        Ok(socket)
    }

    /// One announce/wait/serve cycle. Returns true when shutdown was requested.
    async fn run_cycle(
        &self,
        socket: &UdpSocket,
        cycle_start: Instant,
        cycle_end: Instant,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<bool> {
        self.announce(socket).await?;

        let window_end = cycle_start + self.config.response_timeout.min(self.config.interval);
        let mut buf = vec![0u8; MAX_MESSAGE_SIZE];

        // Wait for at most one response within the window
        let mut answered = false;
        while !answered {
            match next_datagram(socket, &mut buf, window_end, shutdown).await? {
                Next::Datagram(n, from) => {
                    answered = self.handle_datagram(socket, &buf[..n], from).await.is_some();
                }
                Next::Deadline => {
                    debug!("No discovery response this cycle");
                    break;
                }
                Next::Shutdown => return Ok(true),
            }
        }

        // Keep answering announcements until the next cycle; late responses are new input
        loop {
            match next_datagram(socket, &mut buf, cycle_end, shutdown).await? {
                Next::Datagram(n, from) => {
                    self.handle_datagram(socket, &buf[..n], from).await;
                }
                Next::Deadline => return Ok(false),
                Next::Shutdown => return Ok(true),
            }
        }
    }

    async fn announce(&self, socket: &UdpSocket) -> Result<()> {
        let message = Message::Discovery {
            peer_id: self.identity.to_string(),
            ip: self.config.advertised_ip.to_string(),
            port: self.config.data_port,
        };
        let bytes = message.encode()?;

        let mut last_err = None;
        let mut sent = 0;
        for target in &self.config.targets {
            match socket.send_to(&bytes, target).await {
                Ok(_) => sent += 1,
                Err(e) => {
                    debug!("Discovery broadcast to {} failed: {}", target, e);
                    last_err = Some(e);
                }
            }
        }

        match last_err {
            Some(e) if sent == 0 => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// Process one datagram. Returns the record when it was an accepted response.
    async fn handle_datagram(
        &self,
        socket: &UdpSocket,
        bytes: &[u8],
        from: SocketAddr,
    ) -> Option<PeerRecord> {
        let message = match Message::decode(bytes) {
            Ok(message) => message,
            Err(e) => {
                self.notifier
                    .warning(format!("Ignoring discovery datagram from {}: {}", from, e));
                return None;
            }
        };

        match message {
            Message::Discovery { peer_id, .. } => {
                if self.identity.is_self(&peer_id) {
                    return None;
                }
                let reply = Message::DiscoveryResponse {
                    peer_id: self.identity.to_string(),
                    port: self.config.data_port,
                    name: self.config.display_name.clone(),
                };
                match reply.encode() {
                    Ok(bytes) => {
                        if let Err(e) = socket.send_to(&bytes, from).await {
                            self.notifier
                                .warning(format!("Failed to answer discovery from {}: {}", from, e));
                        }
                    }
                    Err(e) => warn!("Failed to encode discovery response: {}", e),
                }
                None
            }
            Message::DiscoveryResponse { peer_id, port, name } => {
                if self.identity.is_self(&peer_id) {
                    return None;
                }
                if port == 0 {
                    self.notifier.warning(format!(
                        "Ignoring discovery response from {}: advertised port 0",
                        from
                    ));
                    return None;
                }
                let record = PeerRecord::new(peer_id, from.ip(), port, name);
                if self.registry.upsert(record.clone()) {
                    self.notifier.info(format!(
                        "Discovered peer: {} ({}:{})",
                        record.display_name, record.ip, record.port
                    ));
                }
                Some(record)
            }
            other => {
                self.notifier.warning(format!(
                    "Ignoring discovery datagram from {}: unexpected {}",
                    from,
                    other.type_name()
                ));
                None
            }
        }
    }
}

async fn next_datagram(
    socket: &UdpSocket,
    buf: &mut [u8],
    deadline: Instant,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Next> {
    loop {
        tokio::select! {
            received = socket.recv_from(buf) => match received {
                Ok((n, from)) => return Ok(Next::Datagram(n, from)),
                // ICMP port-unreachable from an earlier send surfaces here on some platforms
                Err(e) if matches!(e.kind(), io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset) => {
                    debug!("Discovery socket reported {}", e);
                }
                Err(e) => return Err(PeerError::Io(e)),
            },
            _ = sleep_until(deadline) => return Ok(Next::Deadline),
            _ = wait_for_shutdown(shutdown) => return Ok(Next::Shutdown),
        }
    }
}
