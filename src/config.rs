use log::warn;
use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::networking::connector::{DEFAULT_ACK_TIMEOUT, DEFAULT_CONNECT_TIMEOUT};
use crate::networking::discovery::{
    DEFAULT_DISCOVERY_PORT, DEFAULT_INTERVAL, DEFAULT_PEER_TTL, DEFAULT_RESPONSE_TIMEOUT,
};
use crate::networking::file_transfer::{DEFAULT_CHUNK_SIZE, DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_FILE_SIZE};
use crate::networking::listener::{DEFAULT_DATA_PORT, DEFAULT_MAX_CONNECTIONS, DEFAULT_READ_TIMEOUT};

const DEFAULT_STATUS_CAPACITY: usize = 256;
const MAX_TIMEOUT_SECS: f64 = 86_400.0;
const MIN_DISCOVERY_INTERVAL: Duration = Duration::from_millis(500);
const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Settings for one peer node
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Address both sockets bind to
    pub bind_host: IpAddr,
    /// TCP port for handshakes and transfers
    pub data_port: u16,
    /// UDP port for discovery
    pub discovery_port: u16,
    /// Name announced to other peers
    pub display_name: String,
    /// Where received files land
    pub download_dir: PathBuf,

    pub discovery_interval: Duration,
    pub discovery_response_timeout: Duration,
    /// Peers unseen for this long are dropped
    pub peer_ttl: Duration,
    /// Explicit discovery destinations; empty means broadcast on every interface
    pub broadcast_targets: Vec<SocketAddr>,

    pub connect_timeout: Duration,
    /// Wait for `handshake_ack` and for the transfer reply
    pub ack_timeout: Duration,
    /// Listener-side wait for the first message of a connection
    pub read_timeout: Duration,
    /// Longest pause tolerated between two chunks
    pub idle_timeout: Duration,

    pub chunk_size: usize,
    pub max_file_size: u64,
    pub max_connections: usize,
    /// Bounded queue of status events for the UI
    pub status_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            data_port: DEFAULT_DATA_PORT,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            display_name: default_display_name(),
            download_dir: default_download_dir(),
            discovery_interval: DEFAULT_INTERVAL,
            discovery_response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            peer_ttl: DEFAULT_PEER_TTL,
            broadcast_targets: Vec::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            status_capacity: DEFAULT_STATUS_CAPACITY,
        }
    }
}

impl NodeConfig {
    /// Defaults overridden by any P2P_* variables present in the environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let secs = |key: &str, default: Duration| {
            let value = parse_or(&lookup, key, default.as_secs_f64());
            if value.is_finite() && (0.0..=MAX_TIMEOUT_SECS).contains(&value) {
                Duration::from_secs_f64(value)
            } else {
                warn!("Ignoring out-of-range value {} for {}", value, key);
                default
            }
        };

        let discovery_port = parse_or(&lookup, "P2P_DISCOVERY_PORT", defaults.discovery_port);

        Self {
            bind_host: parse_or(&lookup, "P2P_BIND_HOST", defaults.bind_host),
            data_port: parse_or(&lookup, "P2P_DATA_PORT", defaults.data_port),
            discovery_port,
            display_name: lookup("P2P_PEER_NAME")
                .filter(|name| !name.trim().is_empty())
                .unwrap_or(defaults.display_name),
            download_dir: lookup("P2P_DOWNLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.download_dir),
            discovery_interval: at_least(
                "P2P_DISCOVERY_INTERVAL_SECS",
                secs("P2P_DISCOVERY_INTERVAL_SECS", defaults.discovery_interval),
                MIN_DISCOVERY_INTERVAL,
            ),
            discovery_response_timeout: secs("P2P_DISCOVERY_TIMEOUT_SECS", defaults.discovery_response_timeout),
            peer_ttl: secs("P2P_PEER_TTL_SECS", defaults.peer_ttl),
            broadcast_targets: lookup("P2P_BROADCAST_TARGETS")
                .map(|raw| parse_targets(&raw, discovery_port))
                .unwrap_or_default(),
            connect_timeout: secs("P2P_CONNECT_TIMEOUT_SECS", defaults.connect_timeout),
            ack_timeout: secs("P2P_ACK_TIMEOUT_SECS", defaults.ack_timeout),
            read_timeout: secs("P2P_READ_TIMEOUT_SECS", defaults.read_timeout),
            idle_timeout: secs("P2P_IDLE_TIMEOUT_SECS", defaults.idle_timeout),
            chunk_size: clamp_chunk_size(parse_or(&lookup, "P2P_CHUNK_SIZE", defaults.chunk_size)),
            max_file_size: parse_or(&lookup, "P2P_MAX_FILE_SIZE", defaults.max_file_size),
            max_connections: parse_or(&lookup, "P2P_MAX_CONNECTIONS", defaults.max_connections).max(1),
            status_capacity: defaults.status_capacity,
        }
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!("Ignoring invalid value {:?} for {}", raw, key);
                default
            }
        },
        None => default,
    }
}

fn at_least(key: &str, value: Duration, floor: Duration) -> Duration {
    if value < floor {
        warn!("Raising {} from {:?} to {:?}", key, value, floor);
        floor
    } else {
        value
    }
}

fn clamp_chunk_size(value: usize) -> usize {
    let clamped = value.clamp(1, MAX_CHUNK_SIZE);
    if clamped != value {
        warn!("Clamping P2P_CHUNK_SIZE from {} to {}", value, clamped);
    }
    clamped
}

/// Parse `host[:port],...`; a missing port means the discovery port
pub fn parse_targets(raw: &str, default_port: u16) -> Vec<SocketAddr> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .filter_map(|part| {
            if let Ok(addr) = part.parse::<SocketAddr>() {
                Some(addr)
            } else if let Ok(ip) = part.parse::<IpAddr>() {
                Some(SocketAddr::new(ip, default_port))
            } else {
                warn!("Ignoring invalid broadcast target {:?}", part);
                None
            }
        })
        .collect()
}

fn default_display_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "Unknown".to_string())
}

fn default_download_dir() -> PathBuf {
    dirs::download_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("lan-peer-share")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.data_port, 5000);
        assert_eq!(config.discovery_port, 5001);
        assert_eq!(config.chunk_size, 4096);
        assert_eq!(config.discovery_interval, Duration::from_secs(3));
        assert_eq!(config.discovery_response_timeout, Duration::from_secs(2));
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.ack_timeout, Duration::from_secs(3));
        assert_eq!(config.max_connections, 10);
        assert!(config.broadcast_targets.is_empty());
    }

    #[test]
    fn test_overrides_and_bad_values() {
        let config = NodeConfig::from_lookup(lookup_from(&[
            ("P2P_DATA_PORT", "6000"),
            ("P2P_DISCOVERY_PORT", "not-a-port"),
            ("P2P_PEER_NAME", "workstation"),
            ("P2P_DISCOVERY_INTERVAL_SECS", "0.5"),
            ("P2P_CHUNK_SIZE", "0"),
            ("P2P_BROADCAST_TARGETS", "192.168.1.255, 10.0.0.7:7001"),
        ]));

        assert_eq!(config.data_port, 6000);
        assert_eq!(config.discovery_port, 5001);
        assert_eq!(config.display_name, "workstation");
        assert_eq!(config.discovery_interval, Duration::from_millis(500));
        assert_eq!(config.chunk_size, 1);
        assert_eq!(
            config.broadcast_targets,
            vec![
                "192.168.1.255:5001".parse::<SocketAddr>().unwrap(),
                "10.0.0.7:7001".parse::<SocketAddr>().unwrap(),
            ]
        );
    }

    #[test]
    fn test_interval_and_chunk_size_are_bounded() {
        let config = NodeConfig::from_lookup(lookup_from(&[
            ("P2P_DISCOVERY_INTERVAL_SECS", "0"),
            ("P2P_CHUNK_SIZE", "18446744073709551615"),
        ]));
        assert_eq!(config.discovery_interval, MIN_DISCOVERY_INTERVAL);
        assert_eq!(config.chunk_size, MAX_CHUNK_SIZE);

        let config = NodeConfig::from_lookup(lookup_from(&[("P2P_CHUNK_SIZE", "65536")]));
        assert_eq!(config.chunk_size, 65536);
    }

    #[test]
    fn test_parse_targets_skips_garbage() {
        let targets = parse_targets("nonsense,,127.0.0.1", 9000);
        assert_eq!(targets, vec!["127.0.0.1:9000".parse::<SocketAddr>().unwrap()]);
    }
}
