use chrono::{DateTime, Utc};
use log::debug;
use serde::Serialize;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// A known peer, keyed by its self-reported id
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerRecord {
    pub peer_id: String,
    pub ip: IpAddr,
    pub port: u16,
    pub display_name: String,
    pub last_seen: DateTime<Utc>,
}

impl PeerRecord {
    pub fn new(peer_id: impl Into<String>, ip: IpAddr, port: u16, display_name: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            ip,
            port,
            display_name: display_name.into(),
            last_seen: Utc::now(),
        }
    }

    pub fn address(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Whether the record has not been refreshed within `ttl`
    pub fn is_stale(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        match (now - self.last_seen).to_std() {
            Ok(age) => age > ttl,
            // last_seen in the future
            Err(_) => false,
        }
    }
}

/// Concurrent store of known peers.
///
/// Cloning yields another handle to the same map.
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    peers: Arc<Mutex<HashMap<String, PeerRecord>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PeerRecord>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace the record for `record.peer_id`. Last write wins.
    ///
    /// Returns true when the peer was not known before.
    pub fn upsert(&self, record: PeerRecord) -> bool {
        let mut peers = self.lock();
        debug!("Registry upsert: {} at {}", record.peer_id, record.address());
        peers.insert(record.peer_id.clone(), record).is_none()
    }

    pub fn get(&self, peer_id: &str) -> Option<PeerRecord> {
        self.lock().get(peer_id).cloned()
    }

    /// Point-in-time copy of all records, ordered by peer id
    pub fn list(&self) -> Vec<PeerRecord> {
        let mut records: Vec<PeerRecord> = self.lock().values().cloned().collect();
        records.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        records
    }

    /// Remove records not refreshed within `ttl` and return them
    pub fn prune_stale(&self, ttl: Duration) -> Vec<PeerRecord> {
        let now = Utc::now();
        let mut removed = Vec::new();
        self.lock().retain(|_, record| {
            if record.is_stale(now, ttl) {
                removed.push(record.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn record(id: &str, port: u16) -> PeerRecord {
        PeerRecord::new(id, IpAddr::V4(Ipv4Addr::LOCALHOST), port, format!("peer-{}", id))
    }

    #[test]
    fn test_upsert_is_last_write_wins() {
        let registry = PeerRegistry::new();
        assert!(registry.upsert(record("aaaa0001", 5000)));
        assert!(!registry.upsert(record("aaaa0001", 6000)));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("aaaa0001").unwrap().port, 6000);
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_list_is_ordered_snapshot() {
        let registry = PeerRegistry::new();
        registry.upsert(record("cccc", 1));
        registry.upsert(record("aaaa", 2));
        registry.upsert(record("bbbb", 3));

        let snapshot = registry.list();
        registry.upsert(record("aaaa", 99));

        let ids: Vec<_> = snapshot.iter().map(|r| r.peer_id.as_str()).collect();
        assert_eq!(ids, vec!["aaaa", "bbbb", "cccc"]);
        assert_eq!(snapshot[0].port, 2);
    }

    #[test]
    fn test_prune_stale() {
        let registry = PeerRegistry::new();
        let mut old = record("old", 1);
        old.last_seen = Utc::now() - chrono::Duration::seconds(120);
        registry.upsert(old);
        registry.upsert(record("fresh", 2));

        let removed = registry.prune_stale(Duration::from_secs(30));
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].peer_id, "old");
        assert_eq!(registry.len(), 1);
        assert!(registry.get("fresh").is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_upserts() {
        let registry = PeerRegistry::new();
        let mut handles = Vec::new();
        for i in 0..64u16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.upsert(record(&format!("peer{:04}", i), 5000 + i));
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(registry.len(), 64);
        for i in 0..64u16 {
            assert_eq!(registry.get(&format!("peer{:04}", i)).unwrap().port, 5000 + i);
        }
    }
}
