//! Peer directory — resolves peer ids to the socket addresses they serve on.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::socket_addr_serde;
use crate::discovery::DiscoveredPeer;
use crate::identity::PeerId;

/// Where an address came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerSource {
    /// Given in configuration or on the command line.
    Configured,
    /// Learned from a LAN announcement.
    Discovered,
}

/// A known address for a peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    pub id: PeerId,
    #[serde(with = "socket_addr_serde")]
    pub addr: SocketAddr,
    /// Display name from the peer's announcement, if any.
    #[serde(default)]
    pub name: Option<String>,
    pub source: PeerSource,
    pub last_seen: DateTime<Utc>,
}

/// Thread-safe map of peer id to [`PeerRecord`].
#[derive(Debug, Default)]
pub struct PeerDirectory {
    records: RwLock<HashMap<PeerId, PeerRecord>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a directory from `id -> "host:port"` pairs. Invalid entries are
    /// logged and skipped.
    pub fn from_known_peers(known: &BTreeMap<String, String>) -> Self {
        let directory = Self::new();
        for (id, addr) in known {
            let peer = match PeerId::parse(id) {
                Ok(peer) => peer,
                Err(e) => {
                    warn!("Skipping known peer: {e}");
                    continue;
                }
            };
            match addr.parse::<SocketAddr>() {
                Ok(addr) => directory.insert_static(peer, addr),
                Err(e) => warn!("Skipping known peer {peer}: bad address {addr:?}: {e}"),
            }
        }
        directory
    }

    /// Add or replace a record.
    pub fn upsert(&self, record: PeerRecord) {
        self.records.write().insert(record.id.clone(), record);
    }

    /// Record a configured address for `peer`.
    pub fn insert_static(&self, peer: PeerId, addr: SocketAddr) {
        self.upsert(PeerRecord {
            id: peer,
            addr,
            name: None,
            source: PeerSource::Configured,
            last_seen: Utc::now(),
        });
    }

    /// Record a LAN announcement. A configured address is never replaced
    /// by a discovered one; only its name and `last_seen` are refreshed.
    pub fn record_discovery(&self, found: &DiscoveredPeer) {
        let Some(addr) = found.reachable_addr() else {
            debug!(
                "Ignoring announcement from {} with bad address {:?}",
                found.announcement.peer_id, found.announcement.listen_addr
            );
            return;
        };

        let mut records = self.records.write();
        let peer = &found.announcement.peer_id;
        match records.get_mut(peer) {
            Some(existing) if existing.source == PeerSource::Configured => {
                existing.name = Some(found.announcement.name.clone());
                existing.last_seen = Utc::now();
            }
            _ => {
                records.insert(
                    peer.clone(),
                    PeerRecord {
                        id: peer.clone(),
                        addr,
                        name: Some(found.announcement.name.clone()),
                        source: PeerSource::Discovered,
                        last_seen: Utc::now(),
                    },
                );
            }
        }
    }

    pub fn resolve(&self, peer: &PeerId) -> Option<SocketAddr> {
        self.records.read().get(peer).map(|r| r.addr)
    }

    pub fn get(&self, peer: &PeerId) -> Option<PeerRecord> {
        self.records.read().get(peer).cloned()
    }

    pub fn remove(&self, peer: &PeerId) -> Option<PeerRecord> {
        self.records.write().remove(peer)
    }

    /// All records, sorted by peer id.
    pub fn list(&self) -> Vec<PeerRecord> {
        let mut records: Vec<_> = self.records.read().values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Save the directory to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create directory: {e}"))?;
        }
        let json = serde_json::to_string_pretty(&self.list())
            .map_err(|e| format!("Failed to serialize peer directory: {e}"))?;
        std::fs::write(path, json).map_err(|e| format!("Failed to write peer directory: {e}"))
    }

    /// Load the directory from a JSON file, or return an empty one.
    pub fn load_or_default(path: &Path) -> Self {
        let directory = Self::new();
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<Vec<PeerRecord>>(&data) {
                    Ok(records) => {
                        for record in records {
                            directory.upsert(record);
                        }
                    }
                    Err(e) => warn!("Corrupt peer directory file: {e}"),
                },
                Err(e) => warn!("Cannot read peer directory file: {e}"),
            }
        }
        directory
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::Announcement;

    fn announcement(id: &str, listen: &str) -> DiscoveredPeer {
        DiscoveredPeer {
            announcement: Announcement {
                peer_id: PeerId::from_string(id),
                listen_addr: listen.to_string(),
                name: format!("{id}-laptop"),
                version: "0.1.0".to_string(),
            },
            source_addr: "192.168.1.20:9471".parse().unwrap(),
        }
    }

    #[test]
    fn test_from_known_peers_skips_invalid() {
        let mut known = BTreeMap::new();
        known.insert("bob".to_string(), "127.0.0.1:9000".to_string());
        known.insert("bad id".to_string(), "127.0.0.1:9001".to_string());
        known.insert("carol".to_string(), "not-an-addr".to_string());

        let directory = PeerDirectory::from_known_peers(&known);
        assert_eq!(directory.len(), 1);
        assert_eq!(
            directory.resolve(&PeerId::from_string("bob")),
            Some("127.0.0.1:9000".parse().unwrap())
        );
    }

    #[test]
    fn test_discovery_uses_source_ip_for_unspecified_listen() {
        let directory = PeerDirectory::new();
        directory.record_discovery(&announcement("bob", "0.0.0.0:9470"));

        let record = directory.get(&PeerId::from_string("bob")).unwrap();
        assert_eq!(record.addr, "192.168.1.20:9470".parse().unwrap());
        assert_eq!(record.source, PeerSource::Discovered);
        assert_eq!(record.name.as_deref(), Some("bob-laptop"));
    }

    #[test]
    fn test_discovery_does_not_override_configured() {
        let directory = PeerDirectory::new();
        let bob = PeerId::from_string("bob");
        directory.insert_static(bob.clone(), "10.0.0.5:9470".parse().unwrap());
        directory.record_discovery(&announcement("bob", "192.168.1.20:9999"));

        let record = directory.get(&bob).unwrap();
        assert_eq!(record.addr, "10.0.0.5:9470".parse().unwrap());
        assert_eq!(record.source, PeerSource::Configured);
        assert_eq!(record.name.as_deref(), Some("bob-laptop"));
    }

    #[test]
    fn test_bad_announcement_address_ignored() {
        let directory = PeerDirectory::new();
        directory.record_discovery(&announcement("bob", "nowhere"));
        assert!(directory.is_empty());
    }

    #[test]
    fn test_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.json");

        let directory = PeerDirectory::new();
        directory.insert_static(PeerId::from_string("bob"), "127.0.0.1:9000".parse().unwrap());
        directory.record_discovery(&announcement("carol", "192.168.1.21:9470"));
        directory.save_to_file(&path).unwrap();

        let loaded = PeerDirectory::load_or_default(&path);
        let ids: Vec<_> = loaded.list().into_iter().map(|r| r.id.0).collect();
        assert_eq!(ids, vec!["bob", "carol"]);
        assert!(loaded.remove(&PeerId::from_string("bob")).is_some());
        assert_eq!(loaded.len(), 1);
    }

    #[test]
    fn test_load_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = PeerDirectory::load_or_default(&dir.path().join("none.json"));
        assert!(loaded.is_empty());
    }
}
