//! Network configuration for a Peerline node.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the channel subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to listen on for incoming WebSocket connections.
    #[serde(with = "socket_addr_serde")]
    pub listen_addr: SocketAddr,

    /// Whether LAN discovery (UDP broadcast) is enabled.
    pub discovery_enabled: bool,

    /// UDP port used for LAN discovery announcements.
    pub discovery_port: u16,

    #[serde(with = "duration_ms_serde")]
    pub discovery_interval: Duration,

    /// Upper bound on any outbound connection attempt.
    #[serde(with = "duration_ms_serde")]
    pub connection_timeout: Duration,

    /// Default timeout for reachability probes.
    #[serde(with = "duration_ms_serde")]
    pub probe_timeout: Duration,

    /// How long a content send waits for a pending handshake to complete.
    #[serde(with = "duration_ms_serde")]
    pub handshake_wait: Duration,

    /// Refuse to send content in plaintext to a peer without a shared key.
    pub require_encryption: bool,

    /// Peer id -> `host:port` of peers reachable without discovery.
    pub known_peers: BTreeMap<String, String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9470)),
            discovery_enabled: true,
            discovery_port: 9471,
            discovery_interval: Duration::from_secs(5),
            connection_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
            handshake_wait: Duration::from_secs(2),
            require_encryption: false,
            known_peers: BTreeMap::new(),
        }
    }
}

impl NetworkConfig {
    /// Loopback listener on an ephemeral port with discovery off.
    pub fn loopback() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            discovery_enabled: false,
            ..Self::default()
        }
    }

    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create directory: {e}"))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {e}"))?;
        std::fs::write(path, json).map_err(|e| format!("Failed to write config file: {e}"))
    }

    /// Load config from a JSON file, or return defaults if the file is
    /// missing or unreadable.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<NetworkConfig>(&data) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Corrupt network config, using defaults: {e}");
                    }
                },
                Err(e) => {
                    tracing::warn!("Cannot read network config, using defaults: {e}");
                }
            }
        }
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

pub(crate) mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S: Serializer>(addr: &SocketAddr, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SocketAddr, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis().try_into().unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
