//! Node identity — peer identifiers, the persisted node profile, and the
//! process-wide ECDH key pair.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use p256::pkcs8::EncodePublicKey;
use p256::{PublicKey, SecretKey};
use parking_lot::Mutex;
use rand::TryRngCore;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::NetworkError;

/// Longest identifier we accept. Identifiers travel as a URL path segment.
pub const MAX_PEER_ID_LEN: usize = 64;

/// A unique identifier for a peer node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    /// Generate a new random peer ID (UUID v4).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Create a PeerId from an existing string without validation.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Parse and validate a user-supplied identifier.
    ///
    /// Accepts 1..=64 characters of `[A-Za-z0-9_.-]`, starting with an
    /// alphanumeric character.
    pub fn parse(s: &str) -> Result<Self, NetworkError> {
        let s = s.trim();
        let starts_ok = s.chars().next().is_some_and(|c| c.is_ascii_alphanumeric());
        let chars_ok = s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if starts_ok && chars_ok && s.len() <= MAX_PEER_ID_LEN {
            Ok(Self(s.to_string()))
        } else {
            Err(NetworkError::InvalidPeerId(s.to_string()))
        }
    }

    /// Return the inner string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Presence advertised in the `sender` block of every envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    #[default]
    Online,
    Offline,
}

/// Sender metadata carried on the wire.
///
/// Fields other than `id`, `name` and `status` (avatar, bio, ...) are kept
/// in `extra` so they survive a decode/encode pass untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicNodeInfo {
    pub id: PeerId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: PresenceStatus,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl PublicNodeInfo {
    pub fn new(id: PeerId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            status: PresenceStatus::Online,
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_status(mut self, status: PresenceStatus) -> Self {
        self.status = status;
        self
    }
}

/// The persisted, non-secret identity of this node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeProfile {
    /// Our identifier on the mesh; doubles as transport address.
    pub peer_id: PeerId,
    /// Human-readable display name.
    pub name: String,
}

impl NodeProfile {
    pub fn new(peer_id: PeerId, name: impl Into<String>) -> Self {
        Self {
            peer_id,
            name: name.into(),
        }
    }

    /// Create a profile with a fresh PeerId.
    pub fn generate(name: impl Into<String>) -> Self {
        Self::new(PeerId::generate(), name)
    }

    /// The sender block we attach to outgoing envelopes.
    pub fn public_info(&self) -> PublicNodeInfo {
        PublicNodeInfo::new(self.peer_id.clone(), self.name.clone())
    }

    /// Save the profile to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create directory: {e}"))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize profile: {e}"))?;
        std::fs::write(path, json).map_err(|e| format!("Failed to write profile file: {e}"))
    }

    /// Load a profile from a JSON file, or generate a new one if the file
    /// does not exist or is unreadable.
    pub fn load_or_generate(path: &Path, name: impl Into<String>) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<NodeProfile>(&data) {
                    Ok(profile) => return profile,
                    Err(e) => {
                        tracing::warn!("Corrupt profile file, generating new: {e}");
                    }
                },
                Err(e) => {
                    tracing::warn!("Cannot read profile file, generating new: {e}");
                }
            }
        }

        let profile = Self::generate(name);
        if let Err(e) = profile.save_to_file(path) {
            tracing::warn!("Failed to persist new profile: {e}");
        }
        profile
    }
}

// ---------------------------------------------------------------------------
// Key pair
// ---------------------------------------------------------------------------

/// A P-256 key pair plus its exported (base64 SPKI DER) public half.
pub struct KeyPair {
    secret: SecretKey,
    public: PublicKey,
    exported: String,
}

impl KeyPair {
    /// Generate a key pair from the operating system's random source.
    pub fn generate() -> Result<Self, NetworkError> {
        let mut seed = [0u8; 32];
        // A uniformly random 32-byte string is a valid scalar unless it is
        // zero or above the group order, which happens with negligible odds.
        let secret = loop {
            rand::rngs::OsRng.try_fill_bytes(&mut seed).map_err(|e| {
                NetworkError::CryptoUnavailable(format!("OS random source failed: {e}"))
            })?;
            if let Ok(secret) = SecretKey::from_slice(&seed) {
                break secret;
            }
        };
        seed.fill(0);
        Self::from_secret(secret)
    }

    /// Build a key pair from an existing secret scalar.
    pub fn from_secret(secret: SecretKey) -> Result<Self, NetworkError> {
        let public = secret.public_key();
        let der = public.to_public_key_der().map_err(|e| {
            NetworkError::CryptoUnavailable(format!("Public key export failed: {e}"))
        })?;
        Ok(Self {
            exported: BASE64.encode(der.as_bytes()),
            secret,
            public,
        })
    }

    /// Base64 SPKI DER encoding, as advertised in handshake envelopes.
    pub fn exported_public_key(&self) -> &str {
        &self.exported
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub(crate) fn secret(&self) -> &SecretKey {
        &self.secret
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.exported)
            .finish_non_exhaustive()
    }
}

/// Holds this process's single key pair.
///
/// The pair is created on the first [`generate_identity`](Self::generate_identity)
/// call and reused afterwards; regenerating would orphan every shared key
/// already derived from it.
#[derive(Debug, Default)]
pub struct IdentityManager {
    key_pair: Mutex<Option<Arc<KeyPair>>>,
}

impl IdentityManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate the key pair if needed and return the exported public key.
    ///
    /// Fails with [`NetworkError::CryptoUnavailable`] if the random source
    /// cannot be used. Callers must treat that as fatal.
    pub fn generate_identity(&self) -> Result<String, NetworkError> {
        let mut slot = self.key_pair.lock();
        if let Some(existing) = slot.as_ref() {
            return Ok(existing.exported_public_key().to_string());
        }
        let pair = KeyPair::generate()?;
        let exported = pair.exported_public_key().to_string();
        *slot = Some(Arc::new(pair));
        info!("Generated node key pair");
        Ok(exported)
    }

    /// The current key pair, if one has been generated.
    pub fn key_pair(&self) -> Option<Arc<KeyPair>> {
        self.key_pair.lock().clone()
    }

    /// The exported public key, if one has been generated.
    pub fn public_key(&self) -> Option<String> {
        self.key_pair
            .lock()
            .as_ref()
            .map(|pair| pair.exported_public_key().to_string())
    }

    pub fn has_identity(&self) -> bool {
        self.key_pair.lock().is_some()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
