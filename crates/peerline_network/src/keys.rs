//! Key agreement — per-peer shared keys derived via P-256 ECDH.
//!
//! Each peer moves through [`ChannelState::Unsecured`] →
//! [`ChannelState::Securing`] (our handshake went out) →
//! [`ChannelState::Secured`] (their public key was imported). A handshake
//! carrying a different key replaces the held one.
//!
//! Each key also remembers the connections it was advertised on, so a
//! sender can tell a key confirmed on the live connection from one left
//! over by a connection the peer has since dropped.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use aes_gcm::{Aes256Gcm, KeyInit};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use p256::PublicKey;
use p256::pkcs8::DecodePublicKey;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::NetworkError;
use crate::identity::{IdentityManager, KeyPair, PeerId};
use crate::transport::ConnectionId;

/// Number of 5-digit groups in a rendered safety number.
const SAFETY_NUMBER_GROUPS: usize = 8;

/// A symmetric AES-256-GCM key shared with one peer.
#[derive(Clone)]
pub struct SharedKey {
    cipher: Aes256Gcm,
    peer_public: String,
}

impl SharedKey {
    /// Derive the shared key from our key pair and the peer's exported
    /// (base64 SPKI DER) public key.
    ///
    /// The raw 32-byte ECDH x-coordinate is used directly as the AES key,
    /// matching what WebCrypto's `deriveKey(ECDH, AES-GCM 256)` produces.
    pub fn derive(own: &KeyPair, peer_exported: &str) -> Result<Self, NetworkError> {
        let der = BASE64
            .decode(peer_exported.trim())
            .map_err(|e| NetworkError::Crypto(format!("Public key is not base64: {e}")))?;
        let public = PublicKey::from_public_key_der(&der)
            .map_err(|e| NetworkError::Crypto(format!("Public key is not P-256 SPKI: {e}")))?;

        let shared =
            p256::ecdh::diffie_hellman(own.secret().to_nonzero_scalar(), public.as_affine());
        let cipher = Aes256Gcm::new_from_slice(shared.raw_secret_bytes().as_slice())
            .map_err(|e| NetworkError::Crypto(format!("Invalid shared key length: {e}")))?;

        Ok(Self {
            cipher,
            peer_public: peer_exported.trim().to_string(),
        })
    }

    /// The peer public key this key was derived from, as advertised.
    pub fn peer_public_key(&self) -> &str {
        &self.peer_public
    }

    pub(crate) fn cipher(&self) -> &Aes256Gcm {
        &self.cipher
    }
}

impl fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedKey").finish_non_exhaustive()
    }
}

/// Security state of the channel to one peer.
#[derive(Debug, Clone, Default)]
pub enum ChannelState {
    /// No handshake sent or received.
    #[default]
    Unsecured,
    /// Our public key was sent; the peer's has not arrived yet.
    Securing,
    /// A shared key is established.
    Secured(Arc<SharedKey>),
}

impl ChannelState {
    pub fn is_secured(&self) -> bool {
        matches!(self, Self::Secured(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Unsecured => "unsecured",
            Self::Securing => "securing",
            Self::Secured(_) => "secured",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Per-peer record: the channel state plus the connections on which the
/// peer advertised the key currently held.
#[derive(Debug, Default)]
struct Channel {
    state: ChannelState,
    confirmed_on: HashSet<ConnectionId>,
}

/// Stores at most one shared key per peer.
pub struct KeyAgreement {
    identity: Arc<IdentityManager>,
    channels: RwLock<HashMap<PeerId, Channel>>,
    /// Bumped on every state change so waiters can re-check.
    updates: watch::Sender<u64>,
}

impl KeyAgreement {
    pub fn new(identity: Arc<IdentityManager>) -> Self {
        let (updates, _) = watch::channel(0);
        Self {
            identity,
            channels: RwLock::new(HashMap::new()),
            updates,
        }
    }

    /// Derive and store the shared key for `peer`.
    ///
    /// Returns `false` if our own identity does not exist yet or the key is
    /// malformed; in both cases the existing state for `peer` is untouched.
    pub fn import_peer_key(&self, peer: &PeerId, exported: &str) -> bool {
        self.import(peer, exported, None)
    }

    /// Like [`import_peer_key`](Self::import_peer_key), and records that
    /// the key was advertised on `connection`. A different key than the
    /// one held replaces it and drops every earlier confirmation.
    pub fn import_peer_key_on(
        &self,
        peer: &PeerId,
        exported: &str,
        connection: ConnectionId,
    ) -> bool {
        self.import(peer, exported, Some(connection))
    }

    fn import(&self, peer: &PeerId, exported: &str, connection: Option<ConnectionId>) -> bool {
        let Some(own) = self.identity.key_pair() else {
            warn!("Ignoring key from {peer}: local identity not generated");
            return false;
        };

        let key = match SharedKey::derive(&own, exported) {
            Ok(key) => key,
            Err(e) => {
                warn!("Rejected public key from {peer}: {e}");
                return false;
            }
        };

        let previous = {
            let mut channels = self.channels.write();
            let channel = channels.entry(peer.clone()).or_default();
            let previous = match &channel.state {
                ChannelState::Secured(old) if old.peer_public_key() == key.peer_public_key() => {
                    Some(true)
                }
                ChannelState::Secured(_) => Some(false),
                _ => None,
            };
            if previous != Some(true) {
                channel.state = ChannelState::Secured(Arc::new(key));
                channel.confirmed_on.clear();
            }
            if let Some(connection) = connection {
                channel.confirmed_on.insert(connection);
            }
            previous
        };

        match previous {
            Some(true) => debug!("Repeated handshake from {peer}"),
            Some(false) => info!("Peer {peer} rotated its public key; shared key replaced"),
            None => info!("Channel to {peer} secured"),
        }

        self.notify();
        true
    }

    pub fn has_key(&self, peer: &PeerId) -> bool {
        self.get_key(peer).is_some()
    }

    pub fn get_key(&self, peer: &PeerId) -> Option<Arc<SharedKey>> {
        match self.channels.read().get(peer).map(|c| &c.state) {
            Some(ChannelState::Secured(key)) => Some(Arc::clone(key)),
            _ => None,
        }
    }

    /// The key for `peer`, but only if the peer advertised it on
    /// `connection`.
    pub fn key_for_connection(
        &self,
        peer: &PeerId,
        connection: ConnectionId,
    ) -> Option<Arc<SharedKey>> {
        let channels = self.channels.read();
        let channel = channels.get(peer)?;
        match &channel.state {
            ChannelState::Secured(key) if channel.confirmed_on.contains(&connection) => {
                Some(Arc::clone(key))
            }
            _ => None,
        }
    }

    pub fn channel_state(&self, peer: &PeerId) -> ChannelState {
        self.channels
            .read()
            .get(peer)
            .map(|c| c.state.clone())
            .unwrap_or_default()
    }

    /// Record that our handshake was sent. A secured channel stays secured.
    pub fn mark_securing(&self, peer: &PeerId) {
        {
            let mut channels = self.channels.write();
            let channel = channels.entry(peer.clone()).or_default();
            if channel.state.is_secured() {
                return;
            }
            channel.state = ChannelState::Securing;
        }
        self.notify();
    }

    /// Drop the confirmation recorded for a closed connection.
    pub fn forget_connection(&self, peer: &PeerId, connection: ConnectionId) {
        if let Some(channel) = self.channels.write().get_mut(peer) {
            channel.confirmed_on.remove(&connection);
        }
    }

    /// Forget everything about `peer`, including key material.
    pub fn remove_peer(&self, peer: &PeerId) -> bool {
        let removed = self.channels.write().remove(peer).is_some();
        if removed {
            debug!("Purged key material for {peer}");
            self.notify();
        }
        removed
    }

    /// Peers with an established shared key.
    pub fn secured_peers(&self) -> Vec<PeerId> {
        self.channels
            .read()
            .iter()
            .filter(|(_, channel)| channel.state.is_secured())
            .map(|(peer, _)| peer.clone())
            .collect()
    }

    /// A human-comparable fingerprint of both public keys.
    ///
    /// Both sides compute the same value, so users can read it to each
    /// other out of band to detect a substituted key.
    pub fn safety_number(&self, peer: &PeerId) -> Option<String> {
        let own = self.identity.public_key()?;
        let theirs = self.get_key(peer)?.peer_public_key().to_string();
        let own_der = BASE64.decode(own).ok()?;
        let their_der = BASE64.decode(theirs).ok()?;

        let (first, second) = if own_der <= their_der {
            (own_der, their_der)
        } else {
            (their_der, own_der)
        };
        let digest = Sha256::new()
            .chain_update(&first)
            .chain_update(&second)
            .finalize();

        let groups: Vec<String> = digest
            .chunks_exact(4)
            .take(SAFETY_NUMBER_GROUPS)
            .map(|chunk| {
                let n = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                format!("{:05}", n % 100_000)
            })
            .collect();
        Some(groups.join(" "))
    }

    /// Wait until the channel to `peer` is secured, or `timeout` elapses.
    pub async fn wait_secured(&self, peer: &PeerId, timeout: Duration) -> bool {
        self.wait_for(timeout, || self.get_key(peer)).await.is_some()
    }

    /// Wait until `peer` advertises a key on `connection`, or `timeout`
    /// elapses.
    pub async fn wait_key_for(
        &self,
        peer: &PeerId,
        connection: ConnectionId,
        timeout: Duration,
    ) -> Option<Arc<SharedKey>> {
        self.wait_for(timeout, || self.key_for_connection(peer, connection))
            .await
    }

    async fn wait_for<T>(&self, timeout: Duration, check: impl Fn() -> Option<T>) -> Option<T> {
        let mut updates = self.updates.subscribe();
        let wait = async {
            loop {
                if let Some(found) = check() {
                    return Some(found);
                }
                if updates.changed().await.is_err() {
                    return None;
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.unwrap_or(None)
    }

    fn notify(&self) {
        self.updates.send_modify(|version| *version = version.wrapping_add(1));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
