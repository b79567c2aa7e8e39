//! Packet router — classifies inbound envelopes and seals outbound ones.
//!
//! Inbound: handshakes feed [`KeyAgreement`], content is opened with
//! [`SecureCodec`] and handed to the content handler exactly once,
//! presence and call offers go to their own handlers. Anything that does
//! not parse is dropped and logged.
//!
//! Outbound: content is sealed under the key the peer advertised on the
//! connection being used. A fresh connection waits for that handshake, so
//! a peer that restarted with a new key is never sent payloads sealed under
//! its old one. With no key at all content goes out in plaintext, unless
//! [`SendPolicy::require_encryption`] is set.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use crate::codec::{DecodeStatus, SecureCodec, seal_with};
use crate::error::NetworkError;
use crate::identity::{IdentityManager, NodeProfile, PeerId, PublicNodeInfo};
use crate::keys::{KeyAgreement, SharedKey};
use crate::message::{Envelope, PacketKind};
use crate::registry::ConnectionRegistry;
use crate::transport::{Connection, ConnectionId};

/// A packet delivered to the application.
#[derive(Debug, Clone)]
pub struct InboundPacket {
    /// The peer of the connection the packet arrived on.
    pub from: PeerId,
    /// The envelope, with `data` already decrypted where possible.
    pub envelope: Envelope,
    pub decode: DecodeStatus,
}

/// An async callback receiving routed packets.
pub type PacketHandler =
    Arc<dyn Fn(InboundPacket) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Wrap an async closure as a [`PacketHandler`].
pub fn packet_handler<F, Fut>(f: F) -> PacketHandler
where
    F: Fn(InboundPacket) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |packet| Box::pin(f(packet)))
}

/// Why an inbound frame was not delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Not JSON, not an envelope, or an unknown `type`.
    Malformed,
    /// No handler is registered for the packet's kind.
    NoHandler,
}

/// What the router did with one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    KeyImported,
    KeyRejected,
    Delivered(DecodeStatus),
    Presence,
    CallOffer,
    Dropped(DropReason),
}

/// Outbound behaviour for content packets.
#[derive(Debug, Clone, Copy)]
pub struct SendPolicy {
    /// How long to wait for a pending handshake before sealing.
    pub handshake_wait: Duration,
    /// Refuse plaintext content.
    pub require_encryption: bool,
}

impl Default for SendPolicy {
    fn default() -> Self {
        Self {
            handshake_wait: Duration::from_secs(2),
            require_encryption: false,
        }
    }
}

#[derive(Default)]
struct Handlers {
    content: Option<PacketHandler>,
    presence: Option<PacketHandler>,
    call_offer: Option<PacketHandler>,
}

pub struct PacketRouter {
    profile: NodeProfile,
    identity: Arc<IdentityManager>,
    keys: Arc<KeyAgreement>,
    codec: SecureCodec,
    registry: ConnectionRegistry,
    handlers: RwLock<Handlers>,
    policy: SendPolicy,
}

impl PacketRouter {
    pub fn new(
        profile: NodeProfile,
        identity: Arc<IdentityManager>,
        keys: Arc<KeyAgreement>,
        registry: ConnectionRegistry,
        policy: SendPolicy,
    ) -> Self {
        Self {
            profile,
            identity,
            codec: SecureCodec::new(Arc::clone(&keys)),
            keys,
            registry,
            handlers: RwLock::new(Handlers::default()),
            policy,
        }
    }

    /// Register the handler for text, media, voice and typing packets.
    pub fn on_content(&self, handler: PacketHandler) {
        self.handlers.write().content = Some(handler);
    }

    pub fn on_presence(&self, handler: PacketHandler) {
        self.handlers.write().presence = Some(handler);
    }

    pub fn on_call_offer(&self, handler: PacketHandler) {
        self.handlers.write().call_offer = Some(handler);
    }

    /// The sender block attached to our envelopes.
    pub fn local_info(&self) -> PublicNodeInfo {
        self.profile.public_info()
    }

    /// Route one text frame received from `from` on `connection`.
    ///
    /// Keys are imported and payloads opened under `from`, the transport
    /// peer, never under the self-declared `sender.id`.
    pub async fn handle_inbound(
        &self,
        from: &PeerId,
        connection: ConnectionId,
        raw: &str,
    ) -> Routed {
        let mut envelope = match Envelope::from_json(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping malformed packet from {from} ({} bytes): {e}", raw.len());
                return Routed::Dropped(DropReason::Malformed);
            }
        };
        if &envelope.sender.id != from {
            debug!(
                "Packet on connection with {from} claims sender {}",
                envelope.sender.id
            );
        }
        trace!("{} packet from {from}", envelope.packet_type);

        match envelope.kind() {
            PacketKind::Handshake => {
                if self.keys.import_peer_key_on(from, &envelope.data, connection) {
                    Routed::KeyImported
                } else {
                    Routed::KeyRejected
                }
            }
            PacketKind::Content => {
                let opened = self.codec.open(from, &envelope.data);
                let decode = opened.status();
                envelope.data = opened.into_text();
                let handler = self.handlers.read().content.clone();
                if self.dispatch(handler, from, envelope, decode).await {
                    Routed::Delivered(decode)
                } else {
                    Routed::Dropped(DropReason::NoHandler)
                }
            }
            PacketKind::Presence => {
                let handler = self.handlers.read().presence.clone();
                if self.dispatch(handler, from, envelope, DecodeStatus::Plaintext).await {
                    Routed::Presence
                } else {
                    Routed::Dropped(DropReason::NoHandler)
                }
            }
            PacketKind::Signaling => {
                let handler = self.handlers.read().call_offer.clone();
                if self.dispatch(handler, from, envelope, DecodeStatus::Plaintext).await {
                    Routed::CallOffer
                } else {
                    Routed::Dropped(DropReason::NoHandler)
                }
            }
        }
    }

    async fn dispatch(
        &self,
        handler: Option<PacketHandler>,
        from: &PeerId,
        envelope: Envelope,
        decode: DecodeStatus,
    ) -> bool {
        let Some(handler) = handler else {
            debug!("No handler for {} packet from {from}", envelope.packet_type);
            return false;
        };
        handler(InboundPacket {
            from: from.clone(),
            envelope,
            decode,
        })
        .await;
        true
    }

    /// Send `envelope` to `peer`, connecting first if needed.
    pub async fn send(&self, peer: &PeerId, mut envelope: Envelope) -> Result<(), NetworkError> {
        let conn = self.registry.ensure(peer).await?;

        if envelope.kind() == PacketKind::Content {
            match self.sealing_key(&conn).await {
                Some(key) => envelope.data = seal_with(&key, &envelope.data)?,
                None if self.policy.require_encryption => {
                    return Err(NetworkError::Unsecured(peer.clone()));
                }
                None => warn!(
                    "Sending {} to {peer} unencrypted: channel not secured",
                    envelope.packet_type
                ),
            }
        }

        conn.send_text(envelope.to_json()?).await
    }

    /// The key to seal with on `conn`: the one the peer advertised on this
    /// connection, waited for up to the handshake wait. A key confirmed only
    /// on an earlier connection is used once that wait has run out.
    async fn sealing_key(&self, conn: &Connection) -> Option<Arc<SharedKey>> {
        let peer = conn.peer();
        if let Some(key) = self.keys.key_for_connection(peer, conn.id()) {
            return Some(key);
        }
        if !self.policy.handshake_wait.is_zero() {
            let waited = self
                .keys
                .wait_key_for(peer, conn.id(), self.policy.handshake_wait)
                .await;
            if waited.is_some() {
                return waited;
            }
        }
        let earlier = self.keys.get_key(peer);
        if earlier.is_some() {
            debug!("No handshake from {peer} on {}; using its last key", conn.id());
        }
        earlier
    }

    /// Forget per-connection state once `connection` to `peer` is closed.
    pub fn connection_closed(&self, peer: &PeerId, connection: ConnectionId) {
        self.keys.forget_connection(peer, connection);
    }

    /// Advertise our public key on `conn`.
    pub async fn send_handshake(&self, conn: &Connection) -> Result<(), NetworkError> {
        let public = self.identity.public_key().ok_or_else(|| {
            NetworkError::CryptoUnavailable("Local identity has not been generated".into())
        })?;
        self.keys.mark_securing(conn.peer());
        let envelope = Envelope::handshake(public, self.local_info());
        debug!("Sending handshake to {} on {}", conn.peer(), conn.id());
        conn.send_text(envelope.to_json()?).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
