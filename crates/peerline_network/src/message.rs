//! Wire envelopes exchanged between peers.
//!
//! Every frame on a connection is one UTF-8 JSON object:
//! `{"type": ..., "data": <string>, "sender": {...}}` with optional `id`
//! and `timestamp` fields.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

use crate::identity::{PresenceStatus, PublicNodeInfo};

/// The `type` tag of an [`Envelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketType {
    // ── Key exchange ────────────────────────────────────────────────
    /// Carries the sender's exported public key.
    Handshake,

    // ── Content (sealed when a key exists) ──────────────────────────
    Text,
    Media,
    Voice,
    Typing,

    // ── Control ─────────────────────────────────────────────────────
    /// `data` is `"online"` or `"offline"`.
    Presence,
    /// Media-call offer signaling. Opaque to this crate.
    Call,
}

/// Routing class of a [`PacketType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Handshake,
    Content,
    Presence,
    Signaling,
}

impl PacketType {
    pub fn kind(self) -> PacketKind {
        match self {
            Self::Handshake => PacketKind::Handshake,
            Self::Text | Self::Media | Self::Voice | Self::Typing => PacketKind::Content,
            Self::Presence => PacketKind::Presence,
            Self::Call => PacketKind::Signaling,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Handshake => "handshake",
            Self::Text => "text",
            Self::Media => "media",
            Self::Voice => "voice",
            Self::Typing => "typing",
            Self::Presence => "presence",
            Self::Call => "call",
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A network frame carrying one packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub packet_type: PacketType,
    /// Payload. For content packets this is plaintext or a sealed
    /// ciphertext envelope, depending on the channel state.
    #[serde(deserialize_with = "lenient_string")]
    pub data: String,
    pub sender: PublicNodeInfo,
    /// Message identifier (UUID v4), used by the application as a
    /// persistence key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Milliseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl Envelope {
    /// Create an envelope without message id or timestamp.
    pub fn new(packet_type: PacketType, data: impl Into<String>, sender: PublicNodeInfo) -> Self {
        Self {
            packet_type,
            data: data.into(),
            sender,
            id: None,
            timestamp: None,
        }
    }

    /// Create a content envelope stamped with a fresh id and the current time.
    pub fn content(packet_type: PacketType, data: impl Into<String>, sender: PublicNodeInfo) -> Self {
        Self {
            id: Some(uuid::Uuid::new_v4().to_string()),
            timestamp: Some(chrono::Utc::now().timestamp_millis()),
            ..Self::new(packet_type, data, sender)
        }
    }

    pub fn handshake(public_key: impl Into<String>, sender: PublicNodeInfo) -> Self {
        Self::new(PacketType::Handshake, public_key, sender)
    }

    pub fn text(body: impl Into<String>, sender: PublicNodeInfo) -> Self {
        Self::content(PacketType::Text, body, sender)
    }

    /// A shared photo or file, carried as a `data:` URL.
    pub fn media(data_url: impl Into<String>, sender: PublicNodeInfo) -> Self {
        Self::content(PacketType::Media, data_url, sender)
    }

    /// A typing indicator. `data` is empty; it carries no user content.
    pub fn typing(sender: PublicNodeInfo) -> Self {
        Self::new(PacketType::Typing, "", sender)
    }

    pub fn presence(status: PresenceStatus, sender: PublicNodeInfo) -> Self {
        let data = match status {
            PresenceStatus::Online => "online",
            PresenceStatus::Offline => "offline",
        };
        Self::new(PacketType::Presence, data, sender.with_status(status))
    }

    pub fn call_offer(offer: impl Into<String>, sender: PublicNodeInfo) -> Self {
        Self::content(PacketType::Call, offer, sender)
    }

    pub fn kind(&self) -> PacketKind {
        self.packet_type.kind()
    }

    /// Serialize the envelope to a JSON string for transmission.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize an envelope from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Accept any JSON value for `data`; non-strings are kept in their JSON form.
fn lenient_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    match serde_json::Value::deserialize(d)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Null => Ok(String::new()),
        other => Ok(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
