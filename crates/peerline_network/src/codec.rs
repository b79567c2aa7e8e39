//! Payload sealing with AES-256-GCM.
//!
//! Encrypted payloads travel as a JSON string `{"iv": ..., "data": ...}`,
//! both fields base64, `data` being ciphertext followed by the 16-byte tag.
//! When no key exists for a peer the payload passes through unchanged.

use std::sync::Arc;

use aes_gcm::Nonce;
use aes_gcm::aead::Aead;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::NetworkError;
use crate::identity::PeerId;
use crate::keys::{KeyAgreement, SharedKey};

/// AES-GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;

/// The structured ciphertext carried in an envelope's `data` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CiphertextEnvelope {
    pub iv: String,
    pub data: String,
}

/// Result of sealing a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sealed {
    /// No key for the peer; the payload is unchanged.
    Plaintext(String),
    /// A serialized [`CiphertextEnvelope`].
    Encrypted(String),
}

impl Sealed {
    pub fn is_encrypted(&self) -> bool {
        matches!(self, Self::Encrypted(_))
    }

    /// The string to put on the wire.
    pub fn into_wire(self) -> String {
        match self {
            Self::Plaintext(s) | Self::Encrypted(s) => s,
        }
    }
}

/// How an inbound payload was decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    Plaintext,
    Decrypted,
    Undecryptable,
}

/// Result of opening a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Opened {
    /// No key for the peer, or the payload is not a ciphertext envelope.
    Plaintext(String),
    /// Authenticated decryption succeeded.
    Decrypted(String),
    /// The payload looked encrypted but could not be opened. Carries the raw
    /// wire string.
    Undecryptable(String),
}

impl Opened {
    pub fn status(&self) -> DecodeStatus {
        match self {
            Self::Plaintext(_) => DecodeStatus::Plaintext,
            Self::Decrypted(_) => DecodeStatus::Decrypted,
            Self::Undecryptable(_) => DecodeStatus::Undecryptable,
        }
    }

    /// The decoded text, or the raw string on every fallback path.
    pub fn into_text(self) -> String {
        match self {
            Self::Plaintext(s) | Self::Decrypted(s) | Self::Undecryptable(s) => s,
        }
    }
}

/// Encrypt `plaintext` under `key` with a fresh random nonce.
pub fn seal_with(key: &SharedKey, plaintext: &str) -> Result<String, NetworkError> {
    let nonce_bytes: [u8; NONCE_LEN] = rand::random();
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = key
        .cipher()
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|e| NetworkError::Crypto(format!("Encryption failed: {e}")))?;

    let envelope = CiphertextEnvelope {
        iv: BASE64.encode(nonce_bytes),
        data: BASE64.encode(ciphertext),
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// Decrypt a wire string under `key`.
pub fn open_with(key: &SharedKey, wire: &str) -> Opened {
    let Ok(envelope) = serde_json::from_str::<CiphertextEnvelope>(wire) else {
        return Opened::Plaintext(wire.to_string());
    };

    let undecryptable = |reason: &str| {
        debug!("Undecryptable payload: {reason}");
        Opened::Undecryptable(wire.to_string())
    };

    let Ok(iv) = BASE64.decode(&envelope.iv) else {
        return undecryptable("iv is not base64");
    };
    if iv.len() != NONCE_LEN {
        return undecryptable("wrong iv length");
    }
    let Ok(ciphertext) = BASE64.decode(&envelope.data) else {
        return undecryptable("data is not base64");
    };

    match key.cipher().decrypt(Nonce::from_slice(&iv), ciphertext.as_slice()) {
        Ok(bytes) => match String::from_utf8(bytes) {
            Ok(text) => Opened::Decrypted(text),
            Err(_) => undecryptable("plaintext is not UTF-8"),
        },
        Err(_) => undecryptable("authentication failed"),
    }
}

/// Seals and opens payloads using the per-peer keys in [`KeyAgreement`].
#[derive(Clone)]
pub struct SecureCodec {
    keys: Arc<KeyAgreement>,
}

impl SecureCodec {
    pub fn new(keys: Arc<KeyAgreement>) -> Self {
        Self { keys }
    }

    pub fn seal(&self, peer: &PeerId, plaintext: &str) -> Result<Sealed, NetworkError> {
        match self.keys.get_key(peer) {
            Some(key) => seal_with(&key, plaintext).map(Sealed::Encrypted),
            None => Ok(Sealed::Plaintext(plaintext.to_string())),
        }
    }

    pub fn open(&self, peer: &PeerId, wire: &str) -> Opened {
        match self.keys.get_key(peer) {
            Some(key) => {
                let opened = open_with(&key, wire);
                if opened.status() == DecodeStatus::Undecryptable {
                    warn!("Could not decrypt payload from {peer}");
                }
                opened
            }
            None => Opened::Plaintext(wire.to_string()),
        }
    }

    /// Like [`open`](Self::open) but always yields a string.
    pub fn open_text(&self, peer: &PeerId, wire: &str) -> String {
        self.open(peer, wire).into_text()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
