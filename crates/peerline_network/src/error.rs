//! Network error types.

use std::time::Duration;

use crate::identity::PeerId;

/// Errors that can occur in the peerline_network crate.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// A transport-level error (connect/send/receive).
    #[error("Transport error: {0}")]
    Transport(String),

    /// No reachable endpoint is known for the peer, or it refused us.
    #[error("Peer unavailable: {0}")]
    PeerUnavailable(PeerId),

    /// The string cannot be used as a node identifier.
    #[error("Invalid peer id: {0:?}")]
    InvalidPeerId(String),

    /// Attempted to open a channel to our own node identifier.
    #[error("Cannot open a channel to our own peer id")]
    SelfConnect,

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Discovery subsystem error.
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// An operation timed out.
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// The node is not running.
    #[error("Node not running")]
    NotRunning,

    /// Key generation primitives failed. The node cannot secure any channel.
    #[error("Crypto primitives unavailable: {0}")]
    CryptoUnavailable(String),

    /// Encryption or key handling failed for a single operation.
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Content was refused because the channel has no shared key and
    /// plaintext fallback is disabled.
    #[error("Channel to {0} is not secured")]
    Unsecured(PeerId),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
