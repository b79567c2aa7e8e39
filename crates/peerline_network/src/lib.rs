//! Peerline Network — secure peer channels for a P2P chat client.
//!
//! Two nodes identified by opaque peer ids open a direct connection, swap
//! P-256 public keys in handshake envelopes, derive a per-peer AES-256-GCM
//! key, and exchange sealed chat envelopes over that connection.
//!
//! # Architecture
//!
//! - **Identity**: one P-256 key pair per process ([`IdentityManager`]).
//! - **Keys**: per-peer channel state and shared keys ([`KeyAgreement`]).
//! - **Codec**: AEAD sealing of payloads ([`SecureCodec`]).
//! - **Registry**: at most one live connection per peer, coalesced
//!   connects ([`ConnectionRegistry`]).
//! - **Router**: inbound classification and outbound sealing
//!   ([`PacketRouter`]).
//! - **Transport**: WebSocket (`tokio-tungstenite`) or in-memory.
//! - **Discovery**: UDP broadcast on the LAN feeding the [`PeerDirectory`].
//!
//! # Quick start
//!
//! ```rust,no_run
//! use peerline_network::{ChatNode, NetworkConfig, NodeProfile, PeerId};
//!
//! # async fn example() -> Result<(), peerline_network::NetworkError> {
//! let profile = NodeProfile::generate("my-node");
//! let mut node = ChatNode::new(profile, NetworkConfig::default());
//!
//! node.start().await?;
//! node.send_text(&PeerId::parse("bob")?, "hello").await?;
//! node.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod directory;
pub mod discovery;
pub mod error;
pub mod identity;
pub mod keys;
pub mod message;
pub mod node;
pub mod registry;
pub mod router;
pub mod transport;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use codec::{DecodeStatus, Opened, Sealed, SecureCodec};
pub use config::NetworkConfig;
pub use directory::{PeerDirectory, PeerRecord, PeerSource};
pub use error::NetworkError;
pub use identity::{IdentityManager, NodeProfile, PeerId, PresenceStatus, PublicNodeInfo};
pub use keys::{ChannelState, KeyAgreement, SharedKey};
pub use message::{Envelope, PacketKind, PacketType};
pub use node::ChatNode;
pub use registry::{ConnectionRegistry, ConnectionState};
pub use router::{InboundPacket, PacketHandler, PacketRouter, Routed, SendPolicy, packet_handler};
pub use transport::{Connection, MemoryNetwork, Transport, TransportEvent};
