//! Transport boundary — peer-addressed, bidirectional text connections.
//!
//! A [`Transport`] opens outbound connections by peer id and accepts inbound
//! ones. Everything that happens on any connection is reported as a
//! [`TransportEvent`] on a single mpsc channel, in per-connection arrival
//! order. Writes go through the cloneable [`Connection`] handle.

pub mod memory;
pub mod ws;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::trace;

use crate::error::NetworkError;
use crate::identity::PeerId;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use ws::WsTransport;

/// Outgoing frame buffer per connection.
pub(crate) const OUTBOUND_BUFFER: usize = 64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Which side initiated a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Frames queued for a connection's writer task.
#[derive(Debug)]
pub(crate) enum Outgoing {
    Text(String),
    Close,
}

/// A handle to one open connection with a peer.
///
/// Clones share the same underlying connection.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    peer: PeerId,
    direction: Direction,
    outbound: mpsc::Sender<Outgoing>,
    open: Arc<AtomicBool>,
}

impl Connection {
    pub(crate) fn new(
        peer: PeerId,
        direction: Direction,
        outbound: mpsc::Sender<Outgoing>,
        open: Arc<AtomicBool>,
    ) -> Self {
        Self {
            id: ConnectionId::next(),
            peer,
            direction,
            outbound,
            open,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.outbound.is_closed()
    }

    /// Queue a text frame for the peer.
    pub async fn send_text(&self, text: String) -> Result<(), NetworkError> {
        if !self.is_open() {
            return Err(NetworkError::Transport(format!(
                "{} to {} is closed",
                self.id, self.peer
            )));
        }
        trace!("{} -> {}: {} bytes", self.id, self.peer, text.len());
        self.outbound
            .send(Outgoing::Text(text))
            .await
            .map_err(|_| NetworkError::Transport(format!("{} writer has stopped", self.id)))
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            let _ = self.outbound.try_send(Outgoing::Close);
        }
    }
}

/// Something that happened on a connection.
#[derive(Debug)]
pub enum TransportEvent {
    /// A connection reached the open state. Reported for both directions.
    Opened(Connection),
    /// A text frame arrived.
    Data {
        peer: PeerId,
        connection: ConnectionId,
        text: String,
    },
    /// A connection closed, from either end.
    Closed {
        peer: PeerId,
        connection: ConnectionId,
    },
}

/// A peer-addressed transport.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Begin accepting inbound connections until `shutdown` fires.
    async fn start(&self, shutdown: broadcast::Receiver<()>) -> Result<(), NetworkError>;

    /// Open a connection to `peer`. Resolves only once the connection is
    /// open; the transport also reports it as [`TransportEvent::Opened`].
    async fn connect(&self, peer: &PeerId) -> Result<Connection, NetworkError>;

    /// The socket address the transport is bound to, if any.
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> (Connection, mpsc::Receiver<Outgoing>) {
        let (tx, rx) = mpsc::channel(4);
        let conn = Connection::new(
            PeerId::from_string("bob"),
            Direction::Outbound,
            tx,
            Arc::new(AtomicBool::new(true)),
        );
        (conn, rx)
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let (a, _ra) = handle();
        let (b, _rb) = handle();
        assert_ne!(a.id(), b.id());
        assert!(a.id().to_string().starts_with("conn-"));
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (conn, mut rx) = handle();
        conn.send_text("one".into()).await.unwrap();
        assert!(matches!(rx.recv().await, Some(Outgoing::Text(t)) if t == "one"));

        conn.close();
        conn.close();
        assert!(!conn.is_open());
        assert!(matches!(rx.recv().await, Some(Outgoing::Close)));
        assert!(conn.send_text("two".into()).await.is_err());
    }

    #[tokio::test]
    async fn test_dropped_writer_reads_as_closed() {
        let (conn, rx) = handle();
        drop(rx);
        assert!(!conn.is_open());
    }
}
