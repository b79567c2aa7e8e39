//! Connection registry — at most one live connection per peer.
//!
//! Outbound connects are coalesced: while an attempt to a peer is in
//! flight, every other caller waits on the same attempt through a
//! `watch` channel instead of dialling again. The slot map is behind a
//! mutex that is never held across an await.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::NetworkError;
use crate::identity::PeerId;
use crate::transport::{Connection, ConnectionId, Direction, Transport};

/// Lifecycle of the registry entry for one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// Why an outbound attempt failed. Cloned to every waiting caller.
#[derive(Debug, Clone)]
enum ConnectFailure {
    Unavailable,
    SelfConnect,
    Timeout(Duration),
    Cancelled,
    Other(String),
}

impl ConnectFailure {
    fn into_error(self, peer: &PeerId) -> NetworkError {
        match self {
            Self::Unavailable => NetworkError::PeerUnavailable(peer.clone()),
            Self::SelfConnect => NetworkError::SelfConnect,
            Self::Timeout(after) => NetworkError::Timeout(after),
            Self::Cancelled => NetworkError::Transport(format!("Connect to {peer} was cancelled")),
            Self::Other(reason) => NetworkError::Transport(reason),
        }
    }
}

type Attempt = watch::Receiver<Option<Result<Connection, ConnectFailure>>>;

enum Slot {
    Connecting(Attempt),
    Open(Connection),
}

struct Inner {
    local: PeerId,
    transport: Arc<dyn Transport>,
    slots: Mutex<HashMap<PeerId, Slot>>,
    connect_timeout: Duration,
}

/// Maps peer id to its live [`Connection`].
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<Inner>,
}

impl ConnectionRegistry {
    pub fn new(local: PeerId, transport: Arc<dyn Transport>, connect_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                local,
                transport,
                slots: Mutex::new(HashMap::new()),
                connect_timeout,
            }),
        }
    }

    /// The open connection to `peer`, if any.
    pub fn get(&self, peer: &PeerId) -> Option<Connection> {
        match self.inner.slots.lock().get(peer) {
            Some(Slot::Open(conn)) if conn.is_open() => Some(conn.clone()),
            _ => None,
        }
    }

    pub fn state(&self, peer: &PeerId) -> ConnectionState {
        match self.inner.slots.lock().get(peer) {
            Some(Slot::Open(conn)) if conn.is_open() => ConnectionState::Open,
            Some(Slot::Connecting(_)) => ConnectionState::Connecting,
            _ => ConnectionState::Closed,
        }
    }

    /// Return the open connection to `peer`, opening one if needed.
    ///
    /// Concurrent calls for the same peer share a single attempt.
    pub async fn ensure(&self, peer: &PeerId) -> Result<Connection, NetworkError> {
        self.validate(peer)?;

        let mut attempt = {
            let mut slots = self.inner.slots.lock();
            match slots.get(peer) {
                Some(Slot::Open(conn)) if conn.is_open() => return Ok(conn.clone()),
                Some(Slot::Connecting(attempt)) => {
                    debug!("Joining in-flight connect to {peer}");
                    attempt.clone()
                }
                _ => {
                    let (tx, rx) = watch::channel(None);
                    slots.insert(peer.clone(), Slot::Connecting(rx.clone()));
                    tokio::spawn(Self::connect(Arc::clone(&self.inner), peer.clone(), tx));
                    rx
                }
            }
        };

        loop {
            let current = attempt.borrow_and_update().clone();
            if let Some(result) = current {
                return result.map_err(|failure| failure.into_error(peer));
            }
            if attempt.changed().await.is_err() {
                return Err(ConnectFailure::Cancelled.into_error(peer));
            }
        }
    }

    async fn connect(
        inner: Arc<Inner>,
        peer: PeerId,
        tx: watch::Sender<Option<Result<Connection, ConnectFailure>>>,
    ) {
        let marker = tx.subscribe();
        let outcome = match tokio::time::timeout(
            inner.connect_timeout,
            inner.transport.connect(&peer),
        )
        .await
        {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(NetworkError::PeerUnavailable(_))) => Err(ConnectFailure::Unavailable),
            Ok(Err(NetworkError::SelfConnect)) => Err(ConnectFailure::SelfConnect),
            Ok(Err(e)) => Err(ConnectFailure::Other(e.to_string())),
            Err(_) => Err(ConnectFailure::Timeout(inner.connect_timeout)),
        };

        let outcome = {
            let mut slots = inner.slots.lock();
            let ours = matches!(
                slots.get(&peer),
                Some(Slot::Connecting(attempt)) if attempt.same_channel(&marker)
            );
            match outcome {
                Ok(conn) if ours || matches!(slots.get(&peer), Some(Slot::Open(_))) => {
                    let adopted = match slots.get(&peer) {
                        Some(Slot::Open(existing))
                            if existing.id() != conn.id()
                                && existing.is_open()
                                && !keeps_outbound(&inner.local, &peer) =>
                        {
                            Some(existing.clone())
                        }
                        _ => None,
                    };
                    match adopted {
                        Some(existing) => {
                            debug!(
                                "Simultaneous open with {peer}: keeping {}, closing {}",
                                existing.id(),
                                conn.id()
                            );
                            conn.close();
                            Ok(existing)
                        }
                        None => {
                            info!("Connected to {peer} ({})", conn.id());
                            let replaced = slots.insert(peer.clone(), Slot::Open(conn.clone()));
                            close_replaced(replaced, &conn);
                            Ok(conn)
                        }
                    }
                }
                Ok(conn) => {
                    debug!("Connect to {peer} finished after removal; closing {}", conn.id());
                    conn.close();
                    Err(ConnectFailure::Cancelled)
                }
                Err(failure) => {
                    if ours {
                        slots.remove(&peer);
                    }
                    debug!("Connect to {peer} failed: {failure:?}");
                    Err(failure)
                }
            }
        };
        tx.send_replace(Some(outcome));
    }

    /// Register a peer-initiated connection. It replaces any current entry,
    /// except a live connection we dialled while holding the lower id.
    pub fn adopt(&self, conn: Connection) {
        let peer = conn.peer().clone();
        if peer == self.inner.local {
            warn!("Refusing connection claiming our own id");
            conn.close();
            return;
        }

        let mut slots = self.inner.slots.lock();
        if let Some(Slot::Open(existing)) = slots.get(&peer) {
            if existing.id() != conn.id()
                && existing.is_open()
                && existing.direction() == Direction::Outbound
                && keeps_outbound(&self.inner.local, &peer)
            {
                debug!(
                    "Simultaneous open with {peer}: keeping {}, closing inbound {}",
                    existing.id(),
                    conn.id()
                );
                conn.close();
                return;
            }
        }
        debug!("Adopting inbound {} from {peer}", conn.id());
        let replaced = slots.insert(peer, Slot::Open(conn.clone()));
        close_replaced(replaced, &conn);
    }

    /// Forget the entry for `peer` if it is still `connection`. Returns
    /// whether anything was removed.
    pub fn handle_closed(&self, peer: &PeerId, connection: ConnectionId) -> bool {
        let mut slots = self.inner.slots.lock();
        match slots.get(peer) {
            Some(Slot::Open(conn)) if conn.id() == connection => {
                slots.remove(peer);
                debug!("{connection} to {peer} closed");
                true
            }
            _ => false,
        }
    }

    /// Close and forget the connection to `peer`. An in-flight attempt is
    /// abandoned; its connection is closed when it lands.
    pub fn remove(&self, peer: &PeerId) -> bool {
        match self.inner.slots.lock().remove(peer) {
            Some(Slot::Open(conn)) => {
                conn.close();
                true
            }
            Some(Slot::Connecting(_)) => true,
            None => false,
        }
    }

    /// Check that `peer` is reachable within `timeout`.
    ///
    /// A successful probe leaves the connection registered. Our own id is
    /// never reachable.
    pub async fn probe(&self, peer: &PeerId, timeout: Duration) -> bool {
        if peer == &self.inner.local {
            return false;
        }
        match tokio::time::timeout(timeout, self.ensure(peer)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!("Probe of {peer} failed: {e}");
                false
            }
            Err(_) => {
                debug!("Probe of {peer} timed out after {timeout:?}");
                false
            }
        }
    }

    /// Peers with an open connection, sorted.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<_> = self
            .inner
            .slots
            .lock()
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Open(conn) if conn.is_open()))
            .map(|(peer, _)| peer.clone())
            .collect();
        peers.sort();
        peers
    }

    /// Close every open connection and clear the map.
    pub fn close_all(&self) {
        let drained: Vec<_> = self.inner.slots.lock().drain().collect();
        for (_, slot) in drained {
            if let Slot::Open(conn) = slot {
                conn.close();
            }
        }
    }

    fn validate(&self, peer: &PeerId) -> Result<(), NetworkError> {
        PeerId::parse(peer.as_str())?;
        if peer == &self.inner.local {
            return Err(NetworkError::SelfConnect);
        }
        Ok(())
    }
}

/// When both ends dial at once, the connection dialled by the lower peer
/// id survives on both sides.
fn keeps_outbound(local: &PeerId, peer: &PeerId) -> bool {
    local < peer
}

fn close_replaced(replaced: Option<Slot>, current: &Connection) {
    if let Some(Slot::Open(old)) = replaced {
        if old.id() != current.id() {
            debug!("Closing {} to {}, replaced by {}", old.id(), old.peer(), current.id());
            old.close();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryNetwork, TransportEvent};
    use tokio::sync::{broadcast, mpsc};

    struct Fixture {
        registry: ConnectionRegistry,
        bob_events: mpsc::Receiver<TransportEvent>,
        _alice_events: mpsc::Receiver<TransportEvent>,
        _stops: Vec<broadcast::Sender<()>>,
    }

    async fn fixture() -> Fixture {
        let network = MemoryNetwork::new();
        let mut stops = Vec::new();

        let (bob_tx, bob_events) = mpsc::channel(64);
        let bob = network.attach(PeerId::from_string("bob"), bob_tx);
        let (stop, rx) = broadcast::channel(1);
        bob.start(rx).await.unwrap();
        stops.push(stop);

        let (alice_tx, alice_events) = mpsc::channel(64);
        let alice = network.attach(PeerId::from_string("alice"), alice_tx);
        let (stop, rx) = broadcast::channel(1);
        alice.start(rx).await.unwrap();
        stops.push(stop);

        Fixture {
            registry: ConnectionRegistry::new(
                PeerId::from_string("alice"),
                Arc::new(alice),
                Duration::from_secs(2),
            ),
            bob_events,
            _alice_events: alice_events,
            _stops: stops,
        }
    }

    #[tokio::test]
    async fn test_get_absent_without_connection() {
        let f = fixture().await;
        assert!(f.registry.get(&PeerId::from_string("bob")).is_none());
        assert_eq!(f.registry.state(&PeerId::from_string("bob")), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_ensure_registers_open_connection() {
        let f = fixture().await;
        let bob = PeerId::from_string("bob");

        let conn = f.registry.ensure(&bob).await.unwrap();
        assert_eq!(f.registry.state(&bob), ConnectionState::Open);
        assert_eq!(f.registry.get(&bob).unwrap().id(), conn.id());
        assert_eq!(f.registry.connected_peers(), vec![bob.clone()]);

        let again = f.registry.ensure(&bob).await.unwrap();
        assert_eq!(again.id(), conn.id());
    }

    #[tokio::test]
    async fn test_concurrent_ensure_is_coalesced() {
        let mut f = fixture().await;
        let bob = PeerId::from_string("bob");

        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let registry = f.registry.clone();
                let bob = bob.clone();
                tokio::spawn(async move { registry.ensure(&bob).await.unwrap().id() })
            })
            .collect();

        let mut ids = Vec::new();
        for attempt in attempts {
            ids.push(attempt.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut opened = 0;
        while let Ok(event) = f.bob_events.try_recv() {
            if matches!(event, TransportEvent::Opened(_)) {
                opened += 1;
            }
        }
        assert_eq!(opened, 1);
    }

    #[tokio::test]
    async fn test_closed_connection_is_absent_and_reconnects() {
        let f = fixture().await;
        let bob = PeerId::from_string("bob");

        let first = f.registry.ensure(&bob).await.unwrap();
        first.close();
        assert!(f.registry.get(&bob).is_none());
        assert!(f.registry.handle_closed(&bob, first.id()));
        assert!(!f.registry.handle_closed(&bob, first.id()));

        let second = f.registry.ensure(&bob).await.unwrap();
        assert_ne!(second.id(), first.id());
    }

    #[tokio::test]
    async fn test_stale_close_keeps_newer_entry() {
        let f = fixture().await;
        let bob = PeerId::from_string("bob");

        let first = f.registry.ensure(&bob).await.unwrap();
        f.registry.remove(&bob);
        let second = f.registry.ensure(&bob).await.unwrap();

        assert!(!f.registry.handle_closed(&bob, first.id()));
        assert_eq!(f.registry.get(&bob).unwrap().id(), second.id());
    }

    #[tokio::test]
    async fn test_probe_unknown_peer_is_false() {
        let f = fixture().await;
        let started = std::time::Instant::now();
        let reachable = f
            .registry
            .probe(&PeerId::from_string("nonexistent-peer"), Duration::from_millis(1000))
            .await;
        assert!(!reachable);
        assert!(started.elapsed() < Duration::from_millis(1500));
        assert_eq!(
            f.registry.state(&PeerId::from_string("nonexistent-peer")),
            ConnectionState::Closed
        );
    }

    #[tokio::test]
    async fn test_probe_keeps_connection() {
        let f = fixture().await;
        let bob = PeerId::from_string("bob");
        assert!(f.registry.probe(&bob, Duration::from_secs(1)).await);
        assert!(f.registry.get(&bob).is_some());
        assert!(!f.registry.probe(&PeerId::from_string("alice"), Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_ensure_rejects_invalid_and_self() {
        let f = fixture().await;
        assert!(matches!(
            f.registry.ensure(&PeerId::from_string("alice")).await,
            Err(NetworkError::SelfConnect)
        ));
        assert!(matches!(
            f.registry.ensure(&PeerId::from_string("no/slashes")).await,
            Err(NetworkError::InvalidPeerId(_))
        ));
    }

    #[tokio::test]
    async fn test_close_all() {
        let f = fixture().await;
        let bob = PeerId::from_string("bob");
        let conn = f.registry.ensure(&bob).await.unwrap();
        f.registry.close_all();
        assert!(!conn.is_open());
        assert!(f.registry.connected_peers().is_empty());
    }

    struct Pair {
        registry: ConnectionRegistry,
        remote: crate::transport::MemoryTransport,
        local_events: mpsc::Receiver<TransportEvent>,
        _remote_events: mpsc::Receiver<TransportEvent>,
        _stops: Vec<broadcast::Sender<()>>,
    }

    async fn pair(local: &str, remote: &str) -> Pair {
        let network = MemoryNetwork::new();
        let mut stops = Vec::new();

        let (tx, local_events) = mpsc::channel(64);
        let local_transport = network.attach(PeerId::from_string(local), tx);
        let (stop, rx) = broadcast::channel(1);
        local_transport.start(rx).await.unwrap();
        stops.push(stop);

        let (tx, remote_events) = mpsc::channel(64);
        let remote_transport = network.attach(PeerId::from_string(remote), tx);
        let (stop, rx) = broadcast::channel(1);
        remote_transport.start(rx).await.unwrap();
        stops.push(stop);

        Pair {
            registry: ConnectionRegistry::new(
                PeerId::from_string(local),
                Arc::new(local_transport),
                Duration::from_secs(2),
            ),
            remote: remote_transport,
            local_events,
            _remote_events: remote_events,
            _stops: stops,
        }
    }

    /// The remote side dials us; returns our end of that connection.
    async fn dial_in(p: &mut Pair) -> Connection {
        let local = p.registry.inner.local.clone();
        p.remote.connect(&local).await.unwrap();
        opened(&mut p.local_events, Direction::Inbound).await
    }

    async fn opened(events: &mut mpsc::Receiver<TransportEvent>, direction: Direction) -> Connection {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
                .await
                .unwrap()
                .unwrap();
            if let TransportEvent::Opened(conn) = event {
                if conn.direction() == direction {
                    return conn;
                }
            }
        }
    }

    /// Run a dial that lands after the remote's connection was adopted.
    async fn land_dial(p: &Pair, peer: &PeerId) -> Connection {
        let (tx, rx) = watch::channel(None);
        ConnectionRegistry::connect(Arc::clone(&p.registry.inner), peer.clone(), tx).await;
        let outcome = rx.borrow().clone();
        outcome.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_simultaneous_open_lower_id_keeps_its_dial() {
        let mut p = pair("alice", "bob").await;
        let bob = PeerId::from_string("bob");

        let inbound = dial_in(&mut p).await;
        p.registry.adopt(inbound.clone());

        let kept = land_dial(&p, &bob).await;
        assert_eq!(kept.direction(), Direction::Outbound);
        assert_eq!(p.registry.get(&bob).unwrap().id(), kept.id());
        assert!(!inbound.is_open());
    }

    #[tokio::test]
    async fn test_simultaneous_open_higher_id_keeps_inbound() {
        let mut p = pair("bob", "alice").await;
        let alice = PeerId::from_string("alice");

        let inbound = dial_in(&mut p).await;
        p.registry.adopt(inbound.clone());

        let kept = land_dial(&p, &alice).await;
        assert_eq!(kept.id(), inbound.id());
        assert_eq!(p.registry.get(&alice).unwrap().id(), inbound.id());
        assert!(inbound.is_open());

        let dialled = opened(&mut p.local_events, Direction::Outbound).await;
        assert!(!dialled.is_open());
    }

    #[tokio::test]
    async fn test_adopt_closes_or_refuses_duplicate() {
        // Lower id: our live dial stays, the inbound duplicate is closed.
        let mut p = pair("alice", "bob").await;
        let bob = PeerId::from_string("bob");
        let ours = p.registry.ensure(&bob).await.unwrap();
        let inbound = dial_in(&mut p).await;
        p.registry.adopt(inbound.clone());
        assert_eq!(p.registry.get(&bob).unwrap().id(), ours.id());
        assert!(!inbound.is_open());

        // Higher id: the inbound replaces our dial, which is closed.
        let mut p = pair("bob", "alice").await;
        let alice = PeerId::from_string("alice");
        let ours = p.registry.ensure(&alice).await.unwrap();
        let inbound = dial_in(&mut p).await;
        p.registry.adopt(inbound.clone());
        assert_eq!(p.registry.get(&alice).unwrap().id(), inbound.id());
        assert!(!ours.is_open());
    }
}
