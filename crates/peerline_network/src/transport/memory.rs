//! In-process transport for tests and embedding.
//!
//! A [`MemoryNetwork`] is a hub that started [`MemoryTransport`]s register
//! with. Connections behave like the WebSocket ones: both ends see
//! `Opened`, frames arrive in order, and closing either end reports
//! `Closed` on both.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use super::{
    Connection, ConnectionId, Direction, OUTBOUND_BUFFER, Outgoing, Transport, TransportEvent,
};
use crate::error::NetworkError;
use crate::identity::PeerId;

/// Shared hub connecting [`MemoryTransport`]s.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    nodes: Arc<Mutex<HashMap<PeerId, mpsc::Sender<TransportEvent>>>>,
    links: Arc<Mutex<Vec<Arc<Link>>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport for `local` on this network. It becomes reachable
    /// once started.
    pub fn attach(&self, local: PeerId, events: mpsc::Sender<TransportEvent>) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            local,
            events,
        }
    }

    /// Take `peer` off the network and close every connection it has.
    pub fn detach(&self, peer: &PeerId) {
        self.nodes.lock().remove(peer);
        let mut links = self.links.lock();
        links.retain(|link| !link.torn_down.load(Ordering::Acquire));
        for link in links.iter() {
            for end in &link.ends {
                if &end.owner == peer {
                    end.open.store(false, Ordering::Release);
                    let _ = end.outbound.try_send(Outgoing::Close);
                }
            }
        }
        debug!("Detached {peer} from memory network");
    }

    pub fn is_attached(&self, peer: &PeerId) -> bool {
        self.nodes.lock().contains_key(peer)
    }
}

/// One end of a link, seen from its owner.
struct End {
    owner: PeerId,
    remote: PeerId,
    id: ConnectionId,
    events: mpsc::Sender<TransportEvent>,
    open: Arc<AtomicBool>,
    outbound: mpsc::Sender<Outgoing>,
}

struct Link {
    ends: [End; 2],
    torn_down: AtomicBool,
}

impl Link {
    async fn tear_down(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        for end in &self.ends {
            end.open.store(false, Ordering::Release);
            let _ = end.outbound.try_send(Outgoing::Close);
            let _ = end
                .events
                .send(TransportEvent::Closed {
                    peer: end.remote.clone(),
                    connection: end.id,
                })
                .await;
        }
    }

    /// Forward frames written on `ends[from]` to the other end's owner.
    async fn pump(self: Arc<Self>, from: usize, mut rx: mpsc::Receiver<Outgoing>) {
        let to = 1 - from;
        while let Some(out) = rx.recv().await {
            match out {
                Outgoing::Text(text) => {
                    let event = TransportEvent::Data {
                        peer: self.ends[from].owner.clone(),
                        connection: self.ends[to].id,
                        text,
                    };
                    if self.ends[to].events.send(event).await.is_err() {
                        break;
                    }
                }
                Outgoing::Close => break,
            }
        }
        self.tear_down().await;
    }
}

/// A node's handle on a [`MemoryNetwork`].
pub struct MemoryTransport {
    network: MemoryNetwork,
    local: PeerId,
    events: mpsc::Sender<TransportEvent>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn start(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), NetworkError> {
        self.network
            .nodes
            .lock()
            .insert(self.local.clone(), self.events.clone());
        debug!("{} attached to memory network", self.local);

        let network = self.network.clone();
        let local = self.local.clone();
        tokio::spawn(async move {
            let _ = shutdown.recv().await;
            network.detach(&local);
        });
        Ok(())
    }

    async fn connect(&self, peer: &PeerId) -> Result<Connection, NetworkError> {
        if peer == &self.local {
            return Err(NetworkError::SelfConnect);
        }
        let remote_events = self
            .network
            .nodes
            .lock()
            .get(peer)
            .cloned()
            .ok_or_else(|| NetworkError::PeerUnavailable(peer.clone()))?;

        let (local_tx, local_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (remote_tx, remote_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let local_open = Arc::new(AtomicBool::new(true));
        let remote_open = Arc::new(AtomicBool::new(true));

        let outbound = Connection::new(
            peer.clone(),
            Direction::Outbound,
            local_tx.clone(),
            Arc::clone(&local_open),
        );
        let inbound = Connection::new(
            self.local.clone(),
            Direction::Inbound,
            remote_tx.clone(),
            Arc::clone(&remote_open),
        );

        let link = Arc::new(Link {
            ends: [
                End {
                    owner: self.local.clone(),
                    remote: peer.clone(),
                    id: outbound.id(),
                    events: self.events.clone(),
                    open: local_open,
                    outbound: local_tx,
                },
                End {
                    owner: peer.clone(),
                    remote: self.local.clone(),
                    id: inbound.id(),
                    events: remote_events.clone(),
                    open: remote_open,
                    outbound: remote_tx,
                },
            ],
            torn_down: AtomicBool::new(false),
        });
        self.network.links.lock().push(Arc::clone(&link));
        tokio::spawn(Arc::clone(&link).pump(0, local_rx));
        tokio::spawn(link.pump(1, remote_rx));

        remote_events
            .send(TransportEvent::Opened(inbound))
            .await
            .map_err(|_| NetworkError::PeerUnavailable(peer.clone()))?;
        let _ = self.events.send(TransportEvent::Opened(outbound.clone())).await;
        debug!("{} -> {peer}: memory link {} open", self.local, outbound.id());
        Ok(outbound)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
