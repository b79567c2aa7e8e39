//! LAN peer discovery via UDP broadcast.
//!
//! The [`DiscoveryService`] periodically broadcasts an [`Announcement`] on
//! the local network and listens for announcements from other peers.
//! Discovered peers are reported through an mpsc channel and end up in the
//! [`PeerDirectory`](crate::directory::PeerDirectory).

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace, warn};

use crate::error::NetworkError;
use crate::identity::PeerId;

/// Largest announcement we accept.
const MAX_DATAGRAM: usize = 4096;

/// An announcement broadcast by a peer on the LAN.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Announcement {
    pub peer_id: PeerId,
    /// The address the peer's WebSocket server listens on.
    pub listen_addr: String,
    pub name: String,
    pub version: String,
}

/// Event emitted when a peer is discovered on the LAN.
#[derive(Debug, Clone)]
pub struct DiscoveredPeer {
    pub announcement: Announcement,
    /// The source address of the UDP packet.
    pub source_addr: SocketAddr,
}

impl DiscoveredPeer {
    /// The address to dial. A wildcard listen address (`0.0.0.0`) is
    /// replaced with the datagram's source IP.
    pub fn reachable_addr(&self) -> Option<SocketAddr> {
        let mut addr: SocketAddr = self.announcement.listen_addr.parse().ok()?;
        if addr.ip().is_unspecified() {
            addr.set_ip(self.source_addr.ip());
        }
        Some(addr)
    }
}

/// Configuration for the discovery service.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// UDP port to broadcast on and listen on.
    pub port: u16,
    /// How often to broadcast an announcement.
    pub interval: Duration,
    /// Our own announcement to broadcast.
    pub announcement: Announcement,
}

/// LAN discovery service using UDP broadcast.
pub struct DiscoveryService;

impl DiscoveryService {
    /// Start the discovery service in the background.
    ///
    /// Spawns a broadcaster and a listener; both exit when `shutdown` fires.
    /// Our own announcements are filtered out.
    pub async fn start(
        config: DiscoveryConfig,
        discovered_tx: mpsc::Sender<DiscoveredPeer>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), NetworkError> {
        let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
        let broadcast_addr = SocketAddr::from((Ipv4Addr::BROADCAST, config.port));

        let listener_socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| NetworkError::Discovery(format!("Bind failed: {e}")))?;
        listener_socket
            .set_broadcast(true)
            .map_err(|e| NetworkError::Discovery(format!("Set broadcast: {e}")))?;

        let sender_socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
            .await
            .map_err(|e| NetworkError::Discovery(format!("Sender bind: {e}")))?;
        sender_socket
            .set_broadcast(true)
            .map_err(|e| NetworkError::Discovery(format!("Set broadcast: {e}")))?;

        info!("Discovery service listening on {bind_addr}");

        let our_peer_id = config.announcement.peer_id.clone();
        let announcement_bytes = serde_json::to_vec(&config.announcement)?;
        let interval = config.interval;

        let mut shutdown_bcast = shutdown.resubscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match sender_socket.send_to(&announcement_bytes, broadcast_addr).await {
                            Ok(_) => trace!("Broadcast announcement sent"),
                            Err(e) => debug!("Broadcast send failed: {e}"),
                        }
                    }
                    _ = shutdown_bcast.recv() => {
                        debug!("Discovery broadcaster shutting down");
                        break;
                    }
                }
            }
        });

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                tokio::select! {
                    result = listener_socket.recv_from(&mut buf) => {
                        let (len, source_addr) = match result {
                            Ok(received) => received,
                            Err(e) => {
                                warn!("Discovery recv error: {e}");
                                continue;
                            }
                        };
                        let Some(announcement) = parse_announcement(&buf[..len], &our_peer_id) else {
                            continue;
                        };
                        debug!("Discovered peer {} ('{}') at {source_addr}", announcement.peer_id, announcement.name);
                        let found = DiscoveredPeer { announcement, source_addr };
                        if discovered_tx.send(found).await.is_err() {
                            break;
                        }
                    }
                    _ = shutdown.recv() => {
                        debug!("Discovery listener shutting down");
                        break;
                    }
                }
            }
        });

        Ok(())
    }
}

/// Decode a datagram, dropping our own announcements and invalid peer ids.
fn parse_announcement(bytes: &[u8], ours: &PeerId) -> Option<Announcement> {
    let announcement: Announcement = serde_json::from_slice(bytes).ok()?;
    if &announcement.peer_id == ours || PeerId::parse(announcement.peer_id.as_str()).is_err() {
        return None;
    }
    Some(announcement)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
