//! ChatNode — top-level coordinator for the channel subsystem.
//!
//! [`ChatNode`] owns one instance of every component and drives them from a
//! single event loop:
//! - transport events (connection open, data, close)
//! - handshake dispatch on every opened connection
//! - packet routing to the application handlers
//! - LAN discovery feeding the peer directory

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::directory::PeerDirectory;
use crate::discovery::{Announcement, DiscoveredPeer, DiscoveryConfig, DiscoveryService};
use crate::error::NetworkError;
use crate::identity::{IdentityManager, NodeProfile, PeerId, PresenceStatus};
use crate::keys::{ChannelState, KeyAgreement};
use crate::message::Envelope;
use crate::registry::ConnectionRegistry;
use crate::router::{PacketHandler, PacketRouter, SendPolicy};
use crate::transport::{
    Direction, MemoryNetwork, Transport, TransportEvent, WsTransport,
};

/// Capacity of the transport event channel.
const EVENT_BUFFER: usize = 256;

/// A chat participant on the mesh.
///
/// Create one per process. Call [`start()`](ChatNode::start) before sending.
pub struct ChatNode {
    profile: NodeProfile,
    config: NetworkConfig,
    identity: Arc<IdentityManager>,
    keys: Arc<KeyAgreement>,
    directory: Arc<PeerDirectory>,
    transport: Arc<dyn Transport>,
    registry: ConnectionRegistry,
    router: Arc<PacketRouter>,
    events_rx: Option<mpsc::Receiver<TransportEvent>>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    running: bool,
}

impl ChatNode {
    /// Create a node served over WebSocket at `config.listen_addr`.
    pub fn new(profile: NodeProfile, config: NetworkConfig) -> Self {
        let directory = Arc::new(PeerDirectory::from_known_peers(&config.known_peers));
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let transport = WsTransport::new(
            profile.peer_id.clone(),
            config.listen_addr,
            Arc::clone(&directory),
            events_tx,
        );
        Self::assemble(profile, config, directory, Arc::new(transport), events_rx)
    }

    /// Create a node attached to an in-process network.
    pub fn with_memory_transport(
        profile: NodeProfile,
        config: NetworkConfig,
        network: &MemoryNetwork,
    ) -> Self {
        let directory = Arc::new(PeerDirectory::from_known_peers(&config.known_peers));
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let transport = network.attach(profile.peer_id.clone(), events_tx);
        Self::assemble(profile, config, directory, Arc::new(transport), events_rx)
    }

    fn assemble(
        profile: NodeProfile,
        config: NetworkConfig,
        directory: Arc<PeerDirectory>,
        transport: Arc<dyn Transport>,
        events_rx: mpsc::Receiver<TransportEvent>,
    ) -> Self {
        let identity = Arc::new(IdentityManager::new());
        let keys = Arc::new(KeyAgreement::new(Arc::clone(&identity)));
        let registry = ConnectionRegistry::new(
            profile.peer_id.clone(),
            Arc::clone(&transport),
            config.connection_timeout,
        );
        let router = Arc::new(PacketRouter::new(
            profile.clone(),
            Arc::clone(&identity),
            Arc::clone(&keys),
            registry.clone(),
            SendPolicy {
                handshake_wait: config.handshake_wait,
                require_encryption: config.require_encryption,
            },
        ));

        Self {
            profile,
            config,
            identity,
            keys,
            directory,
            transport,
            registry,
            router,
            events_rx: Some(events_rx),
            shutdown_tx: None,
            running: false,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.profile.peer_id
    }

    pub fn profile(&self) -> &NodeProfile {
        &self.profile
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn directory(&self) -> &Arc<PeerDirectory> {
        &self.directory
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// The bound listen address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }

    /// Our exported public key, once started.
    pub fn public_key(&self) -> Option<String> {
        self.identity.public_key()
    }

    pub fn on_content(&self, handler: PacketHandler) {
        self.router.on_content(handler);
    }

    pub fn on_presence(&self, handler: PacketHandler) {
        self.router.on_presence(handler);
    }

    pub fn on_call_offer(&self, handler: PacketHandler) {
        self.router.on_call_offer(handler);
    }

    /// Start the node: generate the key pair, start the transport, the
    /// event loop and (if enabled) discovery.
    ///
    /// Fails with [`NetworkError::CryptoUnavailable`] if no key pair can be
    /// generated; the node does not run without one.
    pub async fn start(&mut self) -> Result<(), NetworkError> {
        if self.running {
            return Ok(());
        }
        PeerId::parse(self.profile.peer_id.as_str())?;
        if self.events_rx.is_none() {
            return Err(NetworkError::Transport("A stopped node cannot be restarted".into()));
        }

        self.identity.generate_identity()?;

        let (shutdown_tx, _) = broadcast::channel(8);
        self.transport.start(shutdown_tx.subscribe()).await?;

        let Some(events_rx) = self.events_rx.take() else {
            return Err(NetworkError::NotRunning);
        };
        tokio::spawn(Self::event_loop(
            events_rx,
            Arc::clone(&self.router),
            self.registry.clone(),
            shutdown_tx.subscribe(),
        ));

        if self.config.discovery_enabled {
            self.start_discovery(&shutdown_tx).await;
        }

        self.shutdown_tx = Some(shutdown_tx);
        self.running = true;
        info!(
            "ChatNode '{}' started (peer_id: {})",
            self.profile.name, self.profile.peer_id
        );
        Ok(())
    }

    async fn start_discovery(&self, shutdown_tx: &broadcast::Sender<()>) {
        let listen_addr = self
            .transport
            .local_addr()
            .unwrap_or(self.config.listen_addr);
        let discovery_config = DiscoveryConfig {
            port: self.config.discovery_port,
            interval: self.config.discovery_interval,
            announcement: Announcement {
                peer_id: self.profile.peer_id.clone(),
                listen_addr: listen_addr.to_string(),
                name: self.profile.name.clone(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };

        let (discovered_tx, discovered_rx) = mpsc::channel(64);
        match DiscoveryService::start(discovery_config, discovered_tx, shutdown_tx.subscribe()).await
        {
            Ok(()) => {
                tokio::spawn(Self::handle_discoveries(
                    discovered_rx,
                    Arc::clone(&self.directory),
                ));
            }
            Err(e) => warn!("Discovery start failed (non-fatal): {e}"),
        }
    }

    /// Stop the node: tell open peers we are going offline, stop background
    /// tasks and close every connection.
    pub async fn stop(&mut self) {
        if !self.running {
            return;
        }

        if let Ok(offline) =
            Envelope::presence(PresenceStatus::Offline, self.profile.public_info()).to_json()
        {
            for peer in self.registry.connected_peers() {
                if let Some(conn) = self.registry.get(&peer) {
                    if let Err(e) = conn.send_text(offline.clone()).await {
                        debug!("Offline notice to {peer} failed: {e}");
                    }
                }
            }
        }

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.registry.close_all();

        self.running = false;
        info!("ChatNode '{}' stopped", self.profile.name);
    }

    fn ensure_running(&self) -> Result<(), NetworkError> {
        if self.running {
            Ok(())
        } else {
            Err(NetworkError::NotRunning)
        }
    }

    /// Send an envelope to `peer`, sealing content when the channel is
    /// secured.
    pub async fn send(&self, peer: &PeerId, envelope: Envelope) -> Result<(), NetworkError> {
        self.ensure_running()?;
        self.router.send(peer, envelope).await
    }

    /// Send a text message. Returns the plaintext envelope as sent, for the
    /// caller to record.
    pub async fn send_text(
        &self,
        peer: &PeerId,
        body: impl Into<String>,
    ) -> Result<Envelope, NetworkError> {
        let envelope = Envelope::text(body, self.profile.public_info());
        self.send(peer, envelope.clone()).await?;
        Ok(envelope)
    }

    /// Send a media message. `data_url` is the whole `data:` URL; it is
    /// sealed like any other content.
    pub async fn send_media(
        &self,
        peer: &PeerId,
        data_url: impl Into<String>,
    ) -> Result<Envelope, NetworkError> {
        let envelope = Envelope::media(data_url, self.profile.public_info());
        self.send(peer, envelope.clone()).await?;
        Ok(envelope)
    }

    pub async fn send_typing(&self, peer: &PeerId) -> Result<(), NetworkError> {
        self.send(peer, Envelope::typing(self.profile.public_info()))
            .await
    }

    /// Send a call offer over the peer's channel.
    pub async fn send_call_offer(
        &self,
        peer: &PeerId,
        offer: impl Into<String>,
    ) -> Result<Envelope, NetworkError> {
        let envelope = Envelope::call_offer(offer, self.profile.public_info());
        self.send(peer, envelope.clone()).await?;
        Ok(envelope)
    }

    /// Check that `peer` is reachable within the configured probe timeout.
    pub async fn probe(&self, peer: &PeerId) -> bool {
        self.probe_with_timeout(peer, self.config.probe_timeout)
            .await
    }

    pub async fn probe_with_timeout(&self, peer: &PeerId, timeout: Duration) -> bool {
        if !self.running {
            return false;
        }
        self.registry.probe(peer, timeout).await
    }

    /// Forget a contact: close its connection and purge its key material.
    pub fn remove_contact(&self, peer: &PeerId) -> bool {
        let closed = self.registry.remove(peer);
        let purged = self.keys.remove_peer(peer);
        if closed || purged {
            info!("Removed contact {peer}");
        }
        closed || purged
    }

    pub fn channel_state(&self, peer: &PeerId) -> ChannelState {
        self.keys.channel_state(peer)
    }

    pub fn safety_number(&self, peer: &PeerId) -> Option<String> {
        self.keys.safety_number(peer)
    }

    /// Wait until the channel to `peer` is secured.
    pub async fn wait_secured(&self, peer: &PeerId, timeout: Duration) -> bool {
        self.keys.wait_secured(peer, timeout).await
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.registry.connected_peers()
    }

    // -----------------------------------------------------------------------
    // Internal tasks
    // -----------------------------------------------------------------------

    /// Main event loop. Events are handled one at a time, which keeps each
    /// connection's frames in arrival order.
    async fn event_loop(
        mut events_rx: mpsc::Receiver<TransportEvent>,
        router: Arc<PacketRouter>,
        registry: ConnectionRegistry,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                event = events_rx.recv() => {
                    let Some(event) = event else { break };
                    match event {
                        TransportEvent::Opened(conn) => {
                            if conn.direction() == Direction::Inbound {
                                registry.adopt(conn.clone());
                            }
                            if let Err(e) = router.send_handshake(&conn).await {
                                warn!("Handshake to {} failed: {e}", conn.peer());
                            }
                        }
                        TransportEvent::Data { peer, connection, text } => {
                            let routed = router.handle_inbound(&peer, connection, &text).await;
                            debug!("Routed packet from {peer}: {routed:?}");
                        }
                        TransportEvent::Closed { peer, connection } => {
                            registry.handle_closed(&peer, connection);
                            router.connection_closed(&peer, connection);
                        }
                    }
                }

                _ = shutdown.recv() => {
                    debug!("Event loop shutting down");
                    break;
                }
            }
        }
    }

    /// Record LAN announcements in the peer directory.
    async fn handle_discoveries(
        mut discovered_rx: mpsc::Receiver<DiscoveredPeer>,
        directory: Arc<PeerDirectory>,
    ) {
        while let Some(found) = discovered_rx.recv().await {
            directory.record_discovery(&found);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_node(network: &MemoryNetwork, id: &str) -> ChatNode {
        ChatNode::with_memory_transport(
            NodeProfile::new(PeerId::from_string(id), id),
            NetworkConfig::loopback(),
            network,
        )
    }

    #[test]
    fn test_node_creation() {
        let node = memory_node(&MemoryNetwork::new(), "test-node");
        assert!(!node.is_running());
        assert_eq!(node.peer_id().as_str(), "test-node");
        assert!(node.public_key().is_none());
    }

    #[tokio::test]
    async fn test_send_when_not_running() {
        let node = memory_node(&MemoryNetwork::new(), "stopped-node");
        let result = node.send_text(&PeerId::from_string("bob"), "hi").await;
        assert!(matches!(result, Err(NetworkError::NotRunning)));
        assert!(!node.probe(&PeerId::from_string("bob")).await);
    }

    #[tokio::test]
    async fn test_node_start_stop() {
        let network = MemoryNetwork::new();
        let mut node = memory_node(&network, "lifecycle-node");

        node.start().await.unwrap();
        assert!(node.is_running());
        assert!(node.public_key().is_some());
        assert!(network.is_attached(node.peer_id()));

        // Starting again is a no-op and keeps the same key pair.
        let key = node.public_key();
        node.start().await.unwrap();
        assert_eq!(node.public_key(), key);

        node.stop().await;
        assert!(!node.is_running());
        assert!(node.start().await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_profile_id_refused() {
        let mut node = memory_node(&MemoryNetwork::new(), "bad id");
        assert!(matches!(
            node.start().await,
            Err(NetworkError::InvalidPeerId(_))
        ));
    }

    #[tokio::test]
    async fn test_ws_node_reports_bound_addr() {
        let mut node = ChatNode::new(
            NodeProfile::new(PeerId::from_string("ws-node"), "ws"),
            NetworkConfig::loopback(),
        );
        assert!(node.local_addr().is_none());
        node.start().await.unwrap();
        let addr = node.local_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
        node.stop().await;
    }

    #[tokio::test]
    async fn test_remove_contact_purges_key() {
        let network = MemoryNetwork::new();
        let mut alice = memory_node(&network, "alice");
        let mut bob = memory_node(&network, "bob");
        alice.start().await.unwrap();
        bob.start().await.unwrap();

        let bob_id = PeerId::from_string("bob");
        assert!(alice.probe(&bob_id).await);
        assert!(alice.wait_secured(&bob_id, Duration::from_secs(2)).await);
        assert!(alice.safety_number(&bob_id).is_some());

        assert!(alice.remove_contact(&bob_id));
        assert!(!alice.channel_state(&bob_id).is_secured());
        assert!(alice.connected_peers().is_empty());

        alice.stop().await;
        bob.stop().await;
    }
}
