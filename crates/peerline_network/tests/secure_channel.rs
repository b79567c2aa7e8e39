//! End-to-end tests: two full nodes over the in-memory and WebSocket
//! transports.

use std::sync::Arc;
use std::time::{Duration, Instant};

use peerline_network::{
    ChatNode, DecodeStatus, IdentityManager, InboundPacket, KeyAgreement, MemoryNetwork,
    NetworkConfig, NodeProfile, PacketType, PeerId, PresenceStatus, SecureCodec, packet_handler,
};
use tokio::sync::mpsc;

fn profile(id: &str) -> NodeProfile {
    NodeProfile::new(PeerId::from_string(id), id.to_uppercase())
}

fn collect(node: &ChatNode) -> mpsc::UnboundedReceiver<InboundPacket> {
    let (tx, rx) = mpsc::unbounded_channel();
    node.on_content(packet_handler(move |packet| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(packet);
        }
    }));
    rx
}

async fn next(rx: &mut mpsc::UnboundedReceiver<InboundPacket>) -> InboundPacket {
    tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("timed out waiting for packet")
        .expect("handler channel closed")
}

async fn memory_pair(config: NetworkConfig) -> (MemoryNetwork, ChatNode, ChatNode) {
    let network = MemoryNetwork::new();
    let mut alice = ChatNode::with_memory_transport(profile("alice"), config.clone(), &network);
    let mut bob = ChatNode::with_memory_transport(profile("bob"), config, &network);
    alice.start().await.unwrap();
    bob.start().await.unwrap();
    (network, alice, bob)
}

#[tokio::test]
async fn alice_and_bob_exchange_hello() {
    let (_network, alice, bob) = memory_pair(NetworkConfig::loopback()).await;
    let mut inbox = collect(&bob);
    let alice_id = PeerId::from_string("alice");
    let bob_id = PeerId::from_string("bob");

    let sent = alice.send_text(&bob_id, "hello").await.unwrap();

    assert!(alice.wait_secured(&bob_id, Duration::from_secs(2)).await);
    assert!(bob.wait_secured(&alice_id, Duration::from_secs(2)).await);

    let packet = next(&mut inbox).await;
    assert_eq!(packet.from, alice_id);
    assert_eq!(packet.envelope.packet_type, PacketType::Text);
    assert_eq!(packet.envelope.data, "hello");
    assert_eq!(packet.envelope.id, sent.id);
    assert_eq!(packet.decode, DecodeStatus::Decrypted);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(inbox.try_recv().is_err(), "hello must be delivered exactly once");

    assert_eq!(
        alice.safety_number(&bob_id).unwrap(),
        bob.safety_number(&alice_id).unwrap()
    );
}

#[tokio::test]
async fn replies_flow_over_the_inbound_connection() {
    let (_network, alice, bob) = memory_pair(NetworkConfig::loopback()).await;
    let mut alice_inbox = collect(&alice);
    let alice_id = PeerId::from_string("alice");
    let bob_id = PeerId::from_string("bob");

    alice.send_text(&bob_id, "ping").await.unwrap();
    assert!(bob.wait_secured(&alice_id, Duration::from_secs(2)).await);
    assert_eq!(bob.connected_peers(), vec![alice_id.clone()]);

    bob.send_text(&alice_id, "pong ✓").await.unwrap();
    let reply = next(&mut alice_inbox).await;
    assert_eq!(reply.envelope.data, "pong ✓");
    assert_eq!(reply.decode, DecodeStatus::Decrypted);
}

#[tokio::test]
async fn concurrent_sends_to_new_peer_all_arrive() {
    let (_network, alice, bob) = memory_pair(NetworkConfig::loopback()).await;
    let alice = Arc::new(alice);
    let mut inbox = collect(&bob);
    let bob_id = PeerId::from_string("bob");

    let sends: Vec<_> = (0..5)
        .map(|i| {
            let alice = Arc::clone(&alice);
            let bob_id = bob_id.clone();
            tokio::spawn(async move { alice.send_text(&bob_id, format!("msg-{i}")).await })
        })
        .collect();
    for send in sends {
        send.await.unwrap().unwrap();
    }

    let mut bodies = Vec::new();
    for _ in 0..5 {
        let packet = next(&mut inbox).await;
        assert_eq!(packet.decode, DecodeStatus::Decrypted);
        bodies.push(packet.envelope.data);
    }
    bodies.sort();
    assert_eq!(bodies, vec!["msg-0", "msg-1", "msg-2", "msg-3", "msg-4"]);
    assert_eq!(alice.connected_peers(), vec![bob_id]);
}

#[tokio::test]
async fn media_is_sealed_like_text() {
    let mut config = NetworkConfig::loopback();
    config.require_encryption = true;
    let (_network, alice, bob) = memory_pair(config).await;
    let mut inbox = collect(&bob);
    let bob_id = PeerId::from_string("bob");

    let photo = "data:image/jpeg;base64,/9j/4AAQSkZJRgABAQ==";
    let sent = alice.send_media(&bob_id, photo).await.unwrap();
    assert_eq!(sent.packet_type, PacketType::Media);

    let packet = next(&mut inbox).await;
    assert_eq!(packet.envelope.packet_type, PacketType::Media);
    assert_eq!(packet.envelope.data, photo);
    assert_eq!(packet.envelope.id, sent.id);
    assert_eq!(packet.decode, DecodeStatus::Decrypted);
}

#[tokio::test]
async fn required_encryption_still_delivers_after_handshake() {
    let mut config = NetworkConfig::loopback();
    config.require_encryption = true;
    let (_network, alice, bob) = memory_pair(config).await;
    let mut inbox = collect(&bob);

    alice
        .send_text(&PeerId::from_string("bob"), "confidential")
        .await
        .unwrap();
    let packet = next(&mut inbox).await;
    assert_eq!(packet.envelope.data, "confidential");
    assert_eq!(packet.decode, DecodeStatus::Decrypted);
}

#[tokio::test]
async fn probe_of_nonexistent_peer_is_false_within_timeout() {
    let (_network, alice, _bob) = memory_pair(NetworkConfig::loopback()).await;

    let started = Instant::now();
    let reachable = alice
        .probe_with_timeout(&PeerId::from_string("nonexistent-peer"), Duration::from_millis(1000))
        .await;
    assert!(!reachable);
    assert!(started.elapsed() < Duration::from_millis(1500));

    assert!(!alice.probe(&PeerId::from_string("alice")).await);
    assert!(alice.probe(&PeerId::from_string("bob")).await);
}

#[tokio::test]
async fn peer_going_away_closes_connection() {
    let (_network, alice, mut bob) = memory_pair(NetworkConfig::loopback()).await;
    let (tx, mut presence) = mpsc::unbounded_channel();
    alice.on_presence(packet_handler(move |packet| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(packet);
        }
    }));

    let bob_id = PeerId::from_string("bob");
    assert!(alice.probe(&bob_id).await);
    assert!(bob
        .wait_secured(&PeerId::from_string("alice"), Duration::from_secs(2))
        .await);

    bob.stop().await;

    let notice = tokio::time::timeout(Duration::from_secs(2), presence.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(notice.envelope.sender.status, PresenceStatus::Offline);

    let deadline = Instant::now() + Duration::from_secs(2);
    while !alice.connected_peers().is_empty() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(alice.connected_peers().is_empty());
    assert!(!alice.probe_with_timeout(&bob_id, Duration::from_millis(300)).await);
}

#[tokio::test]
async fn restarted_peer_gets_messages_under_its_new_key() {
    let config = NetworkConfig::loopback();
    let (network, alice, mut bob) = memory_pair(config.clone()).await;
    let mut alice_inbox = collect(&alice);
    let alice_id = PeerId::from_string("alice");
    let bob_id = PeerId::from_string("bob");

    let mut inbox = collect(&bob);
    alice.send_text(&bob_id, "first").await.unwrap();
    assert_eq!(next(&mut inbox).await.decode, DecodeStatus::Decrypted);
    let old_number = alice.safety_number(&bob_id).unwrap();

    bob.stop().await;
    let deadline = Instant::now() + Duration::from_secs(2);
    while (network.is_attached(&bob_id) || !alice.connected_peers().is_empty())
        && Instant::now() < deadline
    {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!network.is_attached(&bob_id));

    // Same id, fresh identity.
    let mut bob = ChatNode::with_memory_transport(profile("bob"), config, &network);
    let mut inbox = collect(&bob);
    bob.start().await.unwrap();

    for round in 0..3 {
        let text = format!("after restart {round}");
        alice.send_text(&bob_id, text.clone()).await.unwrap();
        let packet = next(&mut inbox).await;
        assert_eq!(packet.decode, DecodeStatus::Decrypted);
        assert_eq!(packet.envelope.data, text);
    }
    assert_ne!(alice.safety_number(&bob_id).unwrap(), old_number);
    assert_eq!(
        alice.safety_number(&bob_id).unwrap(),
        bob.safety_number(&alice_id).unwrap()
    );

    bob.send_text(&alice_id, "back again").await.unwrap();
    let reply = next(&mut alice_inbox).await;
    assert_eq!(reply.envelope.data, "back again");
    assert_eq!(reply.decode, DecodeStatus::Decrypted);
}

#[tokio::test]
async fn websocket_loopback_end_to_end() {
    let mut bob = ChatNode::new(profile("bob"), NetworkConfig::loopback());
    bob.start().await.unwrap();
    let mut inbox = collect(&bob);
    let bob_addr = bob.local_addr().unwrap();

    let mut config = NetworkConfig::loopback();
    config.known_peers.insert("bob".to_string(), bob_addr.to_string());
    let mut alice = ChatNode::new(profile("alice"), config);
    alice.start().await.unwrap();

    let started = Instant::now();
    assert!(
        !alice
            .probe_with_timeout(&PeerId::from_string("nonexistent-peer"), Duration::from_millis(1000))
            .await
    );
    assert!(started.elapsed() < Duration::from_millis(1500));

    let bob_id = PeerId::from_string("bob");
    alice.send_text(&bob_id, "hello over ws").await.unwrap();
    let packet = next(&mut inbox).await;
    assert_eq!(packet.from, PeerId::from_string("alice"));
    assert_eq!(packet.envelope.data, "hello over ws");
    assert_eq!(packet.decode, DecodeStatus::Decrypted);

    alice.stop().await;
    bob.stop().await;
}

#[tokio::test]
async fn payload_for_another_peer_is_undecryptable() {
    let identities: Vec<_> = (0..3).map(|_| Arc::new(IdentityManager::new())).collect();
    let publics: Vec<_> = identities
        .iter()
        .map(|id| id.generate_identity().unwrap())
        .collect();
    let keys: Vec<_> = identities
        .iter()
        .map(|id| Arc::new(KeyAgreement::new(Arc::clone(id))))
        .collect();
    let (alice, bob, carol) = (
        PeerId::from_string("alice"),
        PeerId::from_string("bob"),
        PeerId::from_string("carol"),
    );

    keys[0].import_peer_key(&bob, &publics[1]);
    keys[2].import_peer_key(&alice, &publics[0]);

    let wire = SecureCodec::new(Arc::clone(&keys[0]))
        .seal(&bob, "for bob only")
        .unwrap()
        .into_wire();
    let opened = SecureCodec::new(Arc::clone(&keys[2])).open(&alice, &wire);
    assert_eq!(opened.status(), DecodeStatus::Undecryptable);
    assert_eq!(opened.into_text(), wire);

    let unknown = SecureCodec::new(Arc::clone(&keys[1]));
    assert_eq!(unknown.seal(&carol, "clear").unwrap().into_wire(), "clear");
    assert_eq!(unknown.open_text(&carol, "clear"), "clear");
}
