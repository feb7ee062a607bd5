//! End-to-end scenarios over the short-range link transport: discovery and
//! public messaging, Noise handshake plus private messaging with delivery
//! acknowledgment, and the emergency wipe.

mod support;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use bitchat_core::{
    BitchatMessage, DeliveryStatus, EventReceiver, LinkConfig, NoisePayloadType, PeerId,
    Transport, TransportEvent,
};
use bitchat_link::LinkTransport;
use bitchat_runtime::BitchatNode;
use support::{expect_event, LinkAir};

const WAIT: Duration = Duration::from_secs(3);

struct LinkNodeHarness {
    node: BitchatNode,
    events: EventReceiver,
    peer_id: PeerId,
}

async fn spawn_link_node(air: &LinkAir, id: u64, nickname: &str) -> LinkNodeHarness {
    let (mut node, events) = BitchatNode::builder().build(nickname);
    let (radio, radio_events) = air.radio(id);
    let transport = Arc::new(LinkTransport::new(
        LinkConfig::testing(),
        radio,
        radio_events,
        Arc::clone(node.processor()),
        node.event_sender(),
    ));
    node.add_transport(transport.clone());

    let runner = Arc::clone(&transport);
    tokio::spawn(async move {
        let _ = runner.run().await;
    });

    let peer_id = node.peer_id();
    LinkNodeHarness {
        node,
        events,
        peer_id,
    }
}

/// Bring two nodes into range and wait until each knows the other
async fn pair_nodes(air: &LinkAir, a: &mut LinkNodeHarness, b: &mut LinkNodeHarness) {
    // Let both transports start advertising before discovery fires.
    sleep(Duration::from_millis(100)).await;
    air.discover(1, 2);

    let b_id = b.peer_id;
    expect_event(&mut a.events, WAIT, |event| match event {
        TransportEvent::PeerConnected { peer_id, .. } if *peer_id == b_id => Some(()),
        _ => None,
    })
    .await;

    let a_id = a.peer_id;
    expect_event(&mut b.events, WAIT, |event| match event {
        TransportEvent::PeerListUpdated { peers, .. } => peers
            .iter()
            .any(|peer| peer.peer_id == a_id)
            .then_some(()),
        _ => None,
    })
    .await;
}

async fn wait_established(node: &BitchatNode, peer: PeerId) {
    for _ in 0..100 {
        if node.noise().is_established(peer) {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("session with {peer} never established");
}

#[tokio::test]
async fn s1_discovery_and_public_message() {
    let air = LinkAir::new();
    let mut a = spawn_link_node(&air, 1, "alice").await;
    let mut b = spawn_link_node(&air, 2, "bob").await;

    pair_nodes(&air, &mut a, &mut b).await;

    // Each side learned the other's id and nickname from the announce.
    let a_id = a.peer_id;
    expect_event(&mut b.events, WAIT, |event| match event {
        TransportEvent::PeerListUpdated { peers, .. } => peers
            .iter()
            .any(|peer| peer.peer_id == a_id && peer.nickname.as_deref() == Some("alice"))
            .then_some(()),
        _ => None,
    })
    .await;

    a.node.selector().send_message("hello").await.unwrap();

    let message = expect_event(&mut b.events, WAIT, |event| match event {
        TransportEvent::MessageReceived { message, from, .. } if *from == a_id => {
            Some(message.clone())
        }
        _ => None,
    })
    .await;
    assert_eq!(message.content, "hello");
    assert_eq!(message.sender, "alice");
}

#[tokio::test]
async fn s2_handshake_private_message_and_delivery_ack() {
    let air = LinkAir::new();
    let mut a = spawn_link_node(&air, 1, "alice").await;
    let mut b = spawn_link_node(&air, 2, "bob").await;
    pair_nodes(&air, &mut a, &mut b).await;

    // Three XX frames flow through the transports.
    a.node.selector().trigger_handshake(b.peer_id).await.unwrap();
    wait_established(&a.node, b.peer_id).await;
    wait_established(&b.node, a.peer_id).await;

    let message = BitchatMessage::new_private("alice", "hi", a.peer_id, "bob");
    assert_eq!(message.delivery_status, DeliveryStatus::Sending);
    a.node
        .selector()
        .send_private_message(b.peer_id, &message)
        .await
        .unwrap();

    // Bob surfaces the decrypted payload and the private message itself.
    let a_id = a.peer_id;
    let payload = expect_event(&mut b.events, WAIT, |event| match event {
        TransportEvent::NoisePayloadReceived {
            from,
            payload_type: NoisePayloadType::PrivateMessage,
            payload,
            ..
        } if *from == a_id => Some(payload.clone()),
        _ => None,
    })
    .await;
    let received = BitchatMessage::from_binary(&payload).unwrap();
    assert_eq!(received.content, "hi");
    assert!(received.is_private);

    // Bob's DELIVERED ack moves Alice's copy to Delivered.
    let expected_id = message.id.clone();
    let status = expect_event(&mut a.events, WAIT, |event| match event {
        TransportEvent::MessageDeliveryStatusChanged { message_id, status }
            if *message_id == expected_id =>
        {
            Some(status.clone())
        }
        _ => None,
    })
    .await;
    match status {
        DeliveryStatus::Delivered { to, .. } => assert_eq!(to, b.peer_id.to_string()),
        other => panic!("expected Delivered, got {other:?}"),
    }
}

#[tokio::test]
async fn s6_emergency_wipe_clears_state_and_allows_rehandshake() {
    let air = LinkAir::new();
    let mut a = spawn_link_node(&air, 1, "alice").await;
    let mut b = spawn_link_node(&air, 2, "bob").await;
    pair_nodes(&air, &mut a, &mut b).await;

    a.node.selector().trigger_handshake(b.peer_id).await.unwrap();
    wait_established(&b.node, a.peer_id).await;
    assert!(b.node.processor().router().dedup_len() > 0);

    b.node.emergency_wipe().await;

    // Peers, sessions, and dedup state are empty within one tick.
    assert_eq!(b.node.noise().session_count(), 0);
    assert_eq!(b.node.processor().router().dedup_len(), 0);
    let transports = b.node.selector().transports();
    assert!(transports[0].peer_snapshots().await.is_empty());

    // A fresh discovery and handshake succeed without any reused state.
    sleep(Duration::from_millis(50)).await;
    air.discover(1, 2);
    let b_id = b.peer_id;
    expect_event(&mut a.events, WAIT, |event| match event {
        TransportEvent::PeerConnected { peer_id, .. } if *peer_id == b_id => Some(()),
        _ => None,
    })
    .await;

    a.node.selector().trigger_handshake(b.peer_id).await.unwrap();
    wait_established(&b.node, a.peer_id).await;
    wait_established(&a.node, b.peer_id).await;
}

#[tokio::test]
async fn long_messages_chunk_across_the_link() {
    let air = LinkAir::new();
    let mut a = spawn_link_node(&air, 1, "alice").await;
    let mut b = spawn_link_node(&air, 2, "bob").await;
    pair_nodes(&air, &mut a, &mut b).await;

    // Frame lands on the 1024 padding block, above the 512-byte link MTU.
    let content = "m".repeat(900);
    a.node.selector().send_message(&content).await.unwrap();

    let a_id = a.peer_id;
    let message = expect_event(&mut b.events, WAIT, |event| match event {
        TransportEvent::MessageReceived { message, from, .. } if *from == a_id => {
            Some(message.clone())
        }
        _ => None,
    })
    .await;
    assert_eq!(message.content, content);
}

#[tokio::test]
async fn oversized_messages_rejected_by_policy() {
    let air = LinkAir::new();
    let a = spawn_link_node(&air, 1, "alice").await;

    let content = "x".repeat(2_001);
    let err = a.node.selector().send_message(&content).await.unwrap_err();
    assert!(matches!(err, bitchat_core::BitchatError::Policy { .. }));
}
