//! Transport selector arbitration rules
//!
//! Each send picks exactly one transport from battery level, payload
//! size, and peer visibility, in the documented priority order.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use bitchat_core::{
    BitchatMessage, PeerId, PeerSnapshot, Result, SelectorConfig, Timestamp, Transport,
    TransportKind, TransportState,
};
use bitchat_runtime::{BitchatNode, FixedPowerMonitor, TransportSelector};

// ----------------------------------------------------------------------------
// Stub Transport
// ----------------------------------------------------------------------------

/// A transport whose peer visibility is set directly by the test
struct StubTransport {
    kind: TransportKind,
    reachable: Mutex<HashSet<PeerId>>,
    connected: Mutex<HashSet<PeerId>>,
}

impl StubTransport {
    fn new(kind: TransportKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            reachable: Mutex::new(HashSet::new()),
            connected: Mutex::new(HashSet::new()),
        })
    }

    fn set_reachable(&self, peer: PeerId) {
        self.reachable.lock().unwrap().insert(peer);
    }

    fn set_connected(&self, peer: PeerId) {
        self.reachable.lock().unwrap().insert(peer);
        self.connected.lock().unwrap().insert(peer);
    }
}

#[async_trait]
impl Transport for StubTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn name(&self) -> &'static str {
        match self.kind {
            TransportKind::Link => "stub-link",
            TransportKind::Rendezvous => "stub-rendezvous",
        }
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn transport_state(&self) -> TransportState {
        TransportState::PoweredOn
    }

    async fn peer_snapshots(&self) -> Vec<PeerSnapshot> {
        let connected = self.connected.lock().unwrap().clone();
        self.reachable
            .lock()
            .unwrap()
            .iter()
            .map(|&peer_id| PeerSnapshot {
                peer_id,
                nickname: None,
                is_connected: connected.contains(&peer_id),
                last_seen: Timestamp::now(),
            })
            .collect()
    }

    async fn is_peer_reachable(&self, peer_id: PeerId) -> bool {
        self.reachable.lock().unwrap().contains(&peer_id)
    }

    async fn is_peer_connected(&self, peer_id: PeerId) -> bool {
        self.connected.lock().unwrap().contains(&peer_id)
    }

    async fn send_message(&self, _content: &str) -> Result<()> {
        Ok(())
    }

    async fn send_private_message(&self, _peer_id: PeerId, _message: &BitchatMessage) -> Result<()> {
        Ok(())
    }

    async fn send_delivery_ack(&self, _peer_id: PeerId, _message_id: &str) -> Result<()> {
        Ok(())
    }

    async fn send_read_receipt(&self, _peer_id: PeerId, _message_id: &str) -> Result<()> {
        Ok(())
    }

    async fn send_announce(&self) -> Result<()> {
        Ok(())
    }

    async fn trigger_handshake(&self, _peer_id: PeerId) -> Result<()> {
        Ok(())
    }

    async fn send_raw(&self, _peer_id: PeerId, _frame: Vec<u8>) -> Result<()> {
        Ok(())
    }

    async fn broadcast_raw(&self, _frame: Vec<u8>) -> Result<()> {
        Ok(())
    }

    async fn emergency_disconnect(&self) {}
}

// ----------------------------------------------------------------------------
// Harness
// ----------------------------------------------------------------------------

struct SelectorHarness {
    selector: TransportSelector,
    link: Arc<StubTransport>,
    rendezvous: Arc<StubTransport>,
}

fn harness(battery: Option<u8>) -> SelectorHarness {
    let (node, _events) = BitchatNode::builder().build("tester");
    let power = match battery {
        Some(percent) => FixedPowerMonitor::at(percent),
        None => FixedPowerMonitor::unknown(),
    };

    let mut selector = TransportSelector::new(
        Arc::new(power),
        Arc::clone(node.processor()),
        SelectorConfig::default(),
    );
    let link = StubTransport::new(TransportKind::Link);
    let rendezvous = StubTransport::new(TransportKind::Rendezvous);
    selector.add_transport(link.clone());
    selector.add_transport(rendezvous.clone());

    SelectorHarness {
        selector,
        link,
        rendezvous,
    }
}

fn peer() -> PeerId {
    PeerId::new([9; 8])
}

async fn selected_kind(harness: &SelectorHarness, data_len: usize) -> TransportKind {
    harness
        .selector
        .select_for(peer(), data_len)
        .await
        .expect("a transport is always selected")
        .kind()
}

// ----------------------------------------------------------------------------
// Rules
// ----------------------------------------------------------------------------

#[tokio::test]
async fn low_battery_prefers_reachable_link() {
    let h = harness(Some(10));
    h.link.set_reachable(peer());
    h.rendezvous.set_connected(peer());

    assert_eq!(selected_kind(&h, 50).await, TransportKind::Link);
}

#[tokio::test]
async fn large_payload_prefers_connected_rendezvous() {
    let h = harness(Some(80));
    h.link.set_connected(peer());
    h.rendezvous.set_connected(peer());

    assert_eq!(selected_kind(&h, 500).await, TransportKind::Rendezvous);
}

#[tokio::test]
async fn connected_rendezvous_beats_reachable_link() {
    let h = harness(None);
    h.link.set_reachable(peer());
    h.rendezvous.set_connected(peer());

    assert_eq!(selected_kind(&h, 50).await, TransportKind::Rendezvous);
}

#[tokio::test]
async fn large_payload_uses_link_when_only_link_reaches() {
    let h = harness(None);
    h.link.set_reachable(peer());

    assert_eq!(selected_kind(&h, 500).await, TransportKind::Link);
}

#[tokio::test]
async fn any_reachable_transport_beats_fallback() {
    let h = harness(None);
    // Rendezvous merely reachable (not connected): rules 1-4 all miss.
    h.rendezvous.set_reachable(peer());

    assert_eq!(selected_kind(&h, 50).await, TransportKind::Rendezvous);
}

#[tokio::test]
async fn unreachable_peer_falls_back_to_link_broadcast() {
    let h = harness(None);
    assert_eq!(selected_kind(&h, 50).await, TransportKind::Link);
}

#[tokio::test]
async fn low_battery_without_link_reach_uses_rendezvous() {
    let h = harness(Some(5));
    h.rendezvous.set_connected(peer());

    assert_eq!(selected_kind(&h, 50).await, TransportKind::Rendezvous);
}

#[tokio::test]
async fn battery_zero_does_not_trigger_low_power_rule() {
    // The low-battery rule applies strictly between 0 and the threshold.
    let h = harness(Some(0));
    h.link.set_reachable(peer());
    h.rendezvous.set_connected(peer());

    assert_eq!(selected_kind(&h, 50).await, TransportKind::Rendezvous);
}

// ----------------------------------------------------------------------------
// Merged peer view
// ----------------------------------------------------------------------------

#[tokio::test]
async fn merged_snapshots_collapse_peers_across_transports() {
    let h = harness(None);
    h.link.set_reachable(peer());
    h.rendezvous.set_connected(peer());

    let merged = h.selector.merged_peer_snapshots().await;
    assert_eq!(merged.len(), 1);
    // The connected sample wins.
    assert!(merged[0].is_connected);
}
