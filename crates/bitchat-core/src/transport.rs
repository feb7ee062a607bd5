//! Common transport contract
//!
//! Every radio transport presents the same vocabulary to the router and the
//! selector, and reports back through one event channel that stands in for
//! the host's delegate. Transports are composed behind this trait; only the
//! selector ever sees the concrete variants.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::errors::Result;
use crate::protocol::message::{BitchatMessage, DeliveryStatus};
use crate::protocol::packet::NoisePayloadType;
use crate::types::{PeerId, Timestamp};

// ----------------------------------------------------------------------------
// Transport Kind & State
// ----------------------------------------------------------------------------

/// The two concrete radio transports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    /// Short-range link transport
    Link,
    /// Rendezvous-radio transport
    Rendezvous,
}

/// Radio stack availability states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportState {
    Unknown,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
    Resetting,
}

// ----------------------------------------------------------------------------
// Peer Snapshot
// ----------------------------------------------------------------------------

/// One transport's view of one peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSnapshot {
    /// Short routing id
    pub peer_id: PeerId,
    /// Nickname learned from the peer's announce, when known
    pub nickname: Option<String>,
    /// Whether a live connection (or reachable handle) exists right now
    pub is_connected: bool,
    /// Last time the peer was heard from
    pub last_seen: Timestamp,
}

// ----------------------------------------------------------------------------
// Transport Events (delegate callbacks)
// ----------------------------------------------------------------------------

/// Events a transport reports to the host.
///
/// This is the delegate interface of the contract expressed as a channel
/// message: the router and UI consume these instead of implementing a
/// callback object.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A chat message arrived and passed dedup
    MessageReceived {
        message: BitchatMessage,
        from: PeerId,
        transport: TransportKind,
    },
    /// A peer became directly reachable
    PeerConnected {
        peer_id: PeerId,
        transport: TransportKind,
    },
    /// A peer was lost or evicted
    PeerDisconnected {
        peer_id: PeerId,
        transport: TransportKind,
    },
    /// A transport's merged peer view changed
    PeerListUpdated {
        peers: Vec<PeerSnapshot>,
        transport: TransportKind,
    },
    /// The radio stack changed availability
    TransportStateChanged {
        transport: TransportKind,
        state: TransportState,
    },
    /// A decrypted NOISE_ENCRYPTED sub-payload arrived
    NoisePayloadReceived {
        from: PeerId,
        payload_type: NoisePayloadType,
        payload: Vec<u8>,
        timestamp: Timestamp,
    },
    /// Delivery tracking for a message we sent moved forward
    MessageDeliveryStatusChanged {
        message_id: String,
        status: DeliveryStatus,
    },
}

/// Sending half of the delegate channel
pub type EventSender = mpsc::Sender<TransportEvent>;

/// Receiving half of the delegate channel
pub type EventReceiver = mpsc::Receiver<TransportEvent>;

/// Create the delegate channel with a bounded buffer
pub fn event_channel(buffer: usize) -> (EventSender, EventReceiver) {
    mpsc::channel(buffer)
}

// ----------------------------------------------------------------------------
// Transport Trait
// ----------------------------------------------------------------------------

/// The send vocabulary and observability every transport implements.
///
/// Sends enqueue internally and never block on radio I/O; failures surface
/// through [`TransportEvent`]s rather than synchronously wherever a radio
/// callback is involved.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which concrete transport this is
    fn kind(&self) -> TransportKind;

    /// Human-readable transport name
    fn name(&self) -> &'static str;

    /// Whether the radio stack is powered and usable
    async fn is_available(&self) -> bool;

    /// Current radio stack state
    async fn transport_state(&self) -> TransportState;

    /// This transport's current peer view
    async fn peer_snapshots(&self) -> Vec<PeerSnapshot>;

    /// Whether the peer can be reached at all through this transport
    async fn is_peer_reachable(&self, peer_id: PeerId) -> bool;

    /// Whether a live connection to the peer exists right now
    async fn is_peer_connected(&self, peer_id: PeerId) -> bool;

    /// Broadcast a public chat message
    async fn send_message(&self, content: &str) -> Result<()>;

    /// Send an encrypted private message
    async fn send_private_message(&self, peer_id: PeerId, message: &BitchatMessage) -> Result<()>;

    /// Confirm delivery of a message id to its sender
    async fn send_delivery_ack(&self, peer_id: PeerId, message_id: &str) -> Result<()>;

    /// Confirm reading of a message id to its sender
    async fn send_read_receipt(&self, peer_id: PeerId, message_id: &str) -> Result<()>;

    /// Broadcast our announce
    async fn send_announce(&self) -> Result<()>;

    /// Start a Noise handshake with the peer
    async fn trigger_handshake(&self, peer_id: PeerId) -> Result<()>;

    /// Send pre-encoded frame bytes to one peer
    async fn send_raw(&self, peer_id: PeerId, frame: Vec<u8>) -> Result<()>;

    /// Send pre-encoded frame bytes to everyone in range
    async fn broadcast_raw(&self, frame: Vec<u8>) -> Result<()>;

    /// Hard reset: tear down all links and forget all peer state
    async fn emergency_disconnect(&self);
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
