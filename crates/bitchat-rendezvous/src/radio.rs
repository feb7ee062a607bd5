//! Rendezvous radio driver interface
//!
//! Models a broadcast/publish-subscribe radio stack with small per-message
//! limits: every device publishes a service whose info carries its peer id
//! and subscribes to the same service. There are no sockets and no IP —
//! sends go straight to an opaque peer handle the radio library attaches
//! to each discovered peer.

use async_trait::async_trait;
use bitchat_core::{Result, TransportState};
use tokio::sync::mpsc;

// ----------------------------------------------------------------------------
// Peer Handle
// ----------------------------------------------------------------------------

/// Opaque token identifying a discovered peer within the radio session.
///
/// Handles are transport-local and unstable across rediscovery; the peer
/// id inside the service info is the durable identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerHandle(pub u64);

impl core::fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "handle-{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Radio Events
// ----------------------------------------------------------------------------

/// Events the rendezvous radio pushes up to the transport
#[derive(Debug, Clone)]
pub enum RendezvousRadioEvent {
    /// The radio stack changed availability
    StateChanged(TransportState),
    /// Subscription matched a published service
    PeerFound {
        handle: PeerHandle,
        service_info: Vec<u8>,
    },
    /// A previously found peer went away
    PeerLost { handle: PeerHandle },
    /// One radio frame arrived from a peer
    Message { handle: PeerHandle, frame: Vec<u8> },
}

/// Receiving half of the radio event stream
pub type RendezvousRadioEvents = mpsc::Receiver<RendezvousRadioEvent>;

// ----------------------------------------------------------------------------
// Radio Driver Trait
// ----------------------------------------------------------------------------

/// The operations the rendezvous transport needs from the radio stack
#[async_trait]
pub trait RendezvousRadio: Send + Sync + 'static {
    /// Current radio stack state
    async fn state(&self) -> TransportState;

    /// Publish our service with the given service info
    async fn publish(&self, service_info: Vec<u8>) -> Result<()>;

    /// Subscribe to the shared service
    async fn subscribe(&self) -> Result<()>;

    /// Send one radio frame (at most the radio's per-message limit) to a
    /// discovered peer
    async fn send(&self, handle: PeerHandle, frame: Vec<u8>) -> Result<()>;

    /// Stop publishing and subscribing
    async fn stop(&self);
}
