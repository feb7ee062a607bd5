//! Link radio driver interface
//!
//! The transport is written against this trait instead of a concrete radio
//! stack. A production driver wraps the OS short-range radio (one service
//! identifier, one characteristic supporting read, write,
//! write-without-response, and notify); tests plug in an in-memory driver.

use async_trait::async_trait;
use bitchat_core::{Result, TransportState};
use tokio::sync::mpsc;
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Device Handle
// ----------------------------------------------------------------------------

/// Opaque handle the radio stack attaches to a remote device.
///
/// Not a peer id: the same peer reconnecting gets a new handle, and a
/// handle means nothing on any other transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkDeviceId(pub u64);

impl core::fmt::Display for LinkDeviceId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "dev-{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Radio Events
// ----------------------------------------------------------------------------

/// Events the radio driver pushes up to the transport
#[derive(Debug, Clone)]
pub enum LinkRadioEvent {
    /// The radio stack changed availability
    StateChanged(TransportState),
    /// Scanning found a device advertising our service
    DeviceDiscovered { device: LinkDeviceId },
    /// A remote initiator connected to our listener
    InboundConnected { device: LinkDeviceId },
    /// A link dropped
    Disconnected { device: LinkDeviceId },
    /// One chunk arrived, via notification or characteristic write
    Data { device: LinkDeviceId, chunk: Vec<u8> },
}

/// Receiving half of the radio event stream
pub type LinkRadioEvents = mpsc::Receiver<LinkRadioEvent>;

// ----------------------------------------------------------------------------
// Radio Driver Trait
// ----------------------------------------------------------------------------

/// The operations the link transport needs from the radio stack.
///
/// All sends enqueue inside the driver; none of these calls may block on
/// airtime.
#[async_trait]
pub trait LinkRadio: Send + Sync + 'static {
    /// Current radio stack state
    async fn state(&self) -> TransportState;

    /// Begin advertising the service and scanning for it simultaneously
    async fn start(&self, service_id: Uuid, characteristic_id: Uuid) -> Result<()>;

    /// Stop advertising and scanning, dropping all links
    async fn stop(&self);

    /// Payload served to remote characteristic reads (our announce)
    async fn set_announce_payload(&self, payload: Vec<u8>);

    /// Open an initiator link to a discovered device
    async fn connect(&self, device: LinkDeviceId) -> Result<()>;

    /// Tear down one link
    async fn disconnect(&self, device: LinkDeviceId);

    /// Read the remote device's announce characteristic
    async fn read_announce(&self, device: LinkDeviceId) -> Result<Vec<u8>>;

    /// Write one chunk (at most the negotiated MTU minus protocol overhead)
    async fn write_chunk(&self, device: LinkDeviceId, chunk: Vec<u8>) -> Result<()>;

    /// Subscribe to the remote device's notifications
    async fn enable_notifications(&self, device: LinkDeviceId) -> Result<()>;

    /// Negotiated MTU for this link
    async fn mtu(&self, device: LinkDeviceId) -> usize;
}
