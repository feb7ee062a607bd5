//! Rendezvous-radio transport for BitChat
//!
//! A broadcast/publish-subscribe radio with ~255-byte frames: every device
//! publishes its peer id as service info, subscribes to the same service,
//! fragments packets at the radio layer, and acts as a relay by running
//! the mesh rules on everything it hears.

pub mod fragmentation;
pub mod peer;
pub mod radio;
pub mod transport;

pub use peer::RendezvousPeer;
pub use radio::{PeerHandle, RendezvousRadio, RendezvousRadioEvent, RendezvousRadioEvents};
pub use transport::RendezvousTransport;
