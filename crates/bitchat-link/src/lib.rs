//! Short-range link transport for BitChat
//!
//! Wraps a link-oriented radio stack (one advertised service, one
//! characteristic) behind the common [`bitchat_core::Transport`] contract:
//! simultaneous listener + initiator, announce exchange on link setup,
//! MTU-aware chunking below the packet layer, and periodic maintenance
//! that evicts quiet peers and re-announces.
//!
//! The OS radio is abstracted behind [`radio::LinkRadio`] so the transport
//! logic is testable with an in-memory driver.

pub mod chunking;
pub mod peer;
pub mod radio;
pub mod transport;

pub use peer::LinkPeer;
pub use radio::{LinkDeviceId, LinkRadio, LinkRadioEvent, LinkRadioEvents};
pub use transport::LinkTransport;
