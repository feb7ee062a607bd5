//! BitChat node runtime
//!
//! Assembles the core engine with its transports: the node builder wires
//! identity, the shared Noise service, and the mesh processor together,
//! and the transport selector arbitrates every send between the
//! short-range link radio and the rendezvous radio.

pub mod power;
pub mod runtime;
pub mod selector;

pub use power::{FixedPowerMonitor, PowerMonitor};
pub use runtime::{BitchatNode, BitchatNodeBuilder};
pub use selector::TransportSelector;
