//! BitChat Core Protocol Implementation
//!
//! This crate is the headless engine of the BitChat peer-to-peer encrypted
//! mesh messenger: no servers, no IP routing, just devices within radio
//! range discovering each other, agreeing on authenticated sessions, and
//! hopping chat messages peer to peer.
//!
//! ## Architecture Overview
//!
//! The workspace follows a clean separation across crates:
//!
//! ### bitchat-core: The Headless Engine
//!
//! Everything protocol-shaped lives here, with no knowledge of any radio
//! stack or user interface:
//!
//! - **Wire codec**: [`protocol::wire`] frames packets with optional
//!   compression, padding, signing, and routing trace
//! - **Identity**: [`identity`] holds the static keypair and peer id
//!   derivation
//! - **Noise engine**: [`noise`] implements the XX handshake, transport
//!   ciphers, and replay defense
//! - **Mesh rules**: [`mesh`] implements TTL-bounded store-and-forward
//!   with deduplication and path tracing
//! - **Transport contract**: [`transport`] is the vocabulary every radio
//!   transport speaks
//!
//! ### Transport Crates: The Radio Connectors
//!
//! `bitchat-link` (short-range link radio) and `bitchat-rendezvous`
//! (broadcast rendezvous radio) implement [`transport::Transport`] over
//! pluggable radio drivers.
//!
//! ### bitchat-runtime: The Conductor
//!
//! Builds the node, arbitrates sends between transports, and exposes the
//! merged peer view.
//!
//! ## Usage
//!
//! ```rust
//! use bitchat_core::{LocalIdentity, PeerId};
//!
//! let identity = LocalIdentity::ephemeral("alice");
//! let peer_id: PeerId = identity.peer_id();
//! println!("our routing id: {peer_id}");
//!
//! // Any external peer id string collapses to the wire form.
//! let short = PeerId::to_short("noise:0000000000000000000000000000000000000000000000000000000000000000");
//! assert_eq!(short.as_bytes().len(), 8);
//! ```

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod errors;
pub mod identity;
pub mod mesh;
pub mod noise;
pub mod protocol;
pub mod transport;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::{
    DedupConfig, LinkConfig, MeshConfig, RendezvousConfig, SelectorConfig, SessionConfig,
    MAX_MESSAGE_LENGTH,
};
pub use errors::{BitchatError, BitchatResult, NoiseError, PacketError, Result, SessionError};
pub use identity::{IdentityKeyPair, IdentityStore, LocalIdentity, MemoryIdentityStore, NoiseKeyPair};
pub use mesh::{MeshDisposition, MeshEffect, MeshProcessor, MeshRouter};
pub use noise::{NoiseService, SessionState};
pub use protocol::{BitchatMessage, BitchatPacket, DeliveryStatus, MessageType, NoisePayloadType};
pub use transport::{
    event_channel, EventReceiver, EventSender, PeerSnapshot, Transport, TransportEvent,
    TransportKind, TransportState,
};
pub use types::{Fingerprint, PeerId, SystemTimeSource, TimeSource, Timestamp, Ttl};
