//! BitChat wire protocol: packets, framing, payloads, and deduplication

pub mod dedup;
pub mod message;
pub mod packet;
pub mod wire;

pub use dedup::{DeduplicationCache, PacketKey};
pub use message::{BitchatMessage, DeliveryStatus};
pub use packet::{BitchatPacket, MessageType, NoisePayloadType, PacketFlags};
pub use wire::{Compression, Padding, WireFormat};
