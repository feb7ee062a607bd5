//! BitChat packet model
//!
//! Defines the unit of mesh transmission and its associated type and flag
//! bytes. The binary framing lives in [`crate::protocol::wire`].

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::{BitchatError, PacketError, Result};
use crate::identity::IdentityKeyPair;
use crate::types::{PeerId, Timestamp, Ttl};

// ----------------------------------------------------------------------------
// Protocol Constants
// ----------------------------------------------------------------------------

/// Protocol version 1 (14-byte header, u16 payload length)
pub const PROTOCOL_VERSION_1: u8 = 1;

/// Protocol version 2 (16-byte header, u32 payload length, routing trace)
pub const PROTOCOL_VERSION_2: u8 = 2;

/// Fixed header size for version 1
pub const HEADER_SIZE_V1: usize = 14;

/// Fixed header size for version 2
pub const HEADER_SIZE_V2: usize = 16;

/// Upper bound on the payload-length field (10 MiB)
pub const MAX_PAYLOAD_SIZE: usize = 10 * 1024 * 1024;

/// Hop count limit the wire format can carry
pub const MAX_ROUTE_WIRE_HOPS: usize = 255;

// ----------------------------------------------------------------------------
// Message Types
// ----------------------------------------------------------------------------

/// Message types for the wire protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Peer presence broadcast
    Announce = 0x01,
    /// Public chat message
    Message = 0x02,
    /// Graceful peer departure
    Leave = 0x03,
    /// Noise XX handshake frame
    NoiseHandshake = 0x10,
    /// Container for all encrypted payloads
    NoiseEncrypted = 0x11,
    /// Large message fragmentation (handled by a collaborator)
    Fragment = 0x20,
    /// Mesh state synchronization request (handled by a collaborator)
    RequestSync = 0x21,
    /// File transfer protocol (handled by a collaborator)
    FileTransfer = 0x22,
}

impl MessageType {
    /// Convert from raw byte value
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(MessageType::Announce),
            0x02 => Ok(MessageType::Message),
            0x03 => Ok(MessageType::Leave),
            0x10 => Ok(MessageType::NoiseHandshake),
            0x11 => Ok(MessageType::NoiseEncrypted),
            0x20 => Ok(MessageType::Fragment),
            0x21 => Ok(MessageType::RequestSync),
            0x22 => Ok(MessageType::FileTransfer),
            _ => Err(BitchatError::InvalidPacket(
                PacketError::UnknownMessageType {
                    message_type: value,
                },
            )),
        }
    }

    /// Convert to raw byte value
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

// ----------------------------------------------------------------------------
// Noise Payload Sub-Types
// ----------------------------------------------------------------------------

/// First byte of a decrypted NOISE_ENCRYPTED payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum NoisePayloadType {
    /// Encrypted private chat message
    PrivateMessage = 0x01,
    /// Read receipt for a message id
    ReadReceipt = 0x02,
    /// Delivery confirmation for a message id
    Delivered = 0x03,
    /// Out-of-band verification challenge
    VerifyChallenge = 0x10,
    /// Out-of-band verification response
    VerifyResponse = 0x11,
}

impl NoisePayloadType {
    /// Convert from raw byte value
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(NoisePayloadType::PrivateMessage),
            0x02 => Some(NoisePayloadType::ReadReceipt),
            0x03 => Some(NoisePayloadType::Delivered),
            0x10 => Some(NoisePayloadType::VerifyChallenge),
            0x11 => Some(NoisePayloadType::VerifyResponse),
            _ => None,
        }
    }

    /// Convert to raw byte value
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

// ----------------------------------------------------------------------------
// Packet Flags
// ----------------------------------------------------------------------------

/// Flags controlling optional packet fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketFlags(u8);

impl PacketFlags {
    /// No optional fields present
    pub const NONE: Self = Self(0x00);

    /// Recipient ID field is present
    pub const HAS_RECIPIENT: u8 = 0x01;

    /// Signature field is present
    pub const HAS_SIGNATURE: u8 = 0x02;

    /// Payload is compressed with zlib
    pub const IS_COMPRESSED: u8 = 0x04;

    /// Routing trace is present (version 2 only)
    pub const HAS_ROUTE: u8 = 0x08;

    /// Relay-suppression-response marker
    pub const IS_RSR: u8 = 0x10;

    /// Create flags from raw byte
    pub const fn new(value: u8) -> Self {
        Self(value)
    }

    /// Get raw byte value
    pub const fn as_u8(self) -> u8 {
        self.0
    }

    pub const fn has_recipient(self) -> bool {
        (self.0 & Self::HAS_RECIPIENT) != 0
    }

    pub const fn has_signature(self) -> bool {
        (self.0 & Self::HAS_SIGNATURE) != 0
    }

    pub const fn is_compressed(self) -> bool {
        (self.0 & Self::IS_COMPRESSED) != 0
    }

    pub const fn has_route(self) -> bool {
        (self.0 & Self::HAS_ROUTE) != 0
    }

    pub const fn is_rsr(self) -> bool {
        (self.0 & Self::IS_RSR) != 0
    }

    /// Set a flag bit
    #[must_use]
    pub const fn with(self, bit: u8) -> Self {
        Self(self.0 | bit)
    }
}

// ----------------------------------------------------------------------------
// BitChat Packet
// ----------------------------------------------------------------------------

/// The unit of mesh transmission.
///
/// Invariants: `sender_id` is always 8 bytes; `recipient_id` is either
/// absent or 8 bytes; every route hop is exactly 8 bytes; a route is only
/// present on version 2 packets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitchatPacket {
    /// Protocol version (1 or 2)
    pub version: u8,
    /// Message type
    pub message_type: MessageType,
    /// Hop budget
    pub ttl: Ttl,
    /// Creation timestamp (ms since epoch)
    pub timestamp: Timestamp,
    /// Sender peer ID (always present)
    pub sender_id: PeerId,
    /// Optional recipient peer ID; absent means broadcast
    pub recipient_id: Option<PeerId>,
    /// Ordered path trace of relaying peers (version 2 only)
    pub route: Option<Vec<PeerId>>,
    /// Opaque payload
    pub payload: Vec<u8>,
    /// Optional Ed25519 signature
    #[serde(with = "signature_serde")]
    pub signature: Option<[u8; 64]>,
    /// Relay-suppression-response marker; carried but not interpreted by
    /// the router
    pub is_rsr: bool,
}

impl BitchatPacket {
    /// Create a broadcast packet with default TTL and the current time
    pub fn new(message_type: MessageType, sender_id: PeerId, payload: Vec<u8>) -> Self {
        Self {
            version: PROTOCOL_VERSION_1,
            message_type,
            ttl: Ttl::DEFAULT,
            timestamp: Timestamp::now(),
            sender_id,
            recipient_id: None,
            route: None,
            payload,
            signature: None,
            is_rsr: false,
        }
    }

    /// Set recipient (makes this a directed packet)
    #[must_use]
    pub fn with_recipient(mut self, recipient_id: PeerId) -> Self {
        self.recipient_id = Some(recipient_id);
        self
    }

    /// Set TTL for routing
    #[must_use]
    pub fn with_ttl(mut self, ttl: Ttl) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set an explicit timestamp
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Attach a path trace; upgrades the packet to version 2
    #[must_use]
    pub fn with_route(mut self, route: Vec<PeerId>) -> Self {
        self.version = PROTOCOL_VERSION_2;
        self.route = Some(route);
        self
    }

    /// Mark as a relay-suppression response
    #[must_use]
    pub fn with_rsr(mut self) -> Self {
        self.is_rsr = true;
        self
    }

    /// Flags byte implied by the populated fields
    pub fn flags(&self) -> PacketFlags {
        let mut flags = PacketFlags::NONE;
        if self.recipient_id.is_some() {
            flags = flags.with(PacketFlags::HAS_RECIPIENT);
        }
        if self.signature.is_some() {
            flags = flags.with(PacketFlags::HAS_SIGNATURE);
        }
        if self.route.is_some() {
            flags = flags.with(PacketFlags::HAS_ROUTE);
        }
        if self.is_rsr {
            flags = flags.with(PacketFlags::IS_RSR);
        }
        flags
    }

    /// Check if this is a broadcast packet
    pub fn is_broadcast(&self) -> bool {
        match self.recipient_id {
            None => true,
            Some(id) => id.is_broadcast(),
        }
    }

    /// Check if this packet is directed at a single recipient
    pub fn is_directed(&self) -> bool {
        !self.is_broadcast()
    }

    /// True if the path trace already contains `peer`
    pub fn route_contains(&self, peer: PeerId) -> bool {
        self.route
            .as_ref()
            .map(|route| route.contains(&peer))
            .unwrap_or(false)
    }

    /// Number of hops recorded in the path trace
    pub fn route_len(&self) -> usize {
        self.route.as_ref().map(Vec::len).unwrap_or(0)
    }

    /// Validate packet structure
    pub fn validate(&self) -> Result<()> {
        if self.version != PROTOCOL_VERSION_1 && self.version != PROTOCOL_VERSION_2 {
            return Err(BitchatError::InvalidPacket(
                PacketError::UnsupportedVersion {
                    version: self.version,
                },
            ));
        }

        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(BitchatError::InvalidPacket(PacketError::PayloadTooLarge {
                actual: self.payload.len(),
                max: MAX_PAYLOAD_SIZE,
            }));
        }

        if let Some(ref route) = self.route {
            if self.version < PROTOCOL_VERSION_2 {
                return Err(BitchatError::invalid_packet(
                    "Route requires protocol version 2",
                ));
            }
            if route.len() > MAX_ROUTE_WIRE_HOPS {
                return Err(BitchatError::InvalidPacket(PacketError::RouteTooLong {
                    actual: route.len(),
                    max: MAX_ROUTE_WIRE_HOPS,
                }));
            }
        }

        Ok(())
    }

    /// Stable 64-bit digest of the payload, used in the dedup key
    pub fn payload_digest(&self) -> u64 {
        let digest = Sha256::digest(&self.payload);
        u64::from_be_bytes([
            digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
        ])
    }

    /// Sign the packet with an Ed25519 identity keypair
    pub fn sign(&mut self, identity: &IdentityKeyPair) -> Result<()> {
        let canonical = self.canonical_bytes_for_signing();
        self.signature = Some(identity.sign(canonical));
        Ok(())
    }

    /// Verify the packet's signature against an Ed25519 public key
    pub fn verify_signature(&self, public_key: &[u8; 32]) -> Result<()> {
        let signature = self
            .signature
            .ok_or_else(|| BitchatError::invalid_packet("No signature present"))?;
        let canonical = self.canonical_bytes_for_signing();
        IdentityKeyPair::verify(public_key, canonical, &signature)
    }

    /// Canonical digest for signing and verification.
    ///
    /// Excludes the signature itself plus the relay-mutable fields (TTL and
    /// route) so signatures survive store-and-forward.
    fn canonical_bytes_for_signing(&self) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(b"bitchat-packet-v1");
        hasher.update([self.version]);
        hasher.update([self.message_type.as_u8()]);
        hasher.update(self.timestamp.as_millis().to_be_bytes());
        hasher.update(self.sender_id.as_bytes());
        if let Some(recipient_id) = &self.recipient_id {
            hasher.update(recipient_id.as_bytes());
        }
        hasher.update(&self.payload);
        hasher.finalize().to_vec()
    }
}

// ----------------------------------------------------------------------------
// Custom Serde for large arrays
// ----------------------------------------------------------------------------

mod signature_serde {
    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<[u8; 64]>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(array) => serializer.serialize_some(&array[..]),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<[u8; 64]>, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::Deserialize;

        let opt_vec: Option<Vec<u8>> = Option::deserialize(deserializer)?;
        match opt_vec {
            Some(vec) => {
                if vec.len() == 64 {
                    let mut array = [0u8; 64];
                    array.copy_from_slice(&vec);
                    Ok(Some(array))
                } else {
                    Err(serde::de::Error::invalid_length(vec.len(), &"64 bytes"))
                }
            }
            None => Ok(None),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
