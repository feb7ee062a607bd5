//! Core types for the BitChat protocol
//!
//! This module defines the fundamental types used throughout the protocol,
//! using newtype patterns for semantic validation and type safety.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::PacketError;

// ----------------------------------------------------------------------------
// Peer Identifier
// ----------------------------------------------------------------------------

/// Address-space prefixes accepted in external peer id strings.
///
/// Only the 8-byte short form ever appears on the wire; these prefixes exist
/// for out-of-band identifiers handed to us by collaborators.
pub const PEER_ID_PREFIXES: &[&str] = &["mesh:", "name:", "noise:", "nostr:", "nostr_"];

/// Unique identifier for a peer: the first 8 bytes of SHA-256 of the peer's
/// static public key, rendered as 16 hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId([u8; 8]);

impl PeerId {
    /// Special broadcast peer ID (all 0xFF)
    pub const BROADCAST: Self = Self([0xFF; 8]);

    /// Create a new PeerId from 8 bytes
    pub const fn new(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Create PeerId from the first 8 bytes of a longer identifier
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut id = [0u8; 8];
        let len = core::cmp::min(bytes.len(), 8);
        id[..len].copy_from_slice(&bytes[..len]);
        Self(id)
    }

    /// Derive the routing id from a static public key.
    ///
    /// The derivation is `SHA-256(public_key)[0..8]` and is stable across
    /// implementations.
    pub fn from_public_key<T: AsRef<[u8]>>(public_key: T) -> Self {
        let digest = Sha256::digest(public_key.as_ref());
        Self::from_bytes(&digest)
    }

    /// Collapse any external peer id string form to the short routing id.
    ///
    /// Accepts the bare 16-hex short form, the 64-hex full public key (which
    /// is re-derived), and any of the [`PEER_ID_PREFIXES`] wrappings of
    /// either. Any other body is hashed so the mapping stays deterministic.
    pub fn to_short(s: &str) -> Self {
        let body = PEER_ID_PREFIXES
            .iter()
            .find_map(|prefix| s.strip_prefix(prefix))
            .unwrap_or(s);

        if body.len() == 16 {
            if let Ok(bytes) = hex::decode(body) {
                return Self::from_bytes(&bytes);
            }
        }
        if body.len() == 64 {
            if let Ok(bytes) = hex::decode(body) {
                return Self::from_public_key(&bytes);
            }
        }
        Self::from_public_key(body.as_bytes())
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Check for the broadcast id
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for PeerId {
    type Err = PacketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        if s.len() != 16 {
            return Err(PacketError::InvalidSenderId);
        }
        let bytes = hex::decode(s).map_err(|_| PacketError::InvalidSenderId)?;
        Ok(Self::from_bytes(&bytes))
    }
}

// ----------------------------------------------------------------------------
// Fingerprint
// ----------------------------------------------------------------------------

/// SHA-256 fingerprint of a peer's static public key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Create a new fingerprint from 32 bytes
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Compute the fingerprint of a public key
    pub fn of<T: AsRef<[u8]>>(public_key: T) -> Self {
        let digest = Sha256::digest(public_key.as_ref());
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Create a PeerId from this fingerprint (first 8 bytes)
    pub fn to_peer_id(&self) -> PeerId {
        PeerId::from_bytes(&self.0)
    }

    /// Human-readable short form for out-of-band verification: the first 16
    /// hex characters, uppercase, grouped 4-4-4-4.
    pub fn formatted(&self) -> String {
        let hex = hex::encode_upper(&self.0[..8]);
        format!("{} {} {} {}", &hex[0..4], &hex[4..8], &hex[8..12], &hex[12..16])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Millisecond timestamp since Unix epoch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Create a new timestamp
    pub const fn new(millis: u64) -> Self {
        Self(millis)
    }

    /// Get the current wall-clock timestamp
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_millis() as u64)
    }

    /// Get the raw milliseconds
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Milliseconds elapsed since `earlier`, saturating at zero
    pub fn millis_since(&self, earlier: Timestamp) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

// ----------------------------------------------------------------------------
// Time-to-Live (TTL)
// ----------------------------------------------------------------------------

/// Time-to-live hop budget for packet routing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ttl(u8);

impl Ttl {
    /// Default TTL for new packets
    pub const DEFAULT: Self = Self(7);

    /// Create a new TTL
    pub const fn new(value: u8) -> Self {
        Self(value)
    }

    /// Get the raw value
    pub fn value(&self) -> u8 {
        self.0
    }

    /// True when the hop budget is spent
    pub fn is_expired(&self) -> bool {
        self.0 == 0
    }

    /// Decrement TTL, returning None once the budget is spent
    pub fn decrement(self) -> Option<Self> {
        if self.0 > 0 {
            Some(Self(self.0 - 1))
        } else {
            None
        }
    }
}

impl Default for Ttl {
    fn default() -> Self {
        Self::DEFAULT
    }
}

// ----------------------------------------------------------------------------
// Time Source Trait
// ----------------------------------------------------------------------------

/// Trait for providing timestamps so that session timing is testable.
pub trait TimeSource: Send + Sync {
    /// Get the current timestamp
    fn now(&self) -> Timestamp;
}

/// Wall-clock implementation of TimeSource
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_from_bytes() {
        let bytes = [1, 2, 3, 4, 5, 6, 7, 8];
        let peer_id = PeerId::new(bytes);
        assert_eq!(peer_id.as_bytes(), &bytes);

        let from_long = PeerId::from_bytes(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        assert_eq!(from_long.as_bytes(), &bytes);
    }

    #[test]
    fn test_peer_id_derivation_is_stable() {
        let key = [7u8; 32];
        let a = PeerId::from_public_key(key);
        let b = PeerId::from_public_key(key);
        assert_eq!(a, b);
        assert_eq!(a, Fingerprint::of(key).to_peer_id());
    }

    #[test]
    fn test_peer_id_to_short_forms() {
        let key = [42u8; 32];
        let short = PeerId::from_public_key(key);
        let short_hex = short.to_string();
        let full_hex = hex::encode(key);

        assert_eq!(PeerId::to_short(&short_hex), short);
        assert_eq!(PeerId::to_short(&full_hex), short);
        assert_eq!(PeerId::to_short(&format!("mesh:{short_hex}")), short);
        assert_eq!(PeerId::to_short(&format!("noise:{full_hex}")), short);
        assert_eq!(PeerId::to_short(&format!("nostr_{full_hex}")), short);

        // Non-hex bodies still collapse deterministically.
        assert_eq!(PeerId::to_short("name:alice"), PeerId::to_short("name:alice"));
    }

    #[test]
    fn test_peer_id_parse() {
        let id: PeerId = "abcdef1234567890".parse().unwrap();
        assert_eq!(id.to_string(), "abcdef1234567890");

        let prefixed: PeerId = "0xabcdef1234567890".parse().unwrap();
        assert_eq!(prefixed, id);

        assert!("tooshort".parse::<PeerId>().is_err());
        assert!("zzzzzzzzzzzzzzzz".parse::<PeerId>().is_err());
    }

    #[test]
    fn test_fingerprint_formatting() {
        let fp = Fingerprint::new([0xAB; 32]);
        assert_eq!(fp.formatted(), "ABAB ABAB ABAB ABAB");
        assert_eq!(fp.to_peer_id().as_bytes(), &[0xAB; 8]);
    }

    #[test]
    fn test_ttl() {
        let mut ttl = Ttl::new(2);
        assert!(!ttl.is_expired());

        ttl = ttl.decrement().unwrap();
        ttl = ttl.decrement().unwrap();
        assert!(ttl.is_expired());
        assert!(ttl.decrement().is_none());
    }

    #[test]
    fn test_timestamp_since() {
        let early = Timestamp::new(1_000);
        let late = Timestamp::new(3_500);
        assert_eq!(late.millis_since(early), 2_500);
        assert_eq!(early.millis_since(late), 0);
    }
}
