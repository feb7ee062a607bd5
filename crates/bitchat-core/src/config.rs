//! Centralized Configuration Management
//!
//! This module consolidates the configuration structures used throughout the
//! BitChat core so the protocol constants live in one place. Each struct
//! carries the production defaults plus a `testing()` preset that shrinks
//! timing so integration tests run deterministically.

use core::time::Duration;

use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Policy Constants
// ----------------------------------------------------------------------------

/// Maximum chat message length in characters; longer content is rejected
/// locally before framing.
pub const MAX_MESSAGE_LENGTH: usize = 2_000;

// ----------------------------------------------------------------------------
// Session Configuration
// ----------------------------------------------------------------------------

/// Noise session lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Messages in either direction before a session needs renegotiation
    pub rekey_message_count: u64,
    /// Established lifetime before a session needs renegotiation
    pub rekey_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            rekey_message_count: 1_000_000,
            rekey_interval: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl SessionConfig {
    /// Preset with tiny thresholds so rekey paths are exercisable in tests
    pub fn testing() -> Self {
        Self {
            rekey_message_count: 8,
            rekey_interval: Duration::from_millis(250),
        }
    }
}

// ----------------------------------------------------------------------------
// Deduplication Configuration
// ----------------------------------------------------------------------------

/// Bounded dedup set configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Maximum number of remembered packet keys
    pub max_entries: usize,
    /// How long a packet key stays remembered
    pub entry_ttl: Duration,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            entry_ttl: Duration::from_secs(120),
        }
    }
}

impl DedupConfig {
    /// Preset with a small set so eviction is exercisable in tests
    pub fn testing() -> Self {
        Self {
            max_entries: 16,
            entry_ttl: Duration::from_millis(100),
        }
    }
}

// ----------------------------------------------------------------------------
// Mesh Configuration
// ----------------------------------------------------------------------------

/// Mesh routing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Maximum number of hops a path trace may record before the packet is
    /// dropped instead of relayed
    pub max_route_hops: usize,
    /// Dedup set parameters
    pub dedup: DedupConfig,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            max_route_hops: 10,
            dedup: DedupConfig::default(),
        }
    }
}

impl MeshConfig {
    /// Preset for tests
    pub fn testing() -> Self {
        Self {
            max_route_hops: 10,
            dedup: DedupConfig::testing(),
        }
    }
}

// ----------------------------------------------------------------------------
// Link Transport Configuration
// ----------------------------------------------------------------------------

/// Short-range link transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Service identifier advertised and scanned for
    pub service_id: uuid::Uuid,
    /// The single characteristic carrying all traffic
    pub characteristic_id: uuid::Uuid,
    /// Per-peer MTU negotiation target
    pub target_mtu: usize,
    /// Maximum concurrent initiator links
    pub max_initiator_links: usize,
    /// Minimum spacing between connection attempts to the same device
    pub min_connect_interval: Duration,
    /// Minimum spacing between announce broadcasts
    pub min_announce_interval: Duration,
    /// Maintenance tick period
    pub maintenance_interval: Duration,
    /// Peers unseen for this long are evicted
    pub peer_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            service_id: uuid::uuid!("f47b5e2d-4a9e-4c5a-9b3f-8e1d2c3a4b5c"),
            characteristic_id: uuid::uuid!("a1b2c3d4-e5f6-4a5b-8c9d-0e1f2a3b4c5d"),
            target_mtu: 512,
            max_initiator_links: 7,
            min_connect_interval: Duration::from_secs(2),
            min_announce_interval: Duration::from_secs(5),
            maintenance_interval: Duration::from_secs(15),
            peer_timeout: Duration::from_secs(120),
        }
    }
}

impl LinkConfig {
    /// Preset with fast ticks for tests
    pub fn testing() -> Self {
        Self {
            min_connect_interval: Duration::from_millis(10),
            min_announce_interval: Duration::from_millis(20),
            maintenance_interval: Duration::from_millis(50),
            peer_timeout: Duration::from_millis(400),
            ..Self::default()
        }
    }
}

// ----------------------------------------------------------------------------
// Rendezvous Transport Configuration
// ----------------------------------------------------------------------------

/// Rendezvous-radio transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RendezvousConfig {
    /// Hard per-frame limit of the underlying radio
    pub max_radio_frame: usize,
    /// Incomplete reassembly buffers time out after this long
    pub reassembly_timeout: Duration,
    /// Maintenance tick period
    pub maintenance_interval: Duration,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            max_radio_frame: 255,
            reassembly_timeout: Duration::from_secs(30),
            maintenance_interval: Duration::from_secs(10),
        }
    }
}

impl RendezvousConfig {
    /// Preset with fast ticks for tests
    pub fn testing() -> Self {
        Self {
            reassembly_timeout: Duration::from_millis(200),
            maintenance_interval: Duration::from_millis(50),
            ..Self::default()
        }
    }
}

// ----------------------------------------------------------------------------
// Selector Configuration
// ----------------------------------------------------------------------------

/// Transport selector arbitration thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorConfig {
    /// Battery percentage below which the link transport is preferred for
    /// reachable peers
    pub low_battery_threshold: u8,
    /// Payload size above which the rendezvous transport is preferred for
    /// connected peers
    pub large_payload_threshold: usize,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            low_battery_threshold: 15,
            large_payload_threshold: 200,
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol_constants() {
        let link = LinkConfig::default();
        assert_eq!(link.target_mtu, 512);
        assert_eq!(link.max_initiator_links, 7);
        assert_eq!(link.peer_timeout, Duration::from_secs(120));

        let mesh = MeshConfig::default();
        assert_eq!(mesh.max_route_hops, 10);
        assert_eq!(mesh.dedup.max_entries, 10_000);

        let selector = SelectorConfig::default();
        assert_eq!(selector.low_battery_threshold, 15);
        assert_eq!(selector.large_payload_threshold, 200);
    }

    #[test]
    fn test_testing_presets_shrink_timing() {
        assert!(LinkConfig::testing().peer_timeout < LinkConfig::default().peer_timeout);
        assert!(DedupConfig::testing().entry_ttl < DedupConfig::default().entry_ttl);
    }
}
