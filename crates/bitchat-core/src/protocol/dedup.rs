//! Packet deduplication for mesh relaying
//!
//! Every packet is identified by the tuple (sender, timestamp, type, payload
//! digest). A bounded, time-limited set of recently seen keys guarantees
//! that each distinct packet triggers at most one local delivery and one
//! relay, which is what makes retries and flooding idempotent.

use std::collections::{HashMap, VecDeque};

use crate::config::DedupConfig;
use crate::protocol::packet::BitchatPacket;
use crate::types::{PeerId, Timestamp};

// ----------------------------------------------------------------------------
// Packet Key
// ----------------------------------------------------------------------------

/// Dedup identity of a packet.
///
/// The payload is folded in as a 64-bit SHA-256 prefix; the exact digest
/// choice is not part of the wire interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketKey {
    sender: PeerId,
    timestamp: u64,
    message_type: u8,
    payload_digest: u64,
}

impl PacketKey {
    /// Compute the key of a packet
    pub fn of(packet: &BitchatPacket) -> Self {
        Self {
            sender: packet.sender_id,
            timestamp: packet.timestamp.as_millis(),
            message_type: packet.message_type.as_u8(),
            payload_digest: packet.payload_digest(),
        }
    }
}

// ----------------------------------------------------------------------------
// Statistics
// ----------------------------------------------------------------------------

/// Counters for dedup behavior
#[derive(Debug, Clone, Copy, Default)]
pub struct DedupStats {
    /// Total keys checked
    pub packets_processed: u64,
    /// Keys rejected as duplicates
    pub duplicates_detected: u64,
    /// Entries evicted for age or capacity
    pub entries_evicted: u64,
}

// ----------------------------------------------------------------------------
// Deduplication Cache
// ----------------------------------------------------------------------------

/// Bounded set of recently seen packet keys.
///
/// Entries age out after the configured TTL and the set is capped at a
/// maximum size with oldest-first eviction.
#[derive(Debug)]
pub struct DeduplicationCache {
    config: DedupConfig,
    entries: HashMap<PacketKey, Timestamp>,
    insertion_order: VecDeque<(PacketKey, Timestamp)>,
    stats: DedupStats,
}

impl DeduplicationCache {
    /// Create a cache with the given bounds
    pub fn new(config: DedupConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
            insertion_order: VecDeque::new(),
            stats: DedupStats::default(),
        }
    }

    /// Check whether `key` was already seen and remember it either way.
    /// Returns true for duplicates.
    pub fn check_and_add(&mut self, key: PacketKey, now: Timestamp) -> bool {
        self.stats.packets_processed += 1;
        self.expire(now);

        if self.entries.contains_key(&key) {
            self.stats.duplicates_detected += 1;
            return true;
        }

        self.insert(key, now);
        false
    }

    /// Remember a key without a duplicate check. Used for our own outbound
    /// packets so the router ignores its own broadcast echoing back.
    pub fn mark(&mut self, key: PacketKey, now: Timestamp) {
        self.expire(now);
        if !self.entries.contains_key(&key) {
            self.insert(key, now);
        }
    }

    /// Check without inserting
    pub fn contains(&self, key: &PacketKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Drop expired entries; called from maintenance ticks
    pub fn maintain(&mut self, now: Timestamp) {
        self.expire(now);
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no keys are remembered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Behavior counters
    pub fn stats(&self) -> DedupStats {
        self.stats
    }

    /// Forget everything (emergency wipe)
    pub fn clear(&mut self) {
        self.entries.clear();
        self.insertion_order.clear();
        self.stats = DedupStats::default();
    }

    fn insert(&mut self, key: PacketKey, now: Timestamp) {
        self.entries.insert(key, now);
        self.insertion_order.push_back((key, now));

        while self.entries.len() > self.config.max_entries {
            let Some((oldest, inserted_at)) = self.insertion_order.pop_front() else {
                break;
            };
            // The order queue can hold stale pairs for re-inserted keys;
            // only evict when the live entry is the one recorded here.
            if self.entries.get(&oldest) == Some(&inserted_at) {
                self.entries.remove(&oldest);
                self.stats.entries_evicted += 1;
            }
        }
    }

    fn expire(&mut self, now: Timestamp) {
        let ttl_ms = self.config.entry_ttl.as_millis() as u64;
        while let Some(&(key, inserted_at)) = self.insertion_order.front() {
            if now.millis_since(inserted_at) <= ttl_ms {
                break;
            }
            self.insertion_order.pop_front();
            if self.entries.get(&key) == Some(&inserted_at) {
                self.entries.remove(&key);
                self.stats.entries_evicted += 1;
            }
        }
    }
}

impl Default for DeduplicationCache {
    fn default() -> Self {
        Self::new(DedupConfig::default())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packet::MessageType;
    use core::time::Duration;

    fn key(seq: u8) -> PacketKey {
        let packet = BitchatPacket::new(
            MessageType::Message,
            PeerId::new([1; 8]),
            vec![seq],
        )
        .with_timestamp(Timestamp::new(1_000));
        PacketKey::of(&packet)
    }

    #[test]
    fn test_duplicate_detection() {
        let mut cache = DeduplicationCache::default();
        let now = Timestamp::new(10_000);

        assert!(!cache.check_and_add(key(1), now));
        assert!(cache.check_and_add(key(1), now));
        assert!(!cache.check_and_add(key(2), now));

        assert_eq!(cache.stats().packets_processed, 3);
        assert_eq!(cache.stats().duplicates_detected, 1);
    }

    #[test]
    fn test_key_distinguishes_fields() {
        let base = BitchatPacket::new(MessageType::Message, PeerId::new([1; 8]), b"x".to_vec())
            .with_timestamp(Timestamp::new(5));

        let mut other_sender = base.clone();
        other_sender.sender_id = PeerId::new([2; 8]);
        let mut other_type = base.clone();
        other_type.message_type = MessageType::Announce;
        let other_time = base.clone().with_timestamp(Timestamp::new(6));

        assert_ne!(PacketKey::of(&base), PacketKey::of(&other_sender));
        assert_ne!(PacketKey::of(&base), PacketKey::of(&other_type));
        assert_ne!(PacketKey::of(&base), PacketKey::of(&other_time));
        assert_eq!(PacketKey::of(&base), PacketKey::of(&base.clone()));
    }

    #[test]
    fn test_entries_expire() {
        let config = DedupConfig {
            max_entries: 100,
            entry_ttl: Duration::from_millis(100),
        };
        let mut cache = DeduplicationCache::new(config);

        assert!(!cache.check_and_add(key(1), Timestamp::new(0)));
        // Within TTL: still a duplicate.
        assert!(cache.check_and_add(key(1), Timestamp::new(50)));
        // Past TTL: forgotten, accepted again.
        assert!(!cache.check_and_add(key(1), Timestamp::new(500)));
    }

    #[test]
    fn test_capacity_eviction_is_oldest_first() {
        let config = DedupConfig {
            max_entries: 3,
            entry_ttl: Duration::from_secs(3600),
        };
        let mut cache = DeduplicationCache::new(config);
        let now = Timestamp::new(0);

        for seq in 1..=4 {
            cache.check_and_add(key(seq), now);
        }
        assert_eq!(cache.len(), 3);
        assert!(!cache.contains(&key(1)));
        assert!(cache.contains(&key(4)));
    }

    #[test]
    fn test_mark_suppresses_own_echo() {
        let mut cache = DeduplicationCache::default();
        let now = Timestamp::new(0);

        cache.mark(key(1), now);
        assert!(cache.check_and_add(key(1), now));
    }

    #[test]
    fn test_clear() {
        let mut cache = DeduplicationCache::default();
        cache.check_and_add(key(1), Timestamp::new(0));
        cache.clear();
        assert!(cache.is_empty());
        assert!(!cache.check_and_add(key(1), Timestamp::new(0)));
    }
}
