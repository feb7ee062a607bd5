//! Link peer records and connection retry pacing

use std::time::{Duration, Instant};

use bitchat_core::{PeerId, PeerSnapshot, Timestamp};

use crate::radio::LinkDeviceId;

// ----------------------------------------------------------------------------
// Peer State
// ----------------------------------------------------------------------------

/// This transport's record of one peer
#[derive(Debug, Clone)]
pub struct LinkPeer {
    /// Short routing id
    pub peer_id: PeerId,
    /// The live link to the peer, when one exists
    pub device: Option<LinkDeviceId>,
    /// Nickname learned from the announce exchange
    pub nickname: Option<String>,
    /// Last time the peer was heard from
    pub last_seen: Timestamp,
    /// Last time we tried to open a link
    pub last_connection_attempt: Option<Instant>,
}

impl LinkPeer {
    /// Create a record for a newly learned peer
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            device: None,
            nickname: None,
            last_seen: Timestamp::now(),
            last_connection_attempt: None,
        }
    }

    /// Whether a live link exists
    pub fn is_connected(&self) -> bool {
        self.device.is_some()
    }

    /// Connection attempts are spaced by at least `min_interval`
    pub fn can_attempt_connection(&self, min_interval: Duration) -> bool {
        self.last_connection_attempt
            .map(|at| at.elapsed() >= min_interval)
            .unwrap_or(true)
    }

    /// Record a connection attempt starting now
    pub fn mark_connection_attempt(&mut self) {
        self.last_connection_attempt = Some(Instant::now());
    }

    /// Record traffic from the peer
    pub fn mark_seen(&mut self) {
        self.last_seen = Timestamp::now();
    }

    /// Record link establishment
    pub fn mark_connected(&mut self, device: LinkDeviceId) {
        self.device = Some(device);
        self.mark_seen();
    }

    /// Record link loss
    pub fn mark_disconnected(&mut self) {
        self.device = None;
    }

    /// Whether the peer has gone quiet past the eviction timeout
    pub fn is_stale(&self, now: Timestamp, timeout: Duration) -> bool {
        now.millis_since(self.last_seen) > timeout.as_millis() as u64
    }

    /// The merged-view sample for this peer
    pub fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            peer_id: self.peer_id,
            nickname: self.nickname.clone(),
            is_connected: self.is_connected(),
            last_seen: self.last_seen,
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
    fn test_connection_attempt_pacing() {
        let mut peer = LinkPeer::new(PeerId::new([1; 8]));
        let interval = Duration::from_secs(2);

        assert!(peer.can_attempt_connection(interval));
        peer.mark_connection_attempt();
        assert!(!peer.can_attempt_connection(interval));
        assert!(peer.can_attempt_connection(Duration::from_millis(0)));
    }

    #[test]
    fn test_staleness() {
        let mut peer = LinkPeer::new(PeerId::new([1; 8]));
        peer.last_seen = Timestamp::new(1_000);

        let timeout = Duration::from_secs(120);
        assert!(!peer.is_stale(Timestamp::new(100_000), timeout));
        assert!(peer.is_stale(Timestamp::new(200_000), timeout));
    }

    #[test]
    fn test_snapshot_reflects_connection() {
        let mut peer = LinkPeer::new(PeerId::new([1; 8]));
        assert!(!peer.snapshot().is_connected);

        peer.mark_connected(LinkDeviceId(4));
        peer.nickname = Some("bob".to_string());
        let snapshot = peer.snapshot();
        assert!(snapshot.is_connected);
        assert_eq!(snapshot.nickname.as_deref(), Some("bob"));

        peer.mark_disconnected();
        assert!(!peer.snapshot().is_connected);
    }
}
