//! Rendezvous peer records

use bitchat_core::{PeerId, PeerSnapshot, Timestamp};

use crate::radio::PeerHandle;

/// This transport's record of one peer
#[derive(Debug, Clone)]
pub struct RendezvousPeer {
    /// Short routing id, learned from the service info
    pub peer_id: PeerId,
    /// The radio's token for the peer while it stays discovered
    pub handle: Option<PeerHandle>,
    /// Nickname learned from the peer's announce
    pub nickname: Option<String>,
    /// Last time the peer was heard from
    pub last_seen: Timestamp,
}

impl RendezvousPeer {
    /// Create a record for a newly discovered peer
    pub fn new(peer_id: PeerId, handle: PeerHandle) -> Self {
        Self {
            peer_id,
            handle: Some(handle),
            nickname: None,
            last_seen: Timestamp::now(),
        }
    }

    /// Whether the radio still holds a handle for the peer
    pub fn is_connected(&self) -> bool {
        self.handle.is_some()
    }

    /// Record traffic from the peer
    pub fn mark_seen(&mut self) {
        self.last_seen = Timestamp::now();
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let mut peer = RendezvousPeer::new(PeerId::new([2; 8]), PeerHandle(1));
        peer.nickname = Some("carol".to_string());

        let snapshot = peer.snapshot();
        assert!(snapshot.is_connected);
        assert_eq!(snapshot.nickname.as_deref(), Some("carol"));

        peer.handle = None;
        assert!(!peer.snapshot().is_connected);
    }
}
