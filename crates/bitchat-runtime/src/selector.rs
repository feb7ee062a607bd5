//! Transport selector
//!
//! Holds the concrete transports and presents the same send vocabulary.
//! Every directed send is arbitrated to exactly one transport by payload
//! size, peer reachability, and device power state; broadcasts fan one
//! encoded frame out to every available transport so the mesh sees a
//! single packet identity.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use bitchat_core::mesh::MeshProcessor;
use bitchat_core::{
    BitchatError, BitchatMessage, NoiseService, PeerId, PeerSnapshot, Result, SelectorConfig,
    Transport, TransportKind,
};

use crate::power::PowerMonitor;

// ----------------------------------------------------------------------------
// Transport Selector
// ----------------------------------------------------------------------------

/// Arbitrates per-message between the link and rendezvous transports
pub struct TransportSelector {
    transports: Vec<Arc<dyn Transport>>,
    power: Arc<dyn PowerMonitor>,
    processor: Arc<MeshProcessor>,
    config: SelectorConfig,
}

impl TransportSelector {
    /// Create an empty selector; add transports as the host builds them
    pub fn new(
        power: Arc<dyn PowerMonitor>,
        processor: Arc<MeshProcessor>,
        config: SelectorConfig,
    ) -> Self {
        Self {
            transports: Vec::new(),
            power,
            processor,
            config,
        }
    }

    /// Register a transport
    pub fn add_transport(&mut self, transport: Arc<dyn Transport>) {
        self.transports.push(transport);
    }

    /// All registered transports
    pub fn transports(&self) -> &[Arc<dyn Transport>] {
        &self.transports
    }

    /// The single session manager shared across transports: a session
    /// established over one transport is usable over another.
    pub fn noise_service(&self) -> Arc<NoiseService> {
        Arc::clone(self.processor.noise())
    }

    fn by_kind(&self, kind: TransportKind) -> Option<&Arc<dyn Transport>> {
        self.transports
            .iter()
            .find(|transport| transport.kind() == kind)
    }

    /// Pick exactly one transport for a directed send of `data_len` bytes
    /// to `peer_id`.
    pub async fn select_for(
        &self,
        peer_id: PeerId,
        data_len: usize,
    ) -> Option<Arc<dyn Transport>> {
        let link = self.by_kind(TransportKind::Link);
        let rendezvous = self.by_kind(TransportKind::Rendezvous);

        // 1. Critically low battery prefers the low-power link radio.
        if let Some(battery) = self.power.battery_percent() {
            if battery > 0 && battery < self.config.low_battery_threshold {
                if let Some(link) = link {
                    if link.is_peer_reachable(peer_id).await {
                        debug!(peer = %peer_id, battery, "selector: low battery, using link");
                        return Some(Arc::clone(link));
                    }
                }
            }
        }

        // 2. Large payloads prefer the rendezvous radio when connected.
        if data_len > self.config.large_payload_threshold {
            if let Some(rendezvous) = rendezvous {
                if rendezvous.is_peer_connected(peer_id).await {
                    return Some(Arc::clone(rendezvous));
                }
            }
        }

        // 3. A connected rendezvous peer wins outright.
        if let Some(rendezvous) = rendezvous {
            if rendezvous.is_peer_connected(peer_id).await {
                return Some(Arc::clone(rendezvous));
            }
        }

        // 4. Then a reachable link peer.
        if let Some(link) = link {
            if link.is_peer_reachable(peer_id).await {
                return Some(Arc::clone(link));
            }
        }

        // 5. Any transport that can reach the peer at all.
        for transport in &self.transports {
            if transport.is_peer_reachable(peer_id).await {
                return Some(Arc::clone(transport));
            }
        }

        // 6. Fall back to the link transport (which will broadcast), or to
        //    whatever is registered when no link radio exists.
        link.cloned().or_else(|| self.transports.first().cloned())
    }

    // ------------------------------------------------------------------
    // Send vocabulary
    // ------------------------------------------------------------------

    /// Broadcast a public chat message to every available transport.
    ///
    /// The frame is built once so all transports carry the same packet
    /// identity and dedup collapses the copies in the mesh.
    pub async fn send_message(&self, content: &str) -> Result<BitchatMessage> {
        let (message, frame) = self.processor.make_message_frame(content)?;
        self.fan_out(frame).await;
        Ok(message)
    }

    /// Broadcast our announce to every available transport
    pub async fn send_announce(&self) -> Result<()> {
        let frame = self.processor.make_announce_frame()?;
        self.fan_out(frame).await;
        Ok(())
    }

    /// Broadcast our departure
    pub async fn send_leave(&self) -> Result<()> {
        let frame = self.processor.make_leave_frame()?;
        self.fan_out(frame).await;
        Ok(())
    }

    /// Send an encrypted private message over the selected transport
    pub async fn send_private_message(
        &self,
        peer_id: PeerId,
        message: &BitchatMessage,
    ) -> Result<()> {
        let frame = self.processor.make_private_message_frame(peer_id, message)?;
        self.send_selected(peer_id, frame).await
    }

    /// Send a delivery acknowledgment
    pub async fn send_delivery_ack(&self, peer_id: PeerId, message_id: &str) -> Result<()> {
        let frame = self.processor.make_delivery_ack_frame(peer_id, message_id)?;
        self.send_selected(peer_id, frame).await
    }

    /// Send a read receipt
    pub async fn send_read_receipt(&self, peer_id: PeerId, message_id: &str) -> Result<()> {
        let frame = self.processor.make_read_receipt_frame(peer_id, message_id)?;
        self.send_selected(peer_id, frame).await
    }

    /// Start a Noise handshake with the peer
    pub async fn trigger_handshake(&self, peer_id: PeerId) -> Result<()> {
        let frame = self.processor.make_handshake_frame(peer_id)?;
        self.send_selected(peer_id, frame).await
    }

    /// Send pre-encoded frame bytes to a peer over the selected transport
    pub async fn send_raw(&self, peer_id: PeerId, frame: Vec<u8>) -> Result<()> {
        self.send_selected(peer_id, frame).await
    }

    async fn send_selected(&self, peer_id: PeerId, frame: Vec<u8>) -> Result<()> {
        let transport = self
            .select_for(peer_id, frame.len())
            .await
            .ok_or_else(|| BitchatError::channel_error("no transports registered"))?;
        debug!(peer = %peer_id, transport = transport.name(), len = frame.len(), "selector send");
        transport.send_raw(peer_id, frame).await
    }

    async fn fan_out(&self, frame: Vec<u8>) {
        for transport in &self.transports {
            if transport.is_available().await {
                if let Err(err) = transport.broadcast_raw(frame.clone()).await {
                    debug!(transport = transport.name(), error = %err, "broadcast leg failed");
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Merged peer view
    // ------------------------------------------------------------------

    /// Union of every transport's peer snapshots, keyed by peer id. The
    /// same peer on two transports is a single entry preferring the
    /// connected or more recent sample.
    pub async fn merged_peer_snapshots(&self) -> Vec<PeerSnapshot> {
        let mut merged: HashMap<PeerId, PeerSnapshot> = HashMap::new();
        for transport in &self.transports {
            for snapshot in transport.peer_snapshots().await {
                match merged.get_mut(&snapshot.peer_id) {
                    Some(existing) => {
                        if snapshot.nickname.is_some() && existing.nickname.is_none() {
                            existing.nickname = snapshot.nickname.clone();
                        }
                        existing.is_connected |= snapshot.is_connected;
                        existing.last_seen = existing.last_seen.max(snapshot.last_seen);
                    }
                    None => {
                        merged.insert(snapshot.peer_id, snapshot);
                    }
                }
            }
        }
        merged.into_values().collect()
    }

    /// Hard reset: every transport drops its links and peers, all sessions
    /// are torn down, and the dedup set is emptied.
    pub async fn emergency_disconnect(&self) {
        for transport in &self.transports {
            transport.emergency_disconnect().await;
        }
        self.processor.noise().clear();
        self.processor.router().clear();
    }
}

impl core::fmt::Debug for TransportSelector {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TransportSelector")
            .field("transports", &self.transports.len())
            .finish_non_exhaustive()
    }
}
