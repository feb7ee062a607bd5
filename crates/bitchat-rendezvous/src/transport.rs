//! Rendezvous-radio transport
//!
//! Broadcast-only radio model: every device publishes its peer id,
//! subscribes to the same service, and relays for everyone else. This
//! transport therefore runs the full mesh rules locally on every packet it
//! receives — dedup, path trace, TTL, dispatch-or-relay — through the
//! node's shared mesh processor, and executes the relay effects over its
//! own peer handles.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use bitchat_core::mesh::{MeshEffect, MeshProcessor};
use bitchat_core::protocol::wire::WireFormat;
use bitchat_core::{
    BitchatError, BitchatMessage, EventSender, PeerId, PeerSnapshot, RendezvousConfig, Result,
    Transport, TransportEvent, TransportKind, TransportState,
};

use crate::fragmentation::{split_for_radio, Reassembler};
use crate::peer::RendezvousPeer;
use crate::radio::{PeerHandle, RendezvousRadio, RendezvousRadioEvent, RendezvousRadioEvents};

// ----------------------------------------------------------------------------
// Rendezvous Transport
// ----------------------------------------------------------------------------

/// The rendezvous-radio transport, generic over its radio driver
pub struct RendezvousTransport<R: RendezvousRadio> {
    config: RendezvousConfig,
    radio: Arc<R>,
    processor: Arc<MeshProcessor>,
    events: EventSender,
    radio_events: std::sync::Mutex<Option<RendezvousRadioEvents>>,
    peers: RwLock<HashMap<PeerId, RendezvousPeer>>,
    handles: RwLock<HashMap<PeerHandle, PeerId>>,
    reassembler: Mutex<Reassembler>,
    next_msg_id: AtomicU16,
    state: RwLock<TransportState>,
}

impl<R: RendezvousRadio> RendezvousTransport<R> {
    /// Wire up the transport. Call [`Self::run`] to start it.
    pub fn new(
        config: RendezvousConfig,
        radio: Arc<R>,
        radio_events: RendezvousRadioEvents,
        processor: Arc<MeshProcessor>,
        events: EventSender,
    ) -> Self {
        let reassembler = Reassembler::new(config.reassembly_timeout);
        Self {
            config,
            radio,
            processor,
            events,
            radio_events: std::sync::Mutex::new(Some(radio_events)),
            peers: RwLock::new(HashMap::new()),
            handles: RwLock::new(HashMap::new()),
            reassembler: Mutex::new(reassembler),
            next_msg_id: AtomicU16::new(1),
            state: RwLock::new(TransportState::Unknown),
        }
    }

    /// Main event loop: publish, subscribe, then process radio events and
    /// the maintenance tick until the radio event stream closes.
    pub async fn run(&self) -> Result<()> {
        let mut radio_events = self
            .radio_events
            .lock()
            .map_err(|_| BitchatError::channel_error("rendezvous radio events poisoned"))?
            .take()
            .ok_or_else(|| BitchatError::channel_error("rendezvous transport already running"))?;

        let local_id = self.processor.router().local_id();
        self.radio.publish(local_id.as_bytes().to_vec()).await?;
        self.radio.subscribe().await?;
        *self.state.write().await = self.radio.state().await;
        info!(transport = self.name(), peer = %local_id, "rendezvous transport started");

        let mut maintenance = tokio::time::interval(self.config.maintenance_interval);
        maintenance.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = radio_events.recv() => {
                    match event {
                        Some(event) => self.handle_radio_event(event).await,
                        None => {
                            info!("rendezvous radio event stream closed; stopping");
                            return Ok(());
                        }
                    }
                }
                _ = maintenance.tick() => {
                    self.reassembler.lock().await.maintain();
                    self.processor.router().maintain(bitchat_core::Timestamp::now());
                }
            }
        }
    }

    async fn handle_radio_event(&self, event: RendezvousRadioEvent) {
        match event {
            RendezvousRadioEvent::StateChanged(state) => {
                *self.state.write().await = state;
                self.emit(TransportEvent::TransportStateChanged {
                    transport: TransportKind::Rendezvous,
                    state,
                })
                .await;
            }
            RendezvousRadioEvent::PeerFound {
                handle,
                service_info,
            } => {
                self.handle_peer_found(handle, &service_info).await;
            }
            RendezvousRadioEvent::PeerLost { handle } => {
                self.handle_peer_lost(handle).await;
            }
            RendezvousRadioEvent::Message { handle, frame } => {
                self.handle_radio_frame(handle, &frame).await;
            }
        }
    }

    /// Service info carries exactly the 8-byte peer id
    async fn handle_peer_found(&self, handle: PeerHandle, service_info: &[u8]) {
        if service_info.len() != 8 {
            warn!(%handle, "service info is not a peer id");
            return;
        }
        let peer_id = PeerId::from_bytes(service_info);
        if peer_id == self.processor.router().local_id() {
            return;
        }

        debug!(%handle, peer = %peer_id, "rendezvous peer found");
        self.handles.write().await.insert(handle, peer_id);
        {
            let mut peers = self.peers.write().await;
            match peers.get_mut(&peer_id) {
                Some(peer) => {
                    peer.handle = Some(handle);
                    peer.mark_seen();
                }
                None => {
                    peers.insert(peer_id, RendezvousPeer::new(peer_id, handle));
                }
            }
        }

        // Introduce ourselves so the new peer learns our nickname.
        match self.processor.make_announce_frame() {
            Ok(frame) => {
                if let Err(err) = self.send_frames(handle, &frame).await {
                    debug!(%handle, error = %err, "announce to new peer failed");
                }
            }
            Err(err) => warn!(error = %err, "could not build announce"),
        }

        self.emit(TransportEvent::PeerConnected {
            peer_id,
            transport: TransportKind::Rendezvous,
        })
        .await;
        self.emit_peer_list().await;
    }

    async fn handle_peer_lost(&self, handle: PeerHandle) {
        let peer_id = self.handles.write().await.remove(&handle);
        let Some(peer_id) = peer_id else {
            return;
        };
        {
            let mut peers = self.peers.write().await;
            if let Some(peer) = peers.get_mut(&peer_id) {
                peer.handle = None;
            }
        }
        self.emit(TransportEvent::PeerDisconnected {
            peer_id,
            transport: TransportKind::Rendezvous,
        })
        .await;
        self.emit_peer_list().await;
    }

    /// Reassemble, then run the mesh rules and execute their effects over
    /// this radio.
    async fn handle_radio_frame(&self, handle: PeerHandle, radio_frame: &[u8]) {
        let frame = {
            let mut reassembler = self.reassembler.lock().await;
            match reassembler.ingest(handle, radio_frame) {
                Ok(Some(frame)) => frame,
                Ok(None) => return,
                Err(err) => {
                    debug!(%handle, error = %err, "bad radio frame");
                    return;
                }
            }
        };

        // Map unmapped handles from direct frames (no path trace yet).
        let known = self.handles.read().await.contains_key(&handle);
        if !known {
            if let Ok(packet) = WireFormat::decode(&frame) {
                if packet.route_len() == 0 {
                    self.handles.write().await.insert(handle, packet.sender_id);
                    let mut peers = self.peers.write().await;
                    peers
                        .entry(packet.sender_id)
                        .or_insert_with(|| RendezvousPeer::new(packet.sender_id, handle));
                }
            }
        }
        if let Some(peer_id) = self.handles.read().await.get(&handle).copied() {
            if let Some(peer) = self.peers.write().await.get_mut(&peer_id) {
                peer.mark_seen();
            }
        }

        let effects = self
            .processor
            .ingest_frame(&frame, TransportKind::Rendezvous)
            .await;
        self.execute_effects(effects, Some(handle)).await;
    }

    async fn execute_effects(&self, effects: Vec<MeshEffect>, ingress: Option<PeerHandle>) {
        for effect in effects {
            match effect {
                MeshEffect::BroadcastFrame(frame) => {
                    self.broadcast_frames(&frame, ingress).await;
                }
                MeshEffect::SendFrame { peer_id, frame } => {
                    if let Err(err) = self.send_raw(peer_id, frame).await {
                        debug!(peer = %peer_id, error = %err, "effect send failed");
                    }
                }
                MeshEffect::UpdatePeerNickname { peer_id, nickname } => {
                    {
                        let mut peers = self.peers.write().await;
                        if let Some(peer) = peers.get_mut(&peer_id) {
                            peer.nickname = Some(nickname);
                            peer.mark_seen();
                        }
                    }
                    self.emit_peer_list().await;
                }
                MeshEffect::EvictPeer { peer_id } => {
                    let handle = {
                        let mut peers = self.peers.write().await;
                        peers.remove(&peer_id).and_then(|peer| peer.handle)
                    };
                    if let Some(handle) = handle {
                        self.handles.write().await.remove(&handle);
                    }
                    self.emit(TransportEvent::PeerDisconnected {
                        peer_id,
                        transport: TransportKind::Rendezvous,
                    })
                    .await;
                    self.emit_peer_list().await;
                }
            }
        }
    }

    /// Send an encoded packet to one handle, fragmenting for the radio
    async fn send_frames(&self, handle: PeerHandle, frame: &[u8]) -> Result<()> {
        let msg_id = self.next_msg_id.fetch_add(1, Ordering::Relaxed);
        for radio_frame in split_for_radio(frame, self.config.max_radio_frame, msg_id)? {
            self.radio.send(handle, radio_frame).await?;
        }
        Ok(())
    }

    /// Send an encoded packet to every known handle except the ingress one
    async fn broadcast_frames(&self, frame: &[u8], skip: Option<PeerHandle>) {
        let targets: Vec<PeerHandle> = {
            let handles = self.handles.read().await;
            handles
                .keys()
                .copied()
                .filter(|handle| Some(*handle) != skip)
                .collect()
        };
        for handle in targets {
            if let Err(err) = self.send_frames(handle, frame).await {
                debug!(%handle, error = %err, "broadcast leg failed");
            }
        }
    }

    async fn emit_peer_list(&self) {
        let peers = self.peer_snapshots().await;
        self.emit(TransportEvent::PeerListUpdated {
            peers,
            transport: TransportKind::Rendezvous,
        })
        .await;
    }

    async fn emit(&self, event: TransportEvent) {
        if self.events.send(event).await.is_err() {
            debug!("event receiver dropped");
        }
    }
}

// ----------------------------------------------------------------------------
// Transport Contract
// ----------------------------------------------------------------------------

#[async_trait]
impl<R: RendezvousRadio> Transport for RendezvousTransport<R> {
    fn kind(&self) -> TransportKind {
        TransportKind::Rendezvous
    }

    fn name(&self) -> &'static str {
        "rendezvous"
    }

    async fn is_available(&self) -> bool {
        *self.state.read().await == TransportState::PoweredOn
    }

    async fn transport_state(&self) -> TransportState {
        *self.state.read().await
    }

    async fn peer_snapshots(&self) -> Vec<PeerSnapshot> {
        let peers = self.peers.read().await;
        peers.values().map(RendezvousPeer::snapshot).collect()
    }

    async fn is_peer_reachable(&self, peer_id: PeerId) -> bool {
        self.peers.read().await.contains_key(&peer_id)
    }

    async fn is_peer_connected(&self, peer_id: PeerId) -> bool {
        self.peers
            .read()
            .await
            .get(&peer_id)
            .map(RendezvousPeer::is_connected)
            .unwrap_or(false)
    }

    async fn send_message(&self, content: &str) -> Result<()> {
        let (_message, frame) = self.processor.make_message_frame(content)?;
        self.broadcast_raw(frame).await
    }

    async fn send_private_message(&self, peer_id: PeerId, message: &BitchatMessage) -> Result<()> {
        let frame = self.processor.make_private_message_frame(peer_id, message)?;
        self.send_raw(peer_id, frame).await
    }

    async fn send_delivery_ack(&self, peer_id: PeerId, message_id: &str) -> Result<()> {
        let frame = self.processor.make_delivery_ack_frame(peer_id, message_id)?;
        self.send_raw(peer_id, frame).await
    }

    async fn send_read_receipt(&self, peer_id: PeerId, message_id: &str) -> Result<()> {
        let frame = self.processor.make_read_receipt_frame(peer_id, message_id)?;
        self.send_raw(peer_id, frame).await
    }

    async fn send_announce(&self) -> Result<()> {
        let frame = self.processor.make_announce_frame()?;
        self.broadcast_raw(frame).await
    }

    async fn trigger_handshake(&self, peer_id: PeerId) -> Result<()> {
        let frame = self.processor.make_handshake_frame(peer_id)?;
        self.send_raw(peer_id, frame).await
    }

    /// Directed send: straight to the peer's handle when the radio still
    /// holds one, otherwise broadcast and let the mesh route it.
    async fn send_raw(&self, peer_id: PeerId, frame: Vec<u8>) -> Result<()> {
        let handle = {
            let peers = self.peers.read().await;
            peers.get(&peer_id).and_then(|peer| peer.handle)
        };
        match handle {
            Some(handle) => self.send_frames(handle, &frame).await,
            None => self.broadcast_raw(frame).await,
        }
    }

    async fn broadcast_raw(&self, frame: Vec<u8>) -> Result<()> {
        // Undeliverable broadcasts degrade silently.
        self.broadcast_frames(&frame, None).await;
        Ok(())
    }

    async fn emergency_disconnect(&self) {
        info!("rendezvous transport emergency disconnect");
        self.radio.stop().await;
        self.peers.write().await.clear();
        self.handles.write().await.clear();
        self.reassembler.lock().await.clear();
        self.emit_peer_list().await;
    }
}
