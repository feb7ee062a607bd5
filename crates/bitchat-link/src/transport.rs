//! Short-range link transport
//!
//! Presents itself simultaneously as a listener (advertising the service
//! and serving announce reads) and an initiator (scanning and opening
//! links). Incoming chunks are reassembled into whole codec frames and run
//! through the shared mesh processor; the resulting radio effects are
//! executed against this transport's own links.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use bitchat_core::mesh::{encode_announce, parse_announce, MeshEffect, MeshProcessor};
use bitchat_core::protocol::wire::WireFormat;
use bitchat_core::{
    BitchatError, BitchatMessage, EventSender, LinkConfig, PeerId, PeerSnapshot, Result,
    Timestamp, Transport, TransportEvent, TransportKind, TransportState,
};

use crate::chunking::{chunk_frame, FrameAssembler};
use crate::peer::LinkPeer;
use crate::radio::{LinkDeviceId, LinkRadio, LinkRadioEvent, LinkRadioEvents};

// ----------------------------------------------------------------------------
// Device State
// ----------------------------------------------------------------------------

/// Book-keeping for one live link
#[derive(Debug)]
struct DeviceState {
    /// The peer on the other end, once learned from their announce
    peer_id: Option<PeerId>,
    /// Whether we opened this link as initiator
    initiated_by_us: bool,
    /// Chunk reassembly for this link
    assembler: FrameAssembler,
}

impl DeviceState {
    fn new(initiated_by_us: bool) -> Self {
        Self {
            peer_id: None,
            initiated_by_us,
            assembler: FrameAssembler::new(),
        }
    }
}

// ----------------------------------------------------------------------------
// Link Transport
// ----------------------------------------------------------------------------

/// The short-range link transport, generic over its radio driver
pub struct LinkTransport<R: LinkRadio> {
    config: LinkConfig,
    radio: Arc<R>,
    processor: Arc<MeshProcessor>,
    events: EventSender,
    radio_events: std::sync::Mutex<Option<LinkRadioEvents>>,
    peers: RwLock<HashMap<PeerId, LinkPeer>>,
    devices: RwLock<HashMap<LinkDeviceId, DeviceState>>,
    connect_attempts: Mutex<HashMap<LinkDeviceId, Instant>>,
    last_announce: Mutex<Option<Instant>>,
    state: RwLock<TransportState>,
}

impl<R: LinkRadio> LinkTransport<R> {
    /// Wire up the transport. Call [`Self::run`] to start it.
    pub fn new(
        config: LinkConfig,
        radio: Arc<R>,
        radio_events: LinkRadioEvents,
        processor: Arc<MeshProcessor>,
        events: EventSender,
    ) -> Self {
        Self {
            config,
            radio,
            processor,
            events,
            radio_events: std::sync::Mutex::new(Some(radio_events)),
            peers: RwLock::new(HashMap::new()),
            devices: RwLock::new(HashMap::new()),
            connect_attempts: Mutex::new(HashMap::new()),
            last_announce: Mutex::new(None),
            state: RwLock::new(TransportState::Unknown),
        }
    }

    /// Main event loop: radio events plus the maintenance tick. Runs until
    /// the radio event stream closes.
    pub async fn run(&self) -> Result<()> {
        let mut radio_events = self
            .radio_events
            .lock()
            .map_err(|_| BitchatError::channel_error("link radio events poisoned"))?
            .take()
            .ok_or_else(|| BitchatError::channel_error("link transport already running"))?;

        self.radio
            .start(self.config.service_id, self.config.characteristic_id)
            .await?;
        self.radio
            .set_announce_payload(encode_announce(
                self.processor.router().local_id(),
                &self.processor.identity().nickname(),
            ))
            .await;
        *self.state.write().await = self.radio.state().await;
        info!(transport = self.name(), "link transport started");

        let mut maintenance = tokio::time::interval(self.config.maintenance_interval);
        maintenance.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = radio_events.recv() => {
                    match event {
                        Some(event) => self.handle_radio_event(event).await,
                        None => {
                            info!("link radio event stream closed; stopping");
                            return Ok(());
                        }
                    }
                }
                _ = maintenance.tick() => {
                    self.run_maintenance().await;
                }
            }
        }
    }

    async fn handle_radio_event(&self, event: LinkRadioEvent) {
        match event {
            LinkRadioEvent::StateChanged(state) => {
                *self.state.write().await = state;
                self.emit(TransportEvent::TransportStateChanged {
                    transport: TransportKind::Link,
                    state,
                })
                .await;
            }
            LinkRadioEvent::DeviceDiscovered { device } => {
                self.try_connect(device).await;
            }
            LinkRadioEvent::InboundConnected { device } => {
                debug!(%device, "inbound link accepted");
                self.devices
                    .write()
                    .await
                    .insert(device, DeviceState::new(false));
            }
            LinkRadioEvent::Disconnected { device } => {
                self.handle_disconnect(device).await;
            }
            LinkRadioEvent::Data { device, chunk } => {
                self.handle_data(device, &chunk).await;
            }
        }
    }

    /// Initiator path: connect, read the peer's announce, write ours,
    /// subscribe to notifications.
    async fn try_connect(&self, device: LinkDeviceId) {
        {
            let devices = self.devices.read().await;
            if devices.contains_key(&device) {
                return;
            }
            let initiator_links = devices.values().filter(|d| d.initiated_by_us).count();
            if initiator_links >= self.config.max_initiator_links {
                debug!(%device, "initiator link limit reached");
                return;
            }
        }
        {
            let mut attempts = self.connect_attempts.lock().await;
            if let Some(last) = attempts.get(&device) {
                if last.elapsed() < self.config.min_connect_interval {
                    return;
                }
            }
            attempts.insert(device, Instant::now());
        }

        if let Err(err) = self.radio.connect(device).await {
            debug!(%device, error = %err, "link connect failed");
            return;
        }

        let announce = match self.radio.read_announce(device).await {
            Ok(announce) => announce,
            Err(err) => {
                debug!(%device, error = %err, "announce read failed");
                self.radio.disconnect(device).await;
                return;
            }
        };
        let Some((peer_id, nickname)) = parse_announce(&announce) else {
            warn!(%device, "malformed announce characteristic");
            self.radio.disconnect(device).await;
            return;
        };

        {
            let mut devices = self.devices.write().await;
            let mut state = DeviceState::new(true);
            state.peer_id = Some(peer_id);
            devices.insert(device, state);
        }
        {
            let mut peers = self.peers.write().await;
            let peer = peers.entry(peer_id).or_insert_with(|| LinkPeer::new(peer_id));
            peer.mark_connection_attempt();
            peer.mark_connected(device);
            peer.nickname = Some(nickname);
        }

        // Our side of the announce exchange rides as a normal framed packet.
        match self.processor.make_announce_frame() {
            Ok(frame) => self.write_frame(device, &frame).await,
            Err(err) => warn!(error = %err, "could not build announce"),
        }
        if let Err(err) = self.radio.enable_notifications(device).await {
            debug!(%device, error = %err, "notification subscribe failed");
        }

        info!(%device, peer = %peer_id, "link established");
        self.emit(TransportEvent::PeerConnected {
            peer_id,
            transport: TransportKind::Link,
        })
        .await;
        self.emit_peer_list().await;
    }

    async fn handle_disconnect(&self, device: LinkDeviceId) {
        let peer_id = {
            let mut devices = self.devices.write().await;
            devices.remove(&device).and_then(|state| state.peer_id)
        };
        if let Some(peer_id) = peer_id {
            let mut peers = self.peers.write().await;
            if let Some(peer) = peers.get_mut(&peer_id) {
                peer.mark_disconnected();
            }
            drop(peers);
            self.emit(TransportEvent::PeerDisconnected {
                peer_id,
                transport: TransportKind::Link,
            })
            .await;
            self.emit_peer_list().await;
        }
    }

    /// Reassemble chunks into frames and run each frame through the mesh
    /// processor, then execute the resulting radio effects.
    async fn handle_data(&self, device: LinkDeviceId, chunk: &[u8]) {
        let frame = {
            let mut devices = self.devices.write().await;
            let state = devices.entry(device).or_insert_with(|| DeviceState::new(false));
            state.assembler.push_chunk(chunk)
        };
        let Some(frame) = frame else {
            return;
        };

        // An unmapped inbound link is identified by the first direct frame
        // it carries: no path trace means the sender wrote it themselves.
        let mapped_peer = {
            let devices = self.devices.read().await;
            devices.get(&device).and_then(|state| state.peer_id)
        };
        let sender = if mapped_peer.is_none() {
            match WireFormat::decode(&frame) {
                Ok(packet) if packet.route_len() == 0 => {
                    self.map_device(device, packet.sender_id).await;
                    Some(packet.sender_id)
                }
                _ => None,
            }
        } else {
            mapped_peer
        };

        if let Some(peer_id) = sender {
            let mut peers = self.peers.write().await;
            peers
                .entry(peer_id)
                .or_insert_with(|| LinkPeer::new(peer_id))
                .mark_seen();
        }

        let effects = self
            .processor
            .ingest_frame(&frame, TransportKind::Link)
            .await;
        self.execute_effects(effects, Some(device)).await;
    }

    async fn map_device(&self, device: LinkDeviceId, peer_id: PeerId) {
        {
            let mut devices = self.devices.write().await;
            if let Some(state) = devices.get_mut(&device) {
                state.peer_id = Some(peer_id);
            }
        }
        let mut peers = self.peers.write().await;
        peers
            .entry(peer_id)
            .or_insert_with(|| LinkPeer::new(peer_id))
            .mark_connected(device);
    }

    async fn execute_effects(&self, effects: Vec<MeshEffect>, ingress: Option<LinkDeviceId>) {
        for effect in effects {
            match effect {
                MeshEffect::BroadcastFrame(frame) => {
                    self.broadcast_frame(&frame, ingress).await;
                }
                MeshEffect::SendFrame { peer_id, frame } => {
                    if let Err(err) = self.send_raw(peer_id, frame).await {
                        debug!(peer = %peer_id, error = %err, "effect send failed");
                    }
                }
                MeshEffect::UpdatePeerNickname { peer_id, nickname } => {
                    {
                        let mut peers = self.peers.write().await;
                        let peer = peers.entry(peer_id).or_insert_with(|| LinkPeer::new(peer_id));
                        peer.nickname = Some(nickname);
                        peer.mark_seen();
                    }
                    self.emit_peer_list().await;
                }
                MeshEffect::EvictPeer { peer_id } => {
                    self.evict_peer(peer_id).await;
                }
            }
        }
    }

    /// Write a frame to every live link, skipping the one it arrived on
    async fn broadcast_frame(&self, frame: &[u8], skip: Option<LinkDeviceId>) {
        let targets: Vec<LinkDeviceId> = {
            let devices = self.devices.read().await;
            devices
                .keys()
                .copied()
                .filter(|device| Some(*device) != skip)
                .collect()
        };
        for device in targets {
            self.write_frame(device, frame).await;
        }
    }

    async fn write_frame(&self, device: LinkDeviceId, frame: &[u8]) {
        let mtu = self.radio.mtu(device).await.min(self.config.target_mtu);
        for chunk in chunk_frame(frame, mtu) {
            if let Err(err) = self.radio.write_chunk(device, chunk).await {
                debug!(%device, error = %err, "chunk write failed");
                return;
            }
        }
    }

    async fn evict_peer(&self, peer_id: PeerId) {
        let device = {
            let mut peers = self.peers.write().await;
            peers.remove(&peer_id).and_then(|peer| peer.device)
        };
        if let Some(device) = device {
            self.devices.write().await.remove(&device);
            self.radio.disconnect(device).await;
        }
        self.emit(TransportEvent::PeerDisconnected {
            peer_id,
            transport: TransportKind::Link,
        })
        .await;
        self.emit_peer_list().await;
    }

    /// Evict peers that have gone quiet and re-broadcast our announce
    async fn run_maintenance(&self) {
        let now = Timestamp::now();
        let stale: Vec<PeerId> = {
            let peers = self.peers.read().await;
            peers
                .values()
                .filter(|peer| peer.is_stale(now, self.config.peer_timeout))
                .map(|peer| peer.peer_id)
                .collect()
        };
        for peer_id in stale {
            debug!(peer = %peer_id, "evicting quiet peer");
            self.evict_peer(peer_id).await;
        }

        self.processor.router().maintain(now);

        if let Err(err) = self.send_announce().await {
            debug!(error = %err, "maintenance announce failed");
        }
    }

    async fn emit_peer_list(&self) {
        let peers = self.peer_snapshots().await;
        self.emit(TransportEvent::PeerListUpdated {
            peers,
            transport: TransportKind::Link,
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
impl<R: LinkRadio> Transport for LinkTransport<R> {
    fn kind(&self) -> TransportKind {
        TransportKind::Link
    }

    fn name(&self) -> &'static str {
        "link"
    }

    async fn is_available(&self) -> bool {
        *self.state.read().await == TransportState::PoweredOn
    }

    async fn transport_state(&self) -> TransportState {
        *self.state.read().await
    }

    async fn peer_snapshots(&self) -> Vec<PeerSnapshot> {
        let peers = self.peers.read().await;
        peers.values().map(LinkPeer::snapshot).collect()
    }

    async fn is_peer_reachable(&self, peer_id: PeerId) -> bool {
        self.peers.read().await.contains_key(&peer_id)
    }

    async fn is_peer_connected(&self, peer_id: PeerId) -> bool {
        self.peers
            .read()
            .await
            .get(&peer_id)
            .map(LinkPeer::is_connected)
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
        {
            let mut last = self.last_announce.lock().await;
            if let Some(at) = *last {
                if at.elapsed() < self.config.min_announce_interval {
                    return Ok(());
                }
            }
            *last = Some(Instant::now());
        }
        let frame = self.processor.make_announce_frame()?;
        self.broadcast_raw(frame).await
    }

    async fn trigger_handshake(&self, peer_id: PeerId) -> Result<()> {
        let frame = self.processor.make_handshake_frame(peer_id)?;
        self.send_raw(peer_id, frame).await
    }

    async fn send_raw(&self, peer_id: PeerId, frame: Vec<u8>) -> Result<()> {
        let device = {
            let peers = self.peers.read().await;
            peers.get(&peer_id).and_then(|peer| peer.device)
        };
        match device {
            Some(device) => {
                self.write_frame(device, &frame).await;
                Ok(())
            }
            // Not directly linked: flood and let the mesh route it.
            None => self.broadcast_raw(frame).await,
        }
    }

    async fn broadcast_raw(&self, frame: Vec<u8>) -> Result<()> {
        // Undeliverable broadcasts degrade silently.
        if self.devices.read().await.is_empty() {
            debug!("broadcast with no links up");
            return Ok(());
        }
        self.broadcast_frame(&frame, None).await;
        Ok(())
    }

    async fn emergency_disconnect(&self) {
        info!("link transport emergency disconnect");
        let devices: Vec<LinkDeviceId> = self.devices.write().await.drain().map(|(d, _)| d).collect();
        for device in devices {
            self.radio.disconnect(device).await;
        }
        self.peers.write().await.clear();
        self.connect_attempts.lock().await.clear();
        self.emit_peer_list().await;
    }
}
