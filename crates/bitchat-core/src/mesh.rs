//! Mesh routing: TTL-bounded store-and-forward with deduplication and
//! path tracing
//!
//! [`MeshRouter`] makes the pure drop/deliver/relay decision for each
//! packet. [`MeshProcessor`] wraps it with the type dispatch of local
//! delivery — announce handling, Noise handshake and decrypt, receipts —
//! and hands transports a list of radio effects to execute. Both the
//! runtime and the rendezvous transport (which must run the mesh rules
//! locally, since on that radio every device is a relay) share the same
//! processor instance, so dedup state is global to the node.

use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::config::{MeshConfig, MAX_MESSAGE_LENGTH};
use crate::errors::{BitchatError, Result};
use crate::identity::LocalIdentity;
use crate::noise::NoiseService;
use crate::protocol::dedup::{DeduplicationCache, PacketKey};
use crate::protocol::message::{BitchatMessage, DeliveryStatus};
use crate::protocol::packet::{BitchatPacket, MessageType, NoisePayloadType};
use crate::protocol::wire::WireFormat;
use crate::transport::{EventSender, TransportEvent, TransportKind};
use crate::types::{PeerId, Timestamp};

// ----------------------------------------------------------------------------
// Router Verdicts
// ----------------------------------------------------------------------------

/// Why a packet was dropped instead of processed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Dedup set already contains this packet's key
    Duplicate,
    /// The path trace already contains this node
    RouteLoop,
    /// Hop budget exhausted
    TtlExpired,
    /// Path trace is at capacity
    RouteFull,
}

/// Outcome of running the mesh rules over one packet
#[derive(Debug)]
pub enum MeshDisposition {
    /// Do nothing further
    Drop(DropReason),
    /// Deliver locally; relay the enclosed packet as well when present
    Deliver { relay: Option<BitchatPacket> },
    /// Not for us: relay only
    Forward { relay: BitchatPacket },
}

// ----------------------------------------------------------------------------
// Mesh Router
// ----------------------------------------------------------------------------

struct RouterInner {
    local_id: PeerId,
    config: MeshConfig,
    dedup: Mutex<DeduplicationCache>,
}

/// The per-node routing pipeline. Cheap to clone; all clones share dedup
/// state.
#[derive(Clone)]
pub struct MeshRouter {
    inner: Arc<RouterInner>,
}

impl core::fmt::Debug for MeshRouter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MeshRouter")
            .field("local_id", &self.inner.local_id)
            .finish_non_exhaustive()
    }
}

impl MeshRouter {
    /// Create a router for this node
    pub fn new(local_id: PeerId, config: MeshConfig) -> Self {
        let dedup = DeduplicationCache::new(config.dedup.clone());
        Self {
            inner: Arc::new(RouterInner {
                local_id,
                config,
                dedup: Mutex::new(dedup),
            }),
        }
    }

    /// This node's routing id
    pub fn local_id(&self) -> PeerId {
        self.inner.local_id
    }

    /// Run the mesh rules, in order: dedup, path-trace loop check, TTL,
    /// recipient dispatch, relay construction.
    pub fn process(&self, packet: &BitchatPacket, now: Timestamp) -> MeshDisposition {
        if self.check_and_remember(packet, now) {
            return MeshDisposition::Drop(DropReason::Duplicate);
        }

        if packet.route_contains(self.inner.local_id) {
            return MeshDisposition::Drop(DropReason::RouteLoop);
        }

        if packet.ttl.is_expired() {
            return MeshDisposition::Drop(DropReason::TtlExpired);
        }

        if packet.is_broadcast() {
            return MeshDisposition::Deliver {
                relay: self.relayed(packet).ok().flatten(),
            };
        }

        if packet.recipient_id == Some(self.inner.local_id) {
            return MeshDisposition::Deliver { relay: None };
        }

        // Directed at someone else: forward or die trying.
        match self.relayed(packet) {
            Ok(Some(relay)) => MeshDisposition::Forward { relay },
            Ok(None) => MeshDisposition::Drop(DropReason::TtlExpired),
            Err(reason) => MeshDisposition::Drop(reason),
        }
    }

    /// Remember our own outbound packet so the router ignores the echo
    /// when a neighbor relays it straight back.
    pub fn note_outbound(&self, packet: &BitchatPacket, now: Timestamp) {
        self.with_dedup(|dedup| dedup.mark(PacketKey::of(packet), now));
    }

    /// Expire aged dedup entries
    pub fn maintain(&self, now: Timestamp) {
        self.with_dedup(|dedup| dedup.maintain(now));
    }

    /// Number of live dedup entries
    pub fn dedup_len(&self) -> usize {
        self.with_dedup(|dedup| dedup.len())
    }

    /// Forget all dedup state (emergency wipe)
    pub fn clear(&self) {
        self.with_dedup(DeduplicationCache::clear);
    }

    fn check_and_remember(&self, packet: &BitchatPacket, now: Timestamp) -> bool {
        self.with_dedup(|dedup| dedup.check_and_add(PacketKey::of(packet), now))
    }

    /// Build the relayed copy: decremented TTL, our id appended to the
    /// path trace. Returns Ok(None) when the hop budget ends here and
    /// Err(RouteFull) when the trace is at capacity.
    fn relayed(&self, packet: &BitchatPacket) -> core::result::Result<Option<BitchatPacket>, DropReason> {
        let Some(ttl) = packet.ttl.decrement() else {
            return Ok(None);
        };
        if ttl.is_expired() {
            return Ok(None);
        }

        if packet.route_len() >= self.inner.config.max_route_hops {
            return Err(DropReason::RouteFull);
        }

        let mut route = packet.route.clone().unwrap_or_default();
        route.push(self.inner.local_id);

        Ok(Some(packet.clone().with_ttl(ttl).with_route(route)))
    }

    fn with_dedup<R>(&self, f: impl FnOnce(&mut DeduplicationCache) -> R) -> R {
        let mut guard = match self.inner.dedup.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}

// ----------------------------------------------------------------------------
// Radio Effects
// ----------------------------------------------------------------------------

/// What a transport must do after handing a frame to the processor.
///
/// Transports execute these against their own radio; the processor never
/// touches I/O, so it can never block ingress on a send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEffect {
    /// Rebroadcast a relayed frame to everyone except the ingress link
    BroadcastFrame(Vec<u8>),
    /// Send a frame (handshake reply, delivery ack) to a reachable peer
    SendFrame { peer_id: PeerId, frame: Vec<u8> },
    /// An announce told us this peer's nickname
    UpdatePeerNickname { peer_id: PeerId, nickname: String },
    /// The peer left the mesh
    EvictPeer { peer_id: PeerId },
}

// ----------------------------------------------------------------------------
// Mesh Processor
// ----------------------------------------------------------------------------

/// Ingress dispatch plus outbound packet construction, shared by every
/// transport on the node.
pub struct MeshProcessor {
    identity: Arc<LocalIdentity>,
    router: MeshRouter,
    noise: Arc<NoiseService>,
    events: EventSender,
}

impl core::fmt::Debug for MeshProcessor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MeshProcessor")
            .field("local_id", &self.router.local_id())
            .finish_non_exhaustive()
    }
}

impl MeshProcessor {
    /// Wire up the processor
    pub fn new(
        identity: Arc<LocalIdentity>,
        router: MeshRouter,
        noise: Arc<NoiseService>,
        events: EventSender,
    ) -> Self {
        Self {
            identity,
            router,
            noise,
            events,
        }
    }

    /// The shared router
    pub fn router(&self) -> &MeshRouter {
        &self.router
    }

    /// The shared Noise service
    pub fn noise(&self) -> &Arc<NoiseService> {
        &self.noise
    }

    /// Local identity
    pub fn identity(&self) -> &Arc<LocalIdentity> {
        &self.identity
    }

    /// Run one received frame through decode, the mesh rules, and local
    /// delivery. Returns the radio effects the ingress transport must
    /// execute.
    pub async fn ingest_frame(&self, frame: &[u8], ingress: TransportKind) -> Vec<MeshEffect> {
        let packet = match WireFormat::decode(frame) {
            Ok(packet) => packet,
            Err(err) => {
                debug!(?ingress, error = %err, "dropping undecodable frame");
                return Vec::new();
            }
        };

        let now = Timestamp::now();
        let mut effects = Vec::new();

        match self.router.process(&packet, now) {
            MeshDisposition::Drop(reason) => {
                debug!(?reason, sender = %packet.sender_id, "dropping packet");
            }
            MeshDisposition::Forward { relay } => {
                self.push_relay(&mut effects, &relay, now);
            }
            MeshDisposition::Deliver { relay } => {
                self.deliver(&packet, ingress, now, &mut effects).await;
                if let Some(relay) = relay {
                    self.push_relay(&mut effects, &relay, now);
                }
            }
        }

        effects
    }

    /// Local delivery, switching on packet type
    async fn deliver(
        &self,
        packet: &BitchatPacket,
        ingress: TransportKind,
        now: Timestamp,
        effects: &mut Vec<MeshEffect>,
    ) {
        match packet.message_type {
            MessageType::Announce => self.deliver_announce(packet, effects),
            MessageType::Message => self.deliver_message(packet, ingress, effects).await,
            MessageType::NoiseHandshake => self.deliver_handshake(packet, now, effects),
            MessageType::NoiseEncrypted => {
                self.deliver_encrypted(packet, ingress, now, effects).await
            }
            MessageType::Leave => {
                effects.push(MeshEffect::EvictPeer {
                    peer_id: packet.sender_id,
                });
                self.emit(TransportEvent::PeerDisconnected {
                    peer_id: packet.sender_id,
                    transport: ingress,
                })
                .await;
            }
            MessageType::Fragment | MessageType::RequestSync | MessageType::FileTransfer => {
                // Collaborator sub-protocols; the router only forwards them.
                debug!(message_type = ?packet.message_type, "passing packet through to collaborator");
            }
        }
    }

    fn deliver_announce(&self, packet: &BitchatPacket, effects: &mut Vec<MeshEffect>) {
        match parse_announce(&packet.payload) {
            Some((peer_id, nickname)) => effects.push(MeshEffect::UpdatePeerNickname {
                peer_id,
                nickname,
            }),
            None => debug!(sender = %packet.sender_id, "malformed announce payload"),
        }
    }

    async fn deliver_message(
        &self,
        packet: &BitchatPacket,
        ingress: TransportKind,
        effects: &mut Vec<MeshEffect>,
    ) {
        let message = match BitchatMessage::from_binary(&packet.payload) {
            Ok(message) => message,
            Err(err) => {
                debug!(sender = %packet.sender_id, error = %err, "dropping malformed message payload");
                return;
            }
        };

        // Directed chat traffic is acknowledged through the sender's
        // session when one is up; broadcasts degrade silently.
        if packet.is_directed() {
            self.push_delivery_ack(effects, packet.sender_id, &message.id);
        }

        self.emit(TransportEvent::MessageReceived {
            message,
            from: packet.sender_id,
            transport: ingress,
        })
        .await;
    }

    fn deliver_handshake(&self, packet: &BitchatPacket, now: Timestamp, effects: &mut Vec<MeshEffect>) {
        match self
            .noise
            .handle_handshake_frame(packet.sender_id, &packet.payload)
        {
            Ok(Some(response)) => {
                let reply = BitchatPacket::new(
                    MessageType::NoiseHandshake,
                    self.router.local_id(),
                    response,
                )
                .with_recipient(packet.sender_id);
                if let Some(frame) = self.encode_outbound(&reply, now) {
                    effects.push(MeshEffect::SendFrame {
                        peer_id: packet.sender_id,
                        frame,
                    });
                }
            }
            Ok(None) => {}
            Err(err) => {
                warn!(peer = %packet.sender_id, error = %err, "handshake frame rejected");
            }
        }
    }

    async fn deliver_encrypted(
        &self,
        packet: &BitchatPacket,
        ingress: TransportKind,
        now: Timestamp,
        effects: &mut Vec<MeshEffect>,
    ) {
        let plaintext = match self.noise.decrypt(packet.sender_id, &packet.payload) {
            Ok(plaintext) => plaintext,
            Err(err) => {
                debug!(peer = %packet.sender_id, error = %err, "cannot decrypt noise payload");
                return;
            }
        };

        let Some((&subtype_byte, inner)) = plaintext.split_first() else {
            debug!(peer = %packet.sender_id, "empty noise payload");
            return;
        };
        let Some(payload_type) = NoisePayloadType::from_u8(subtype_byte) else {
            debug!(peer = %packet.sender_id, subtype = subtype_byte, "unknown noise sub-type");
            return;
        };

        self.emit(TransportEvent::NoisePayloadReceived {
            from: packet.sender_id,
            payload_type,
            payload: inner.to_vec(),
            timestamp: packet.timestamp,
        })
        .await;

        match payload_type {
            NoisePayloadType::PrivateMessage => {
                match BitchatMessage::from_binary(inner) {
                    Ok(message) => {
                        self.push_delivery_ack(effects, packet.sender_id, &message.id);
                        self.emit(TransportEvent::MessageReceived {
                            message,
                            from: packet.sender_id,
                            transport: ingress,
                        })
                        .await;
                    }
                    Err(err) => {
                        debug!(peer = %packet.sender_id, error = %err, "malformed private message");
                    }
                }
            }
            NoisePayloadType::Delivered => {
                if let Ok(message_id) = String::from_utf8(inner.to_vec()) {
                    self.emit(TransportEvent::MessageDeliveryStatusChanged {
                        message_id,
                        status: DeliveryStatus::Delivered {
                            to: packet.sender_id.to_string(),
                            at: now,
                        },
                    })
                    .await;
                }
            }
            NoisePayloadType::ReadReceipt => {
                if let Ok(message_id) = String::from_utf8(inner.to_vec()) {
                    self.emit(TransportEvent::MessageDeliveryStatusChanged {
                        message_id,
                        status: DeliveryStatus::Read {
                            by: packet.sender_id.to_string(),
                            at: now,
                        },
                    })
                    .await;
                }
            }
            // Verification rides the event above; nothing more to do here.
            NoisePayloadType::VerifyChallenge | NoisePayloadType::VerifyResponse => {}
        }
    }

    // ------------------------------------------------------------------
    // Outbound construction
    // ------------------------------------------------------------------

    /// Build the broadcast frame for a public chat message
    pub fn make_message_frame(&self, content: &str) -> Result<(BitchatMessage, Vec<u8>)> {
        if content.chars().count() > MAX_MESSAGE_LENGTH {
            return Err(BitchatError::policy(format!(
                "message exceeds {MAX_MESSAGE_LENGTH} characters"
            )));
        }

        let message = BitchatMessage::new(
            &self.identity.nickname(),
            content,
            self.router.local_id(),
        );
        let packet = BitchatPacket::new(
            MessageType::Message,
            self.router.local_id(),
            message.to_binary(),
        );
        let frame = self.encode_or_err(&packet)?;
        Ok((message, frame))
    }

    /// Build our announce broadcast frame
    pub fn make_announce_frame(&self) -> Result<Vec<u8>> {
        let packet = BitchatPacket::new(
            MessageType::Announce,
            self.router.local_id(),
            encode_announce(self.router.local_id(), &self.identity.nickname()),
        );
        self.encode_or_err(&packet)
    }

    /// Build our leave broadcast frame
    pub fn make_leave_frame(&self) -> Result<Vec<u8>> {
        let packet = BitchatPacket::new(MessageType::Leave, self.router.local_id(), Vec::new());
        self.encode_or_err(&packet)
    }

    /// Encrypt and frame a private message for a peer
    pub fn make_private_message_frame(
        &self,
        peer_id: PeerId,
        message: &BitchatMessage,
    ) -> Result<Vec<u8>> {
        if message.content.chars().count() > MAX_MESSAGE_LENGTH {
            return Err(BitchatError::policy(format!(
                "message exceeds {MAX_MESSAGE_LENGTH} characters"
            )));
        }
        self.make_noise_frame(peer_id, NoisePayloadType::PrivateMessage, &message.to_binary())
    }

    /// Frame a delivery acknowledgment for a message id
    pub fn make_delivery_ack_frame(&self, peer_id: PeerId, message_id: &str) -> Result<Vec<u8>> {
        self.make_noise_frame(peer_id, NoisePayloadType::Delivered, message_id.as_bytes())
    }

    /// Frame a read receipt for a message id
    pub fn make_read_receipt_frame(&self, peer_id: PeerId, message_id: &str) -> Result<Vec<u8>> {
        self.make_noise_frame(peer_id, NoisePayloadType::ReadReceipt, message_id.as_bytes())
    }

    /// Start a handshake with a peer, returning the framed first message
    pub fn make_handshake_frame(&self, peer_id: PeerId) -> Result<Vec<u8>> {
        let first = self.noise.initiate_handshake(peer_id)?;
        let packet = BitchatPacket::new(MessageType::NoiseHandshake, self.router.local_id(), first)
            .with_recipient(peer_id);
        self.encode_or_err(&packet)
    }

    /// Encrypt an arbitrary sub-typed payload into a directed frame
    pub fn make_noise_frame(
        &self,
        peer_id: PeerId,
        payload_type: NoisePayloadType,
        payload: &[u8],
    ) -> Result<Vec<u8>> {
        let mut inner = Vec::with_capacity(1 + payload.len());
        inner.push(payload_type.as_u8());
        inner.extend_from_slice(payload);

        let ciphertext = self.noise.encrypt(peer_id, &inner)?;
        let packet =
            BitchatPacket::new(MessageType::NoiseEncrypted, self.router.local_id(), ciphertext)
                .with_recipient(peer_id);
        self.encode_or_err(&packet)
    }

    fn push_relay(&self, effects: &mut Vec<MeshEffect>, relay: &BitchatPacket, now: Timestamp) {
        if let Some(frame) = self.encode_outbound(relay, now) {
            effects.push(MeshEffect::BroadcastFrame(frame));
        }
    }

    /// Queue a DELIVERED ack through the sender's session, when one is up
    fn push_delivery_ack(&self, effects: &mut Vec<MeshEffect>, peer_id: PeerId, message_id: &str) {
        if !self.noise.is_established(peer_id) {
            return;
        }
        match self.make_delivery_ack_frame(peer_id, message_id) {
            Ok(frame) => effects.push(MeshEffect::SendFrame { peer_id, frame }),
            Err(err) => debug!(peer = %peer_id, error = %err, "could not build delivery ack"),
        }
    }

    fn encode_or_err(&self, packet: &BitchatPacket) -> Result<Vec<u8>> {
        let frame = WireFormat::encode_with_options(packet, true, true)?;
        self.router.note_outbound(packet, Timestamp::now());
        Ok(frame)
    }

    fn encode_outbound(&self, packet: &BitchatPacket, now: Timestamp) -> Option<Vec<u8>> {
        match WireFormat::encode_with_options(packet, true, true) {
            Ok(frame) => {
                self.router.note_outbound(packet, now);
                Some(frame)
            }
            Err(err) => {
                warn!(error = %err, "failed to encode outbound packet");
                None
            }
        }
    }

    async fn emit(&self, event: TransportEvent) {
        if self.events.send(event).await.is_err() {
            debug!("event receiver dropped; host is shutting down");
        }
    }
}

// ----------------------------------------------------------------------------
// Announce Payload
// ----------------------------------------------------------------------------

/// Announce payload layout: 8-byte peer id followed by the UTF-8 nickname
pub fn encode_announce(peer_id: PeerId, nickname: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(8 + nickname.len());
    payload.extend_from_slice(peer_id.as_bytes());
    payload.extend_from_slice(nickname.as_bytes());
    payload
}

/// Parse an announce payload into (peer id, nickname)
pub fn parse_announce(payload: &[u8]) -> Option<(PeerId, String)> {
    if payload.len() < 8 {
        return None;
    }
    let peer_id = PeerId::from_bytes(&payload[..8]);
    let nickname = String::from_utf8(payload[8..].to_vec()).ok()?;
    Some((peer_id, nickname))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
