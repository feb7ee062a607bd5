//! Node assembly
//!
//! Builds the constructed root object — identity, session service, mesh
//! processor, selector — and hands the host the delegate event stream.
//! Nothing here is a process global: hosts that want two nodes in one
//! process (tests do) just build two.

use std::sync::Arc;

use bitchat_core::mesh::{MeshProcessor, MeshRouter};
use bitchat_core::{
    event_channel, EventReceiver, EventSender, IdentityStore, LocalIdentity, MeshConfig,
    NoiseService, PeerId, SelectorConfig, SessionConfig, Transport,
};

use crate::power::{FixedPowerMonitor, PowerMonitor};
use crate::selector::TransportSelector;

/// Delegate channel depth; network events are bursty and a slow host
/// consumer must not stall packet ingress
const EVENT_BUFFER: usize = 1024;

// ----------------------------------------------------------------------------
// Builder
// ----------------------------------------------------------------------------

/// Assembles a [`BitchatNode`]
pub struct BitchatNodeBuilder {
    identity: Option<Arc<LocalIdentity>>,
    session_config: SessionConfig,
    mesh_config: MeshConfig,
    selector_config: SelectorConfig,
    power: Option<Arc<dyn PowerMonitor>>,
}

impl BitchatNodeBuilder {
    fn new() -> Self {
        Self {
            identity: None,
            session_config: SessionConfig::default(),
            mesh_config: MeshConfig::default(),
            selector_config: SelectorConfig::default(),
            power: None,
        }
    }

    /// Load identity from the host's store
    pub fn identity_from_store(mut self, store: &dyn IdentityStore) -> Self {
        self.identity = Some(Arc::new(LocalIdentity::from_store(store)));
        self
    }

    /// Use a pre-built identity
    pub fn identity(mut self, identity: Arc<LocalIdentity>) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Override the session configuration
    pub fn session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    /// Override the mesh configuration
    pub fn mesh_config(mut self, config: MeshConfig) -> Self {
        self.mesh_config = config;
        self
    }

    /// Override the selector thresholds
    pub fn selector_config(mut self, config: SelectorConfig) -> Self {
        self.selector_config = config;
        self
    }

    /// Attach the host's power monitor
    pub fn power_monitor(mut self, power: Arc<dyn PowerMonitor>) -> Self {
        self.power = Some(power);
        self
    }

    /// Build the node plus the delegate event stream the host consumes
    pub fn build(self, nickname: &str) -> (BitchatNode, EventReceiver) {
        let identity = self
            .identity
            .unwrap_or_else(|| Arc::new(LocalIdentity::ephemeral(nickname)));
        let power = self
            .power
            .unwrap_or_else(|| Arc::new(FixedPowerMonitor::unknown()));

        let (events, receiver) = event_channel(EVENT_BUFFER);
        let noise = Arc::new(NoiseService::new(
            identity.noise_keys().clone(),
            self.session_config,
        ));
        let router = MeshRouter::new(identity.peer_id(), self.mesh_config);
        let processor = Arc::new(MeshProcessor::new(
            Arc::clone(&identity),
            router,
            Arc::clone(&noise),
            events.clone(),
        ));
        let selector = TransportSelector::new(power, Arc::clone(&processor), self.selector_config);

        let node = BitchatNode {
            identity,
            noise,
            processor,
            selector,
            events,
        };
        (node, receiver)
    }
}

// ----------------------------------------------------------------------------
// Node
// ----------------------------------------------------------------------------

/// One BitChat node: identity, sessions, mesh rules, and the transports
/// registered with its selector.
pub struct BitchatNode {
    identity: Arc<LocalIdentity>,
    noise: Arc<NoiseService>,
    processor: Arc<MeshProcessor>,
    selector: TransportSelector,
    events: EventSender,
}

impl BitchatNode {
    /// Start building a node
    pub fn builder() -> BitchatNodeBuilder {
        BitchatNodeBuilder::new()
    }

    /// Our short routing id
    pub fn peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    /// The local identity
    pub fn identity(&self) -> &Arc<LocalIdentity> {
        &self.identity
    }

    /// The shared session service
    pub fn noise(&self) -> &Arc<NoiseService> {
        &self.noise
    }

    /// The shared mesh processor; transports are constructed around this
    pub fn processor(&self) -> &Arc<MeshProcessor> {
        &self.processor
    }

    /// A sender half of the delegate channel for transport construction
    pub fn event_sender(&self) -> EventSender {
        self.events.clone()
    }

    /// The transport selector
    pub fn selector(&self) -> &TransportSelector {
        &self.selector
    }

    /// Register a transport with the selector
    pub fn add_transport(&mut self, transport: Arc<dyn Transport>) {
        self.selector.add_transport(transport);
    }

    /// Hard reset: peers, sessions, dedup state, and reassembly buffers
    /// are all gone when this returns; a subsequent handshake from the
    /// same peer starts from nothing.
    pub async fn emergency_wipe(&self) {
        self.selector.emergency_disconnect().await;
    }
}

impl core::fmt::Debug for BitchatNode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BitchatNode")
            .field("peer_id", &self.identity.peer_id())
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_node_with_defaults() {
        let (node, _events) = BitchatNode::builder().build("alice");
        assert_eq!(node.peer_id(), node.identity().peer_id());
        assert_eq!(node.selector().transports().len(), 0);
    }

    #[test]
    fn test_two_nodes_have_distinct_identities() {
        let (a, _ea) = BitchatNode::builder().build("a");
        let (b, _eb) = BitchatNode::builder().build("b");
        assert_ne!(a.peer_id(), b.peer_id());
    }

    #[tokio::test]
    async fn test_wipe_clears_sessions_and_dedup() {
        let (node, _events) = BitchatNode::builder().build("alice");

        // Prime some state.
        let peer = PeerId::new([9; 8]);
        let _ = node.processor().make_handshake_frame(peer).unwrap();
        assert_eq!(node.noise().session_count(), 1);
        assert!(node.processor().router().dedup_len() > 0);

        node.emergency_wipe().await;
        assert_eq!(node.noise().session_count(), 0);
        assert_eq!(node.processor().router().dedup_len(), 0);
    }
}
