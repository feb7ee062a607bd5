//! In-memory radio drivers for hermetic multi-node tests
//!
//! Each "air" is a hub connecting the radios of several simulated devices.
//! Range is explicit: only nodes joined by an edge hear each other, which
//! is how multi-hop topologies are built.

// Each test binary uses a subset of this harness.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use bitchat_core::{EventReceiver, Result, TransportEvent, TransportState};
use bitchat_link::{LinkDeviceId, LinkRadio, LinkRadioEvent, LinkRadioEvents};
use bitchat_rendezvous::{PeerHandle, RendezvousRadio, RendezvousRadioEvent, RendezvousRadioEvents};

const RADIO_BUFFER: usize = 256;

fn edge(a: u64, b: u64) -> (u64, u64) {
    (a.min(b), a.max(b))
}

// ----------------------------------------------------------------------------
// Link Air
// ----------------------------------------------------------------------------

#[derive(Default)]
struct LinkAirInner {
    nodes: HashMap<u64, LinkNode>,
    links: HashSet<(u64, u64)>,
}

struct LinkNode {
    events: mpsc::Sender<LinkRadioEvent>,
    announce: Vec<u8>,
    started: bool,
}

/// Hub for [`TestLinkRadio`]s
#[derive(Clone, Default)]
pub struct LinkAir {
    inner: Arc<Mutex<LinkAirInner>>,
}

impl LinkAir {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the radio for one device
    pub fn radio(&self, id: u64) -> (Arc<TestLinkRadio>, LinkRadioEvents) {
        let (tx, rx) = mpsc::channel(RADIO_BUFFER);
        self.inner.lock().unwrap().nodes.insert(
            id,
            LinkNode {
                events: tx,
                announce: Vec::new(),
                started: false,
            },
        );
        (
            Arc::new(TestLinkRadio {
                id,
                inner: Arc::clone(&self.inner),
            }),
            rx,
        )
    }

    /// Simulate `scanner` discovering `advertiser`'s advertisement
    pub fn discover(&self, scanner: u64, advertiser: u64) {
        let events = {
            let inner = self.inner.lock().unwrap();
            inner.nodes.get(&scanner).map(|node| node.events.clone())
        };
        if let Some(events) = events {
            let _ = events.try_send(LinkRadioEvent::DeviceDiscovered {
                device: LinkDeviceId(advertiser),
            });
        }
    }
}

/// In-memory link radio; device ids are the remote node's hub id
pub struct TestLinkRadio {
    id: u64,
    inner: Arc<Mutex<LinkAirInner>>,
}

impl TestLinkRadio {
    fn remote_events(&self, device: LinkDeviceId) -> Option<mpsc::Sender<LinkRadioEvent>> {
        let inner = self.inner.lock().unwrap();
        inner.nodes.get(&device.0).map(|node| node.events.clone())
    }

    fn has_link(&self, device: LinkDeviceId) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.links.contains(&edge(self.id, device.0))
    }
}

#[async_trait]
impl LinkRadio for TestLinkRadio {
    async fn state(&self) -> TransportState {
        TransportState::PoweredOn
    }

    async fn start(&self, _service_id: uuid::Uuid, _characteristic_id: uuid::Uuid) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .nodes
            .get_mut(&self.id)
            .expect("radio registered")
            .started = true;
        Ok(())
    }

    async fn stop(&self) {
        self.inner
            .lock()
            .unwrap()
            .links
            .retain(|(a, b)| *a != self.id && *b != self.id);
    }

    async fn set_announce_payload(&self, payload: Vec<u8>) {
        if let Some(node) = self.inner.lock().unwrap().nodes.get_mut(&self.id) {
            node.announce = payload;
        }
    }

    async fn connect(&self, device: LinkDeviceId) -> Result<()> {
        let remote = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.nodes.get(&device.0).map(|n| n.started).unwrap_or(false) {
                return Err(bitchat_core::BitchatError::channel_error("device offline"));
            }
            inner.links.insert(edge(self.id, device.0));
            inner.nodes.get(&device.0).map(|node| node.events.clone())
        };
        if let Some(events) = remote {
            let _ = events.try_send(LinkRadioEvent::InboundConnected {
                device: LinkDeviceId(self.id),
            });
        }
        Ok(())
    }

    async fn disconnect(&self, device: LinkDeviceId) {
        let remote = {
            let mut inner = self.inner.lock().unwrap();
            inner.links.remove(&edge(self.id, device.0));
            inner.nodes.get(&device.0).map(|node| node.events.clone())
        };
        if let Some(events) = remote {
            let _ = events.try_send(LinkRadioEvent::Disconnected {
                device: LinkDeviceId(self.id),
            });
        }
    }

    async fn read_announce(&self, device: LinkDeviceId) -> Result<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        inner
            .nodes
            .get(&device.0)
            .map(|node| node.announce.clone())
            .ok_or_else(|| bitchat_core::BitchatError::channel_error("device offline"))
    }

    async fn write_chunk(&self, device: LinkDeviceId, chunk: Vec<u8>) -> Result<()> {
        if !self.has_link(device) {
            return Err(bitchat_core::BitchatError::channel_error("no link"));
        }
        if let Some(events) = self.remote_events(device) {
            let _ = events
                .send(LinkRadioEvent::Data {
                    device: LinkDeviceId(self.id),
                    chunk,
                })
                .await;
        }
        Ok(())
    }

    async fn enable_notifications(&self, _device: LinkDeviceId) -> Result<()> {
        Ok(())
    }

    async fn mtu(&self, _device: LinkDeviceId) -> usize {
        512
    }
}

// ----------------------------------------------------------------------------
// Rendezvous Air
// ----------------------------------------------------------------------------

#[derive(Default)]
struct RendezvousAirInner {
    nodes: HashMap<u64, RendezvousNode>,
    edges: HashSet<(u64, u64)>,
}

struct RendezvousNode {
    events: mpsc::Sender<RendezvousRadioEvent>,
    service_info: Option<Vec<u8>>,
    subscribed: bool,
}

/// Hub for [`TestRendezvousRadio`]s
#[derive(Clone, Default)]
pub struct RendezvousAir {
    inner: Arc<Mutex<RendezvousAirInner>>,
}

impl RendezvousAir {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the radio for one device
    pub fn radio(&self, id: u64) -> (Arc<TestRendezvousRadio>, RendezvousRadioEvents) {
        let (tx, rx) = mpsc::channel(RADIO_BUFFER);
        self.inner.lock().unwrap().nodes.insert(
            id,
            RendezvousNode {
                events: tx,
                service_info: None,
                subscribed: false,
            },
        );
        (
            Arc::new(TestRendezvousRadio {
                id,
                inner: Arc::clone(&self.inner),
            }),
            rx,
        )
    }

    /// Bring two devices into radio range. Discovery fires both ways as
    /// soon as each side has published and subscribed.
    pub fn connect(&self, a: u64, b: u64) {
        let notifications = {
            let mut inner = self.inner.lock().unwrap();
            inner.edges.insert(edge(a, b));
            let mut out = Vec::new();
            for (subscriber, publisher) in [(a, b), (b, a)] {
                let found = match (inner.nodes.get(&subscriber), inner.nodes.get(&publisher)) {
                    (Some(sub), Some(publ)) if sub.subscribed => {
                        publ.service_info.as_ref().map(|info| {
                            (
                                sub.events.clone(),
                                RendezvousRadioEvent::PeerFound {
                                    handle: PeerHandle(publisher),
                                    service_info: info.clone(),
                                },
                            )
                        })
                    }
                    _ => None,
                };
                out.extend(found);
            }
            out
        };
        for (events, event) in notifications {
            let _ = events.try_send(event);
        }
    }

    /// Take two devices out of range
    pub fn disconnect(&self, a: u64, b: u64) {
        let notifications = {
            let mut inner = self.inner.lock().unwrap();
            inner.edges.remove(&edge(a, b));
            [(a, b), (b, a)]
                .into_iter()
                .filter_map(|(listener, lost)| {
                    inner.nodes.get(&listener).map(|node| {
                        (
                            node.events.clone(),
                            RendezvousRadioEvent::PeerLost {
                                handle: PeerHandle(lost),
                            },
                        )
                    })
                })
                .collect::<Vec<_>>()
        };
        for (events, event) in notifications {
            let _ = events.try_send(event);
        }
    }
}

/// In-memory rendezvous radio; peer handles are the hub ids of remote
/// devices
pub struct TestRendezvousRadio {
    id: u64,
    inner: Arc<Mutex<RendezvousAirInner>>,
}

#[async_trait]
impl RendezvousRadio for TestRendezvousRadio {
    async fn state(&self) -> TransportState {
        TransportState::PoweredOn
    }

    async fn publish(&self, service_info: Vec<u8>) -> Result<()> {
        if let Some(node) = self.inner.lock().unwrap().nodes.get_mut(&self.id) {
            node.service_info = Some(service_info);
        }
        Ok(())
    }

    async fn subscribe(&self) -> Result<()> {
        let notifications = {
            let mut inner = self.inner.lock().unwrap();
            if let Some(node) = inner.nodes.get_mut(&self.id) {
                node.subscribed = true;
            }
            let our_events = inner
                .nodes
                .get(&self.id)
                .map(|node| node.events.clone());
            let mut out = Vec::new();
            if let Some(our_events) = our_events {
                for (&other_id, other) in &inner.nodes {
                    if other_id == self.id || !inner.edges.contains(&edge(self.id, other_id)) {
                        continue;
                    }
                    if let Some(info) = &other.service_info {
                        out.push((
                            our_events.clone(),
                            RendezvousRadioEvent::PeerFound {
                                handle: PeerHandle(other_id),
                                service_info: info.clone(),
                            },
                        ));
                    }
                }
            }
            out
        };
        for (events, event) in notifications {
            let _ = events.try_send(event);
        }
        Ok(())
    }

    async fn send(&self, handle: PeerHandle, frame: Vec<u8>) -> Result<()> {
        let target = {
            let inner = self.inner.lock().unwrap();
            if !inner.edges.contains(&edge(self.id, handle.0)) {
                return Err(bitchat_core::BitchatError::channel_error("out of range"));
            }
            inner.nodes.get(&handle.0).map(|node| node.events.clone())
        };
        if let Some(events) = target {
            let _ = events
                .send(RendezvousRadioEvent::Message {
                    handle: PeerHandle(self.id),
                    frame,
                })
                .await;
        }
        Ok(())
    }

    async fn stop(&self) {
        if let Some(node) = self.inner.lock().unwrap().nodes.get_mut(&self.id) {
            node.service_info = None;
            node.subscribed = false;
        }
    }
}

// ----------------------------------------------------------------------------
// Event Helpers
// ----------------------------------------------------------------------------

/// Wait for the first delegate event matching `predicate`, discarding the
/// rest, failing the test after `timeout`.
pub async fn expect_event<T>(
    receiver: &mut EventReceiver,
    timeout: Duration,
    mut predicate: impl FnMut(&TransportEvent) -> Option<T>,
) -> T {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .expect("timed out waiting for delegate event");
        let event = tokio::time::timeout(remaining, receiver.recv())
            .await
            .expect("timed out waiting for delegate event")
            .expect("delegate channel closed");
        if let Some(value) = predicate(&event) {
            return value;
        }
    }
}

/// Assert that no event matching `predicate` arrives within `window`
pub async fn expect_no_event(
    receiver: &mut EventReceiver,
    window: Duration,
    mut predicate: impl FnMut(&TransportEvent) -> bool,
) {
    let deadline = tokio::time::Instant::now() + window;
    loop {
        let remaining = match deadline.checked_duration_since(tokio::time::Instant::now()) {
            Some(remaining) => remaining,
            None => return,
        };
        match tokio::time::timeout(remaining, receiver.recv()).await {
            Ok(Some(event)) => {
                assert!(!predicate(&event), "unexpected event: {event:?}");
            }
            Ok(None) | Err(_) => return,
        }
    }
}
