//! Session manager: one Noise session per peer behind a single mutex
//!
//! All handshake mutation, encryption, decryption, and eviction serialize
//! through [`NoiseService`]'s internal lock. Each operation is a point of
//! serialization, never a long critical section, and no caller holds the
//! lock across an await.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::config::SessionConfig;
use crate::errors::{BitchatError, Result, SessionError};
use crate::identity::NoiseKeyPair;
use crate::noise::session::{NoiseSession, SessionState};
use crate::types::{PeerId, SystemTimeSource, TimeSource};

/// Length of an XX first message; a handshake frame of exactly this size is
/// a fresh initiation (the bare ephemeral key).
const XX_INITIATION_SIZE: usize = 32;

// ----------------------------------------------------------------------------
// Session Manager
// ----------------------------------------------------------------------------

/// Owns the peer-id → session map. Callers go through [`NoiseService`].
#[derive(Debug)]
pub struct NoiseSessionManager<T: TimeSource = SystemTimeSource> {
    local_static: NoiseKeyPair,
    sessions: HashMap<PeerId, NoiseSession>,
    config: SessionConfig,
    time_source: T,
}

impl<T: TimeSource> NoiseSessionManager<T> {
    /// Create a manager around the local static keypair
    pub fn new(local_static: NoiseKeyPair, config: SessionConfig, time_source: T) -> Self {
        Self {
            local_static,
            sessions: HashMap::new(),
            config,
            time_source,
        }
    }

    /// Start (or restart) an outbound handshake, returning XX message one
    pub fn initiate_handshake(&mut self, peer_id: PeerId) -> Result<Vec<u8>> {
        let now = self.time_source.now();
        let mut session =
            NoiseSession::new_outbound(peer_id, &self.local_static, self.config.clone());
        let first = session.start_handshake(now)?;
        self.sessions.insert(peer_id, session);
        Ok(first)
    }

    /// Feed an incoming handshake frame, applying the restart rules:
    /// no session creates a responder; an established or handshaking
    /// session receiving a 32-byte frame is discarded and restarted (the
    /// peer lost state); anything else goes to the existing handshake. Any
    /// handshake failure evicts the session so the peer can retry cleanly.
    pub fn handle_handshake_frame(
        &mut self,
        peer_id: PeerId,
        frame: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        let now = self.time_source.now();

        let restart = match self.sessions.get(&peer_id) {
            None => true,
            Some(session) if session.state() == SessionState::Failed => true,
            Some(session) if session.is_established() => {
                if frame.len() == XX_INITIATION_SIZE {
                    debug!(%peer_id, "established peer re-initiated; restarting session");
                    true
                } else {
                    // A stray encrypted frame routed at an established
                    // session is dropped without tearing the session down.
                    return Err(BitchatError::Noise(
                        crate::errors::NoiseError::HandshakeAlreadyComplete,
                    ));
                }
            }
            Some(_) if frame.len() == XX_INITIATION_SIZE => {
                debug!(%peer_id, "handshake restarted by peer");
                true
            }
            Some(_) => false,
        };

        if restart {
            let session =
                NoiseSession::new_inbound(peer_id, &self.local_static, self.config.clone());
            self.sessions.insert(peer_id, session);
        }

        let session = self
            .sessions
            .get_mut(&peer_id)
            .ok_or_else(|| BitchatError::session_not_found(peer_id))?;

        match session.process_handshake(frame, now) {
            Ok(response) => Ok(response),
            Err(err) => {
                warn!(%peer_id, error = %err, "handshake failed; evicting session");
                self.sessions.remove(&peer_id);
                Err(BitchatError::Session(SessionError::HandshakeFailed {
                    peer_id: peer_id.to_string(),
                    reason: err.to_string(),
                }))
            }
        }
    }

    /// Encrypt for an established peer
    pub fn encrypt(&mut self, peer_id: PeerId, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.session_mut(peer_id)?.encrypt(plaintext)
    }

    /// Decrypt from an established peer
    pub fn decrypt(&mut self, peer_id: PeerId, wire: &[u8]) -> Result<Vec<u8>> {
        self.session_mut(peer_id)?.decrypt(wire)
    }

    /// True when an established session exists for the peer
    pub fn is_established(&self, peer_id: PeerId) -> bool {
        self.sessions
            .get(&peer_id)
            .map(NoiseSession::is_established)
            .unwrap_or(false)
    }

    /// Session state, when a session exists
    pub fn session_state(&self, peer_id: PeerId) -> Option<SessionState> {
        self.sessions.get(&peer_id).map(NoiseSession::state)
    }

    /// The peer's static key once learned
    pub fn remote_static_key(&self, peer_id: PeerId) -> Option<[u8; 32]> {
        self.sessions
            .get(&peer_id)
            .and_then(NoiseSession::remote_static_key)
    }

    /// Whether the session has aged or trafficked past its rekey point
    pub fn needs_rekey(&self, peer_id: PeerId) -> bool {
        let now = self.time_source.now();
        self.sessions
            .get(&peer_id)
            .map(|session| session.needs_rekey(now))
            .unwrap_or(false)
    }

    /// Tear down one peer's session
    pub fn remove_session(&mut self, peer_id: PeerId) {
        if let Some(mut session) = self.sessions.remove(&peer_id) {
            session.mark_failed();
        }
    }

    /// Tear down everything (emergency wipe)
    pub fn clear(&mut self) {
        for session in self.sessions.values_mut() {
            session.mark_failed();
        }
        self.sessions.clear();
    }

    /// Number of sessions, in any state
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Peers with established sessions
    pub fn established_peers(&self) -> Vec<PeerId> {
        self.sessions
            .iter()
            .filter(|(_, session)| session.is_established())
            .map(|(peer_id, _)| *peer_id)
            .collect()
    }

    fn session_mut(&mut self, peer_id: PeerId) -> Result<&mut NoiseSession> {
        self.sessions
            .get_mut(&peer_id)
            .ok_or_else(|| BitchatError::session_not_found(peer_id))
    }
}

// ----------------------------------------------------------------------------
// Noise Service
// ----------------------------------------------------------------------------

/// Thread-safe facade over the session manager, shared by every transport.
///
/// A session established over one transport is usable over another because
/// they all hold the same service.
pub struct NoiseService<T: TimeSource = SystemTimeSource> {
    inner: Mutex<NoiseSessionManager<T>>,
}

impl<T: TimeSource> core::fmt::Debug for NoiseService<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NoiseService").finish_non_exhaustive()
    }
}

impl NoiseService<SystemTimeSource> {
    /// Create a service with the wall clock
    pub fn new(local_static: NoiseKeyPair, config: SessionConfig) -> Self {
        Self::with_time_source(local_static, config, SystemTimeSource)
    }
}

impl<T: TimeSource> NoiseService<T> {
    /// Create a service with an explicit time source
    pub fn with_time_source(local_static: NoiseKeyPair, config: SessionConfig, time: T) -> Self {
        Self {
            inner: Mutex::new(NoiseSessionManager::new(local_static, config, time)),
        }
    }

    /// Run `f` under the session lock, recovering from poisoning; the
    /// manager holds no invariants that survive a panicking thread anyway.
    fn with_manager<R>(&self, f: impl FnOnce(&mut NoiseSessionManager<T>) -> R) -> R {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    pub fn initiate_handshake(&self, peer_id: PeerId) -> Result<Vec<u8>> {
        self.with_manager(|manager| manager.initiate_handshake(peer_id))
    }

    pub fn handle_handshake_frame(&self, peer_id: PeerId, frame: &[u8]) -> Result<Option<Vec<u8>>> {
        self.with_manager(|manager| manager.handle_handshake_frame(peer_id, frame))
    }

    pub fn encrypt(&self, peer_id: PeerId, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.with_manager(|manager| manager.encrypt(peer_id, plaintext))
    }

    pub fn decrypt(&self, peer_id: PeerId, wire: &[u8]) -> Result<Vec<u8>> {
        self.with_manager(|manager| manager.decrypt(peer_id, wire))
    }

    pub fn is_established(&self, peer_id: PeerId) -> bool {
        self.with_manager(|manager| manager.is_established(peer_id))
    }

    pub fn session_state(&self, peer_id: PeerId) -> Option<SessionState> {
        self.with_manager(|manager| manager.session_state(peer_id))
    }

    pub fn remote_static_key(&self, peer_id: PeerId) -> Option<[u8; 32]> {
        self.with_manager(|manager| manager.remote_static_key(peer_id))
    }

    pub fn needs_rekey(&self, peer_id: PeerId) -> bool {
        self.with_manager(|manager| manager.needs_rekey(peer_id))
    }

    pub fn remove_session(&self, peer_id: PeerId) {
        self.with_manager(|manager| manager.remove_session(peer_id));
    }

    pub fn clear(&self) {
        self.with_manager(|manager| manager.clear());
    }

    pub fn session_count(&self) -> usize {
        self.with_manager(|manager| manager.session_count())
    }

    pub fn established_peers(&self) -> Vec<PeerId> {
        self.with_manager(|manager| manager.established_peers())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
