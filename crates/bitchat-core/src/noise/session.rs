//! A single Noise session with one remote peer
//!
//! Wraps the XX handshake and, once it completes, the split transport
//! cipher pair, together with the counters and timing that drive rekey
//! decisions.

use crate::config::SessionConfig;
use crate::errors::{BitchatError, NoiseError, Result, SessionError};
use crate::identity::NoiseKeyPair;
use crate::noise::cipher::CipherState;
use crate::noise::handshake::{HandshakeRole, HandshakeState};
use crate::types::{PeerId, Timestamp};

// ----------------------------------------------------------------------------
// Session State
// ----------------------------------------------------------------------------

/// Session states in the connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Performing the Noise handshake
    Handshaking,
    /// Handshake complete, transport ciphers live
    Established,
    /// Terminal failure; the session is awaiting eviction
    Failed,
}

// ----------------------------------------------------------------------------
// Noise Session
// ----------------------------------------------------------------------------

/// One peer's session: handshake state or split ciphers, never both.
#[derive(Debug)]
pub struct NoiseSession {
    peer_id: PeerId,
    role: HandshakeRole,
    state: SessionState,
    handshake: Option<HandshakeState>,
    send_cipher: Option<CipherState>,
    recv_cipher: Option<CipherState>,
    remote_static: Option<[u8; 32]>,
    established_at: Option<Timestamp>,
    messages_sent: u64,
    messages_received: u64,
    config: SessionConfig,
}

impl NoiseSession {
    /// Create an initiator session
    pub fn new_outbound(peer_id: PeerId, local_static: &NoiseKeyPair, config: SessionConfig) -> Self {
        Self::new(peer_id, HandshakeRole::Initiator, local_static, config)
    }

    /// Create a responder session
    pub fn new_inbound(peer_id: PeerId, local_static: &NoiseKeyPair, config: SessionConfig) -> Self {
        Self::new(peer_id, HandshakeRole::Responder, local_static, config)
    }

    fn new(
        peer_id: PeerId,
        role: HandshakeRole,
        local_static: &NoiseKeyPair,
        config: SessionConfig,
    ) -> Self {
        Self {
            peer_id,
            role,
            state: SessionState::Handshaking,
            handshake: Some(HandshakeState::new(role, local_static)),
            send_cipher: None,
            recv_cipher: None,
            remote_static: None,
            established_at: None,
            messages_sent: 0,
            messages_received: 0,
            config,
        }
    }

    /// Peer this session belongs to
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Role we played in the handshake
    pub fn role(&self) -> HandshakeRole {
        self.role
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == SessionState::Established
    }

    /// The peer's static key, once the handshake has revealed it
    pub fn remote_static_key(&self) -> Option<[u8; 32]> {
        self.remote_static
    }

    /// When the transport ciphers went live
    pub fn established_at(&self) -> Option<Timestamp> {
        self.established_at
    }

    /// Messages encrypted so far
    pub fn messages_sent(&self) -> u64 {
        self.messages_sent
    }

    /// Messages decrypted so far
    pub fn messages_received(&self) -> u64 {
        self.messages_received
    }

    /// Produce the opening handshake message (initiator only)
    pub fn start_handshake(&mut self, now: Timestamp) -> Result<Vec<u8>> {
        let handshake = self.handshake_mut()?;
        let message = handshake.write_message(b"")?;
        self.after_handshake_step(now)?;
        Ok(message)
    }

    /// Feed an incoming handshake frame; returns our next frame when the
    /// pattern calls for one.
    pub fn process_handshake(&mut self, frame: &[u8], now: Timestamp) -> Result<Option<Vec<u8>>> {
        let handshake = self.handshake_mut()?;
        handshake.read_message(frame)?;

        let response = if !handshake.is_finished() && handshake.is_my_turn() {
            Some(handshake.write_message(b"")?)
        } else {
            None
        };

        self.after_handshake_step(now)?;
        Ok(response)
    }

    /// Encrypt an application payload (established sessions only)
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = match (self.state, self.send_cipher.as_mut()) {
            (SessionState::Established, Some(cipher)) => cipher,
            _ => return Err(self.not_established()),
        };
        let wire = cipher.encrypt(plaintext, b"")?;
        self.messages_sent += 1;
        Ok(wire)
    }

    /// Decrypt an application payload (established sessions only)
    pub fn decrypt(&mut self, wire: &[u8]) -> Result<Vec<u8>> {
        let cipher = match (self.state, self.recv_cipher.as_mut()) {
            (SessionState::Established, Some(cipher)) => cipher,
            _ => return Err(self.not_established()),
        };
        let plaintext = cipher.decrypt(wire, b"")?;
        self.messages_received += 1;
        Ok(plaintext)
    }

    /// Whether traffic volume or age says this session must renegotiate
    pub fn needs_rekey(&self, now: Timestamp) -> bool {
        if self.state != SessionState::Established {
            return false;
        }
        if self.messages_sent > self.config.rekey_message_count
            || self.messages_received > self.config.rekey_message_count
        {
            return true;
        }
        match self.established_at {
            Some(at) => now.millis_since(at) > self.config.rekey_interval.as_millis() as u64,
            None => false,
        }
    }

    /// Drop all key material and mark the session terminally failed
    pub fn mark_failed(&mut self) {
        self.state = SessionState::Failed;
        self.handshake = None;
        if let Some(ref mut cipher) = self.send_cipher {
            cipher.reset();
        }
        if let Some(ref mut cipher) = self.recv_cipher {
            cipher.reset();
        }
        self.send_cipher = None;
        self.recv_cipher = None;
    }

    fn handshake_mut(&mut self) -> Result<&mut HandshakeState> {
        if self.state != SessionState::Handshaking {
            return Err(BitchatError::Noise(NoiseError::HandshakeAlreadyComplete));
        }
        self.handshake
            .as_mut()
            .ok_or(BitchatError::Noise(NoiseError::OutOfOrderHandshake))
    }

    /// Promote to Established once the handshake finishes
    fn after_handshake_step(&mut self, now: Timestamp) -> Result<()> {
        let finished = self
            .handshake
            .as_ref()
            .map(HandshakeState::is_finished)
            .unwrap_or(false);
        if !finished {
            return Ok(());
        }

        let handshake = self
            .handshake
            .take()
            .ok_or(BitchatError::Noise(NoiseError::OutOfOrderHandshake))?;
        self.remote_static = handshake.remote_static_key();
        let (send_cipher, recv_cipher) = handshake.split()?;
        self.send_cipher = Some(send_cipher);
        self.recv_cipher = Some(recv_cipher);
        self.state = SessionState::Established;
        self.established_at = Some(now);
        Ok(())
    }

    fn not_established(&self) -> BitchatError {
        BitchatError::Session(SessionError::NotEstablished {
            peer_id: self.peer_id.to_string(),
        })
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
