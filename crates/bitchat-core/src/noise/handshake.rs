//! Noise XX handshake state machine
//!
//! Three messages establish a mutually authenticated session:
//!
//! ```text
//! → e
//! ← e, ee, s, es
//! → s, se
//! ```
//!
//! Static keys travel encrypted inside the handshake, so each side learns
//! the other's identity key at step two or three and can derive the peer id
//! from it.

use zeroize::Zeroize;

use crate::errors::{BitchatError, NoiseError, Result};
use crate::identity::NoiseKeyPair;
use crate::noise::cipher::CipherState;
use crate::noise::symmetric::{SymmetricState, NOISE_PROTOCOL_NAME};

/// X25519 public key length
const PUBLIC_KEY_SIZE: usize = 32;

// ----------------------------------------------------------------------------
// Handshake Role
// ----------------------------------------------------------------------------

/// Which side of the XX pattern this state machine plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    /// Sends message one
    Initiator,
    /// Responds to message one
    Responder,
}

// ----------------------------------------------------------------------------
// Handshake State
// ----------------------------------------------------------------------------

/// State machine for one XX handshake
pub struct HandshakeState {
    role: HandshakeRole,
    symmetric: SymmetricState,
    local_static: NoiseKeyPair,
    local_ephemeral: Option<NoiseKeyPair>,
    remote_static: Option<[u8; 32]>,
    remote_ephemeral: Option<[u8; 32]>,
    message_index: u8,
}

impl core::fmt::Debug for HandshakeState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandshakeState")
            .field("role", &self.role)
            .field("message_index", &self.message_index)
            .finish_non_exhaustive()
    }
}

impl HandshakeState {
    /// Create a handshake state for the given role
    pub fn new(role: HandshakeRole, local_static: &NoiseKeyPair) -> Self {
        let mut symmetric = SymmetricState::new(NOISE_PROTOCOL_NAME);
        // XX has no pre-message public keys; only the empty prologue is
        // mixed before message one.
        symmetric.mix_hash(b"");

        Self {
            role,
            symmetric,
            local_static: local_static.clone(),
            local_ephemeral: None,
            remote_static: None,
            remote_ephemeral: None,
            message_index: 0,
        }
    }

    /// True once all three messages have been processed
    pub fn is_finished(&self) -> bool {
        self.message_index >= 3
    }

    /// The peer's static key, available after XX message two (initiator
    /// side) or three (responder side)
    pub fn remote_static_key(&self) -> Option<[u8; 32]> {
        self.remote_static
    }

    /// Whether this state machine writes or reads the next message
    pub fn is_my_turn(&self) -> bool {
        let initiator_writes = self.message_index % 2 == 0;
        match self.role {
            HandshakeRole::Initiator => initiator_writes,
            HandshakeRole::Responder => !initiator_writes,
        }
    }

    /// Produce the next handshake message carrying `payload`
    pub fn write_message(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        if self.is_finished() {
            return Err(BitchatError::Noise(NoiseError::HandshakeAlreadyComplete));
        }
        if !self.is_my_turn() {
            return Err(BitchatError::Noise(NoiseError::OutOfOrderHandshake));
        }

        let mut message = Vec::new();
        match (self.role, self.message_index) {
            // → e
            (HandshakeRole::Initiator, 0) => {
                let ephemeral = self.generate_ephemeral();
                message.extend_from_slice(&ephemeral);
            }
            // ← e, ee, s, es
            (HandshakeRole::Responder, 1) => {
                let ephemeral = self.generate_ephemeral();
                message.extend_from_slice(&ephemeral);
                self.dh_ephemeral(Token::RemoteEphemeral)?;
                let sealed_static = self
                    .symmetric
                    .encrypt_and_hash(&self.local_static.public_key_bytes())?;
                message.extend_from_slice(&sealed_static);
                self.dh_static(Token::RemoteEphemeral)?;
            }
            // → s, se
            (HandshakeRole::Initiator, 2) => {
                let sealed_static = self
                    .symmetric
                    .encrypt_and_hash(&self.local_static.public_key_bytes())?;
                message.extend_from_slice(&sealed_static);
                self.dh_static(Token::RemoteEphemeral)?;
            }
            _ => return Err(BitchatError::Noise(NoiseError::OutOfOrderHandshake)),
        }

        message.extend_from_slice(&self.symmetric.encrypt_and_hash(payload)?);
        self.message_index += 1;
        Ok(message)
    }

    /// Consume the next handshake message, returning its payload
    pub fn read_message(&mut self, message: &[u8]) -> Result<Vec<u8>> {
        if self.is_finished() {
            return Err(BitchatError::Noise(NoiseError::HandshakeAlreadyComplete));
        }
        if self.is_my_turn() {
            return Err(BitchatError::Noise(NoiseError::OutOfOrderHandshake));
        }

        let mut rest = message;
        match (self.role, self.message_index) {
            // → e
            (HandshakeRole::Responder, 0) => {
                rest = self.read_ephemeral(rest)?;
            }
            // ← e, ee, s, es
            (HandshakeRole::Initiator, 1) => {
                rest = self.read_ephemeral(rest)?;
                self.dh_ephemeral(Token::RemoteEphemeral)?;
                rest = self.read_sealed_static(rest)?;
                self.dh_ephemeral(Token::RemoteStatic)?;
            }
            // → s, se
            (HandshakeRole::Responder, 2) => {
                rest = self.read_sealed_static(rest)?;
                self.dh_ephemeral(Token::RemoteStatic)?;
            }
            _ => return Err(BitchatError::Noise(NoiseError::OutOfOrderHandshake)),
        }

        let payload = self.symmetric.decrypt_and_hash(rest)?;
        self.message_index += 1;
        Ok(payload)
    }

    /// Derive the transport cipher pair, oriented (send, receive) for this
    /// role. The symmetric state is cleared by the derivation.
    pub fn split(mut self) -> Result<(CipherState, CipherState)> {
        if !self.is_finished() {
            return Err(BitchatError::Noise(NoiseError::OutOfOrderHandshake));
        }
        let (first, second) = self.symmetric.split()?;
        match self.role {
            HandshakeRole::Initiator => Ok((first, second)),
            HandshakeRole::Responder => Ok((second, first)),
        }
    }

    fn generate_ephemeral(&mut self) -> [u8; 32] {
        let ephemeral = NoiseKeyPair::generate();
        let public = ephemeral.public_key_bytes();
        self.symmetric.mix_hash(&public);
        self.local_ephemeral = Some(ephemeral);
        public
    }

    fn read_ephemeral<'a>(&mut self, message: &'a [u8]) -> Result<&'a [u8]> {
        if message.len() < PUBLIC_KEY_SIZE {
            return Err(BitchatError::Noise(NoiseError::InvalidPublicKey));
        }
        let (key, rest) = message.split_at(PUBLIC_KEY_SIZE);
        let mut remote = [0u8; 32];
        remote.copy_from_slice(key);
        if remote == [0u8; 32] {
            return Err(BitchatError::Noise(NoiseError::InvalidPublicKey));
        }
        self.symmetric.mix_hash(&remote);
        self.remote_ephemeral = Some(remote);
        Ok(rest)
    }

    fn read_sealed_static<'a>(&mut self, message: &'a [u8]) -> Result<&'a [u8]> {
        let sealed_len = self.symmetric.sealed_len(PUBLIC_KEY_SIZE);
        if message.len() < sealed_len {
            return Err(BitchatError::Noise(NoiseError::InvalidCiphertext));
        }
        let (sealed, rest) = message.split_at(sealed_len);
        let plain = self.symmetric.decrypt_and_hash(sealed)?;
        let remote: [u8; 32] = plain
            .as_slice()
            .try_into()
            .map_err(|_| BitchatError::Noise(NoiseError::InvalidPublicKey))?;
        if remote == [0u8; 32] {
            return Err(BitchatError::Noise(NoiseError::InvalidPublicKey));
        }
        self.remote_static = Some(remote);
        Ok(rest)
    }

    /// DH with our ephemeral key against the named remote key, folding the
    /// shared secret into the chaining key. The secret is zeroized as soon
    /// as it has been mixed.
    fn dh_ephemeral(&mut self, remote: Token) -> Result<()> {
        let local = self
            .local_ephemeral
            .clone()
            .ok_or(BitchatError::Noise(NoiseError::MissingKeyMaterial))?;
        self.mix_dh(local, remote)
    }

    /// DH with our static key against the named remote key
    fn dh_static(&mut self, remote: Token) -> Result<()> {
        let local = self.local_static.clone();
        self.mix_dh(local, remote)
    }

    fn mix_dh(&mut self, local: NoiseKeyPair, remote: Token) -> Result<()> {
        let remote_key = match remote {
            Token::RemoteEphemeral => self.remote_ephemeral,
            Token::RemoteStatic => self.remote_static,
        }
        .ok_or(BitchatError::Noise(NoiseError::MissingKeyMaterial))?;

        let shared = local.diffie_hellman(&remote_key)?;
        let mut secret = *shared.as_bytes();
        drop(shared);
        let mixed = self.symmetric.mix_key(&secret);
        secret.zeroize();
        mixed
    }
}

/// Which remote key a DH token uses
#[derive(Debug, Clone, Copy)]
enum Token {
    RemoteEphemeral,
    RemoteStatic,
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
