//! Error types for the BitChat protocol
//!
//! This module contains all error types used throughout the BitChat core,
//! split by concern (packet decoding, Noise cryptography, sessions,
//! transports) and unified under the main [`BitchatError`] type.

// ----------------------------------------------------------------------------
// Packet Errors
// ----------------------------------------------------------------------------

/// Packet framing and validation errors.
///
/// Every variant is recoverable: a malformed frame is dropped and the peer
/// connection stays up.
#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("Packet truncated while reading {context}")]
    Truncated { context: &'static str },
    #[error("Unsupported protocol version: {version}")]
    UnsupportedVersion { version: u8 },
    #[error("Unknown message type: {message_type:#04x}")]
    UnknownMessageType { message_type: u8 },
    #[error("Payload too large ({actual} bytes, max {max})")]
    PayloadTooLarge { actual: usize, max: usize },
    #[error("Invalid sender ID")]
    InvalidSenderId,
    #[error("Invalid recipient ID")]
    InvalidRecipientId,
    #[error("Route may carry at most {max} hops (got {actual})")]
    RouteTooLong { actual: usize, max: usize },
    #[error("Decompression failed")]
    DecompressionFailed,
    #[error("Decompression bomb rejected (ratio {ratio})")]
    DecompressionBomb { ratio: u64 },
    #[error("Compression failed")]
    CompressionFailed,
    #[error("Malformed message payload: {reason}")]
    MalformedMessage { reason: &'static str },
    #[error("{message}")]
    Generic { message: String },
}

impl From<&str> for PacketError {
    fn from(message: &str) -> Self {
        PacketError::Generic {
            message: message.to_string(),
        }
    }
}

// ----------------------------------------------------------------------------
// Noise Errors
// ----------------------------------------------------------------------------

/// Errors raised by the Noise handshake and transport ciphers.
///
/// Fatal for the operation, not the process: a session that hits one of
/// these enters `Failed` and is evicted so a later re-handshake can recover.
#[derive(Debug, thiserror::Error)]
pub enum NoiseError {
    #[error("Cipher is not initialized")]
    UninitializedCipher,
    #[error("Send nonce exhausted, session must be rekeyed")]
    NonceExhausted,
    #[error("Invalid ciphertext")]
    InvalidCiphertext,
    #[error("Replay detected for counter {counter}")]
    ReplayDetected { counter: u64 },
    #[error("Handshake is already complete")]
    HandshakeAlreadyComplete,
    #[error("Handshake message out of order")]
    OutOfOrderHandshake,
    #[error("Missing key material for DH token")]
    MissingKeyMaterial,
    #[error("Invalid remote public key")]
    InvalidPublicKey,
    #[error("Handshake authentication failed")]
    AuthenticationFailed,
}

// ----------------------------------------------------------------------------
// Session Errors
// ----------------------------------------------------------------------------

/// Session lifecycle errors surfaced by the session manager.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("No session for peer {peer_id}")]
    SessionNotFound { peer_id: String },
    #[error("Session with peer {peer_id} is not yet established")]
    NotEstablished { peer_id: String },
    #[error("Handshake failed with peer {peer_id}: {reason}")]
    HandshakeFailed { peer_id: String, reason: String },
}

// ----------------------------------------------------------------------------
// Transport Errors
// ----------------------------------------------------------------------------

/// Transport I/O errors. Reported via the delegate; the peer is marked
/// disconnected and maintenance retries implicitly.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Radio send failed to peer {peer_id}: {reason}")]
    SendFailed { peer_id: String, reason: String },
    #[error("Broadcast failed: {reason}")]
    BroadcastFailed { reason: String },
    #[error("Transport {name} is not available")]
    Unavailable { name: &'static str },
    #[error("Peer not reachable: {peer_id}")]
    PeerNotReachable { peer_id: String },
    #[error("Link limit reached ({limit} concurrent links)")]
    TooManyLinks { limit: usize },
    #[error("Invalid radio frame: {reason}")]
    InvalidFrame { reason: &'static str },
}

// ----------------------------------------------------------------------------
// Core Error
// ----------------------------------------------------------------------------

/// Core error type for the BitChat protocol
#[derive(Debug, thiserror::Error)]
pub enum BitchatError {
    #[error("Invalid packet: {0}")]
    InvalidPacket(#[from] PacketError),

    #[error("Noise protocol error: {0}")]
    Noise(#[from] NoiseError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Message rejected by policy: {reason}")]
    Policy { reason: String },

    /// Channel communication error (internal plumbing)
    #[error("Channel error: {message}")]
    Channel { message: String },
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl BitchatError {
    /// Create an invalid packet error with a message
    pub fn invalid_packet<T: Into<String>>(message: T) -> Self {
        BitchatError::InvalidPacket(PacketError::Generic {
            message: message.into(),
        })
    }

    /// Create a session not found error
    pub fn session_not_found(peer_id: crate::types::PeerId) -> Self {
        BitchatError::Session(SessionError::SessionNotFound {
            peer_id: peer_id.to_string(),
        })
    }

    /// Create a handshake failed error
    pub fn handshake_failed<R: Into<String>>(peer_id: crate::types::PeerId, reason: R) -> Self {
        BitchatError::Session(SessionError::HandshakeFailed {
            peer_id: peer_id.to_string(),
            reason: reason.into(),
        })
    }

    /// Create a policy rejection with a reason
    pub fn policy<T: Into<String>>(reason: T) -> Self {
        BitchatError::Policy {
            reason: reason.into(),
        }
    }

    /// Create a channel error with a message
    pub fn channel_error<T: Into<String>>(message: T) -> Self {
        BitchatError::Channel {
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, BitchatError>;
pub type BitchatResult<T> = Result<T>;
