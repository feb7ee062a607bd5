//! Application chat message and its binary payload format
//!
//! A [`BitchatMessage`] rides inside `MESSAGE` packets and, for private
//! conversations, inside the `PRIVATE_MESSAGE` sub-type of `NOISE_ENCRYPTED`
//! payloads. The binary layout is part of the wire interface.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{BitchatError, PacketError, Result};
use crate::types::{PeerId, Timestamp};

// ----------------------------------------------------------------------------
// Delivery Status
// ----------------------------------------------------------------------------

/// Local delivery state of a message we sent.
///
/// Never serialized to the wire; delivery and read acknowledgments arrive as
/// `NOISE_ENCRYPTED` sub-types and move this state forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    /// Queued locally, not yet handed to a transport
    Sending,
    /// Written to at least one radio
    Sent,
    /// The recipient confirmed delivery
    Delivered { to: String, at: Timestamp },
    /// The recipient confirmed reading
    Read { by: String, at: Timestamp },
    /// Delivery failed
    Failed { reason: String },
    /// A broadcast reached only part of its audience
    PartiallyDelivered { reached: u32, total: u32 },
}

// ----------------------------------------------------------------------------
// Message Flags
// ----------------------------------------------------------------------------

const FLAG_IS_RELAY: u8 = 0x01;
const FLAG_IS_PRIVATE: u8 = 0x02;
const FLAG_HAS_ORIGINAL_SENDER: u8 = 0x04;
const FLAG_HAS_RECIPIENT_NICKNAME: u8 = 0x08;
const FLAG_HAS_SENDER_PEER_ID: u8 = 0x10;
const FLAG_HAS_MENTIONS: u8 = 0x20;

// ----------------------------------------------------------------------------
// BitChat Message
// ----------------------------------------------------------------------------

/// Application-level chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitchatMessage {
    /// Message id (UUID string)
    pub id: String,
    /// Sender nickname
    pub sender: String,
    /// Message content
    pub content: String,
    /// Creation timestamp
    pub timestamp: Timestamp,
    /// True when the message reached us through a relay
    pub is_relay: bool,
    /// True for private (Noise-encrypted) messages
    pub is_private: bool,
    /// Nickname of the original sender when relayed on their behalf
    pub original_sender: Option<String>,
    /// Recipient nickname for private messages
    pub recipient_nickname: Option<String>,
    /// Sender's short peer id string
    pub sender_peer_id: Option<String>,
    /// Nicknames mentioned in the content
    pub mentions: Option<Vec<String>>,
    /// Local delivery tracking; not part of the wire payload
    pub delivery_status: DeliveryStatus,
}

impl BitchatMessage {
    /// Create a public broadcast message
    pub fn new(sender: &str, content: &str, sender_peer_id: PeerId) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender: sender.to_string(),
            content: content.to_string(),
            timestamp: Timestamp::now(),
            is_relay: false,
            is_private: false,
            original_sender: None,
            recipient_nickname: None,
            sender_peer_id: Some(sender_peer_id.to_string()),
            mentions: None,
            delivery_status: DeliveryStatus::Sent,
        }
    }

    /// Create a private message; private messages start out `Sending`
    pub fn new_private(
        sender: &str,
        content: &str,
        sender_peer_id: PeerId,
        recipient_nickname: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender: sender.to_string(),
            content: content.to_string(),
            timestamp: Timestamp::now(),
            is_relay: false,
            is_private: true,
            original_sender: None,
            recipient_nickname: Some(recipient_nickname.to_string()),
            sender_peer_id: Some(sender_peer_id.to_string()),
            mentions: None,
            delivery_status: DeliveryStatus::Sending,
        }
    }

    /// Attach mentions
    #[must_use]
    pub fn with_mentions(mut self, mentions: Vec<String>) -> Self {
        self.mentions = Some(mentions);
        self
    }

    /// Serialize to the binary payload format.
    ///
    /// Layout: flags byte, 8-byte big-endian timestamp (ms), then
    /// length-prefixed id, sender (1-byte lengths) and content (2-byte
    /// length), then the optional fields in flag order, each with a 1-byte
    /// length (mentions is a count plus repeated length-prefixed strings).
    pub fn to_binary(&self) -> Vec<u8> {
        let mut flags = 0u8;
        if self.is_relay {
            flags |= FLAG_IS_RELAY;
        }
        if self.is_private {
            flags |= FLAG_IS_PRIVATE;
        }
        if self.original_sender.is_some() {
            flags |= FLAG_HAS_ORIGINAL_SENDER;
        }
        if self.recipient_nickname.is_some() {
            flags |= FLAG_HAS_RECIPIENT_NICKNAME;
        }
        if self.sender_peer_id.is_some() {
            flags |= FLAG_HAS_SENDER_PEER_ID;
        }
        if self.mentions.is_some() {
            flags |= FLAG_HAS_MENTIONS;
        }

        let mut bytes = Vec::with_capacity(16 + self.content.len());
        bytes.push(flags);
        bytes.extend_from_slice(&self.timestamp.as_millis().to_be_bytes());
        push_short_string(&mut bytes, &self.id);
        push_short_string(&mut bytes, &self.sender);

        let content = truncated(&self.content, u16::MAX as usize);
        bytes.extend_from_slice(&(content.len() as u16).to_be_bytes());
        bytes.extend_from_slice(content.as_bytes());

        if let Some(ref original_sender) = self.original_sender {
            push_short_string(&mut bytes, original_sender);
        }
        if let Some(ref recipient_nickname) = self.recipient_nickname {
            push_short_string(&mut bytes, recipient_nickname);
        }
        if let Some(ref sender_peer_id) = self.sender_peer_id {
            push_short_string(&mut bytes, sender_peer_id);
        }
        if let Some(ref mentions) = self.mentions {
            bytes.push(mentions.len().min(255) as u8);
            for mention in mentions.iter().take(255) {
                push_short_string(&mut bytes, mention);
            }
        }

        bytes
    }

    /// Parse the binary payload format
    pub fn from_binary(bytes: &[u8]) -> Result<Self> {
        let mut reader = PayloadReader::new(bytes);

        let flags = reader.read_u8()?;
        let timestamp = Timestamp::new(u64::from_be_bytes(reader.read_array::<8>()?));
        let id = reader.read_short_string()?;
        let sender = reader.read_short_string()?;

        let content_len = u16::from_be_bytes(reader.read_array::<2>()?) as usize;
        let content = reader.read_string(content_len)?;

        let original_sender = if flags & FLAG_HAS_ORIGINAL_SENDER != 0 {
            Some(reader.read_short_string()?)
        } else {
            None
        };
        let recipient_nickname = if flags & FLAG_HAS_RECIPIENT_NICKNAME != 0 {
            Some(reader.read_short_string()?)
        } else {
            None
        };
        let sender_peer_id = if flags & FLAG_HAS_SENDER_PEER_ID != 0 {
            Some(reader.read_short_string()?)
        } else {
            None
        };
        let mentions = if flags & FLAG_HAS_MENTIONS != 0 {
            let count = reader.read_u8()? as usize;
            let mut list = Vec::with_capacity(count);
            for _ in 0..count {
                list.push(reader.read_short_string()?);
            }
            Some(list)
        } else {
            None
        };

        let is_private = flags & FLAG_IS_PRIVATE != 0;
        Ok(Self {
            id,
            sender,
            content,
            timestamp,
            is_relay: flags & FLAG_IS_RELAY != 0,
            is_private,
            original_sender,
            recipient_nickname,
            sender_peer_id,
            mentions,
            delivery_status: if is_private {
                DeliveryStatus::Sending
            } else {
                DeliveryStatus::Sent
            },
        })
    }
}

// ----------------------------------------------------------------------------
// Encoding Helpers
// ----------------------------------------------------------------------------

/// Append a 1-byte-length-prefixed UTF-8 string, truncating at 255 bytes on
/// a character boundary.
fn push_short_string(bytes: &mut Vec<u8>, s: &str) {
    let s = truncated(s, 255);
    bytes.push(s.len() as u8);
    bytes.extend_from_slice(s.as_bytes());
}

/// Longest prefix of `s` that fits `max` bytes without splitting a character
fn truncated(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Cursor over a message payload with bounds-checked reads
struct PayloadReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn read_u8(&mut self) -> Result<u8> {
        let slice = self.read_slice(1)?;
        Ok(slice[0])
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let slice = self.read_slice(N)?;
        let mut array = [0u8; N];
        array.copy_from_slice(slice);
        Ok(array)
    }

    fn read_short_string(&mut self) -> Result<String> {
        let len = self.read_u8()? as usize;
        self.read_string(len)
    }

    fn read_string(&mut self, len: usize) -> Result<String> {
        let slice = self.read_slice(len)?;
        String::from_utf8(slice.to_vec()).map_err(|_| {
            BitchatError::InvalidPacket(PacketError::MalformedMessage {
                reason: "invalid UTF-8",
            })
        })
    }

    fn read_slice(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or(BitchatError::InvalidPacket(PacketError::MalformedMessage {
                reason: "payload truncated",
            }))?;
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
