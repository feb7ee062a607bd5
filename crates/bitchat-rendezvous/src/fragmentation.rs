//! Radio-layer fragmentation for the rendezvous transport
//!
//! The rendezvous radio carries at most ~255 bytes per message, so encoded
//! packets are split below the packet layer:
//!
//! ```text
//! single frame:   0x00 ‖ frame
//! fragment:       0x01 ‖ msg_id(2) ‖ frag_idx(2) ‖ total_frags(2) ‖ data
//! ```
//!
//! Reassembly is keyed by (peer handle, msg_id). Out-of-order fragments are
//! tolerated, duplicates are first-wins, and incomplete buffers time out.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use bitchat_core::errors::{BitchatError, Result, TransportError};

use crate::radio::PeerHandle;

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Marker byte for an unfragmented packet
pub const MARKER_SINGLE: u8 = 0x00;

/// Marker byte for a fragment
pub const MARKER_FRAGMENT: u8 = 0x01;

/// Marker plus the three u16 fields
pub const FRAGMENT_HEADER_SIZE: usize = 7;

/// Payload bytes per fragment at the 255-byte radio limit
pub const MAX_FRAGMENT_DATA: usize = 248;

// ----------------------------------------------------------------------------
// Splitting
// ----------------------------------------------------------------------------

/// Wrap an encoded packet into radio frames, fragmenting when the single
/// frame (marker + packet) would not fit.
pub fn split_for_radio(frame: &[u8], max_radio_frame: usize, msg_id: u16) -> Result<Vec<Vec<u8>>> {
    if frame.len() + 1 <= max_radio_frame {
        let mut single = Vec::with_capacity(frame.len() + 1);
        single.push(MARKER_SINGLE);
        single.extend_from_slice(frame);
        return Ok(vec![single]);
    }

    let data_per_fragment = max_radio_frame
        .saturating_sub(FRAGMENT_HEADER_SIZE)
        .min(MAX_FRAGMENT_DATA)
        .max(1);
    let total = frame.len().div_ceil(data_per_fragment);
    if total > u16::MAX as usize {
        return Err(BitchatError::Transport(TransportError::InvalidFrame {
            reason: "packet too large to fragment",
        }));
    }

    let mut fragments = Vec::with_capacity(total);
    for (index, data) in frame.chunks(data_per_fragment).enumerate() {
        let mut fragment = Vec::with_capacity(FRAGMENT_HEADER_SIZE + data.len());
        fragment.push(MARKER_FRAGMENT);
        fragment.extend_from_slice(&msg_id.to_be_bytes());
        fragment.extend_from_slice(&(index as u16).to_be_bytes());
        fragment.extend_from_slice(&(total as u16).to_be_bytes());
        fragment.extend_from_slice(data);
        fragments.push(fragment);
    }
    Ok(fragments)
}

// ----------------------------------------------------------------------------
// Reassembly
// ----------------------------------------------------------------------------

/// One partially received message
#[derive(Debug)]
struct PartialMessage {
    total: u16,
    parts: BTreeMap<u16, Vec<u8>>,
    first_fragment_at: Instant,
}

impl PartialMessage {
    fn new(total: u16) -> Self {
        Self {
            total,
            parts: BTreeMap::new(),
            first_fragment_at: Instant::now(),
        }
    }

    fn is_complete(&self) -> bool {
        self.parts.len() == self.total as usize
    }

    fn reassemble(&self) -> Vec<u8> {
        let mut frame = Vec::new();
        for data in self.parts.values() {
            frame.extend_from_slice(data);
        }
        frame
    }
}

/// Reassembles radio frames back into encoded packets
#[derive(Debug)]
pub struct Reassembler {
    buffers: HashMap<(PeerHandle, u16), PartialMessage>,
    timeout: Duration,
}

impl Reassembler {
    /// Create a reassembler with the configured buffer timeout
    pub fn new(timeout: Duration) -> Self {
        Self {
            buffers: HashMap::new(),
            timeout,
        }
    }

    /// Feed one radio frame. Returns the whole encoded packet when this
    /// frame completed one.
    pub fn ingest(&mut self, handle: PeerHandle, radio_frame: &[u8]) -> Result<Option<Vec<u8>>> {
        let (&marker, rest) = radio_frame.split_first().ok_or(BitchatError::Transport(
            TransportError::InvalidFrame {
                reason: "empty radio frame",
            },
        ))?;

        match marker {
            MARKER_SINGLE => Ok(Some(rest.to_vec())),
            MARKER_FRAGMENT => self.ingest_fragment(handle, rest),
            _ => Err(BitchatError::Transport(TransportError::InvalidFrame {
                reason: "unknown frame marker",
            })),
        }
    }

    fn ingest_fragment(&mut self, handle: PeerHandle, body: &[u8]) -> Result<Option<Vec<u8>>> {
        if body.len() <= FRAGMENT_HEADER_SIZE - 1 {
            return Err(BitchatError::Transport(TransportError::InvalidFrame {
                reason: "fragment header truncated",
            }));
        }
        let msg_id = u16::from_be_bytes([body[0], body[1]]);
        let frag_idx = u16::from_be_bytes([body[2], body[3]]);
        let total_frags = u16::from_be_bytes([body[4], body[5]]);
        let data = &body[6..];

        if total_frags == 0 || frag_idx >= total_frags {
            return Err(BitchatError::Transport(TransportError::InvalidFrame {
                reason: "fragment indices out of range",
            }));
        }

        let key = (handle, msg_id);
        let partial = self
            .buffers
            .entry(key)
            .or_insert_with(|| PartialMessage::new(total_frags));
        if partial.total != total_frags {
            // A colliding msg_id with a different shape; start over.
            *partial = PartialMessage::new(total_frags);
        }

        // Duplicate fragments are ignored, first write wins.
        partial.parts.entry(frag_idx).or_insert_with(|| data.to_vec());

        if partial.is_complete() {
            let frame = partial.reassemble();
            self.buffers.remove(&key);
            Ok(Some(frame))
        } else {
            Ok(None)
        }
    }

    /// Drop buffers that have waited longer than the timeout
    pub fn maintain(&mut self) {
        let timeout = self.timeout;
        self.buffers
            .retain(|_, partial| partial.first_fragment_at.elapsed() <= timeout);
    }

    /// Number of incomplete messages
    pub fn pending(&self) -> usize {
        self.buffers.len()
    }

    /// Drop everything (emergency wipe)
    pub fn clear(&mut self) {
        self.buffers.clear();
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
