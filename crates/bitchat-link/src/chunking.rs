//! Link-layer chunking and frame reassembly
//!
//! Writes larger than the link's usable MTU are split transparently below
//! the packet layer. The receive side buffers chunks until a whole
//! codec-framed packet has arrived; the codec is self-describing, and
//! padded frames always land on a standard block size, which is how the
//! assembler recognizes frame boundaries without a length prefix.

use bitchat_core::protocol::wire::{WireFormat, PADDING_BLOCK_SIZES};

/// Per-write protocol overhead reserved out of the MTU
pub const WRITE_OVERHEAD: usize = 3;

/// A reassembly buffer past this size can only be garbage; drop it
const MAX_BUFFER: usize = 64 * 1024;

// ----------------------------------------------------------------------------
// Chunking
// ----------------------------------------------------------------------------

/// Split a frame into chunks of at most `mtu - WRITE_OVERHEAD` bytes
pub fn chunk_frame(frame: &[u8], mtu: usize) -> Vec<Vec<u8>> {
    let chunk_size = mtu.saturating_sub(WRITE_OVERHEAD).max(1);
    frame
        .chunks(chunk_size)
        .map(|chunk| chunk.to_vec())
        .collect()
}

// ----------------------------------------------------------------------------
// Frame Assembly
// ----------------------------------------------------------------------------

/// Accumulates chunks from one link and yields whole frames.
///
/// A frame is complete when the codec consumes the entire buffer (unpadded
/// frames) or when the buffer has grown to the padded frame's block size.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buffer: Vec<u8>,
}

impl FrameAssembler {
    /// Create an empty assembler
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one chunk; returns the completed frame when this chunk
    /// finished one.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Option<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);

        match WireFormat::decode_with_consumed(&self.buffer) {
            Ok((_, consumed)) => {
                let complete = consumed == self.buffer.len()
                    || PADDING_BLOCK_SIZES.contains(&self.buffer.len());
                if complete {
                    return Some(std::mem::take(&mut self.buffer));
                }
                None
            }
            Err(_) => {
                if self.buffer.len() > MAX_BUFFER {
                    self.buffer.clear();
                }
                None
            }
        }
    }

    /// Bytes currently buffered
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial frame
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
