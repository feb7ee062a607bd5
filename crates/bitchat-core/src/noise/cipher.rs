//! ChaCha20-Poly1305 transport cipher states with replay defense
//!
//! Two nonce regimes coexist. After an XX handshake the extracted-nonce
//! regime is used: each ciphertext is prefixed with 4 big-endian bytes of
//! the sender's counter and the receiver decrypts with that wire counter,
//! guarded by a 1024-entry sliding window. Without extraction the
//! receiver's own counter is authoritative.

use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use zeroize::Zeroize;

use crate::errors::{BitchatError, NoiseError, Result};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// AEAD nonce size
pub const NONCE_SIZE: usize = 12;

/// Poly1305 tag size
pub const TAG_SIZE: usize = 16;

/// Wire prefix carrying the sender counter in extracted-nonce mode
pub const EXTRACTED_NONCE_PREFIX: usize = 4;

/// Sliding window width in counters
pub const REPLAY_WINDOW_SIZE: u64 = 1024;

/// The send counter fails closed here, far below the 64-bit nonce space,
/// to force rekeying while the 4-byte wire prefix can still carry it.
pub const MAX_SEND_COUNTER: u64 = u32::MAX as u64;

/// Receive counters above this log a rekey advisory
const REKEY_ADVISORY_COUNTER: u64 = 1_000_000_000;

/// AEAD nonce layout: 4 zero bytes then the counter in little-endian
fn nonce_for(counter: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[4..].copy_from_slice(&counter.to_le_bytes());
    nonce
}

// ----------------------------------------------------------------------------
// Raw AEAD Operations
// ----------------------------------------------------------------------------

/// Encrypt with an explicit counter; used by both the handshake symmetric
/// state and the transport cipher states.
pub(crate) fn aead_encrypt(
    key: &[u8; 32],
    counter: u64,
    associated_data: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(
            Nonce::from_slice(&nonce_for(counter)),
            Payload {
                msg: plaintext,
                aad: associated_data,
            },
        )
        .map_err(|_| BitchatError::Noise(NoiseError::InvalidCiphertext))
}

/// Decrypt with an explicit counter
pub(crate) fn aead_decrypt(
    key: &[u8; 32],
    counter: u64,
    associated_data: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(
            Nonce::from_slice(&nonce_for(counter)),
            Payload {
                msg: ciphertext,
                aad: associated_data,
            },
        )
        .map_err(|_| BitchatError::Noise(NoiseError::InvalidCiphertext))
}

// ----------------------------------------------------------------------------
// Replay Window
// ----------------------------------------------------------------------------

/// 1024-bit sliding bitmap over recently received counters.
///
/// Bit `d` records whether counter `highest - d` has been accepted.
#[derive(Debug, Clone)]
struct ReplayWindow {
    bits: [u64; 16],
}

impl ReplayWindow {
    fn new() -> Self {
        Self { bits: [0u64; 16] }
    }

    fn is_set(&self, distance: u64) -> bool {
        let word = (distance / 64) as usize;
        let bit = distance % 64;
        (self.bits[word] >> bit) & 1 != 0
    }

    fn set(&mut self, distance: u64) {
        let word = (distance / 64) as usize;
        let bit = distance % 64;
        self.bits[word] |= 1 << bit;
    }

    /// Slide the window forward by `by` counters, discarding history that
    /// falls off the far edge.
    fn shift(&mut self, by: u64) {
        if by >= REPLAY_WINDOW_SIZE {
            self.bits = [0u64; 16];
            return;
        }
        let word_shift = (by / 64) as usize;
        let bit_shift = (by % 64) as u32;
        for i in (0..16).rev() {
            let low = if i >= word_shift {
                self.bits[i - word_shift]
            } else {
                0
            };
            let carry = if bit_shift > 0 && i > word_shift {
                self.bits[i - word_shift - 1] >> (64 - bit_shift)
            } else {
                0
            };
            self.bits[i] = if bit_shift == 0 {
                low
            } else {
                (low << bit_shift) | carry
            };
        }
    }

    fn clear(&mut self) {
        self.bits = [0u64; 16];
    }
}

// ----------------------------------------------------------------------------
// Cipher State
// ----------------------------------------------------------------------------

/// One direction of an established Noise session.
#[derive(Debug)]
pub struct CipherState {
    key: [u8; 32],
    send_counter: u64,
    /// Highest accepted counter in extracted mode; our own receive counter
    /// otherwise
    highest_received: u64,
    window: ReplayWindow,
    use_extracted_nonce: bool,
}

impl Drop for CipherState {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl CipherState {
    /// Create a cipher state around a derived key
    pub fn new(key: [u8; 32], use_extracted_nonce: bool) -> Self {
        Self {
            key,
            send_counter: 0,
            highest_received: 0,
            window: ReplayWindow::new(),
            use_extracted_nonce,
        }
    }

    /// Current send counter
    pub fn send_counter(&self) -> u64 {
        self.send_counter
    }

    /// Highest counter accepted so far
    pub fn highest_received(&self) -> u64 {
        self.highest_received
    }

    /// Encrypt a message, advancing the send counter by exactly one.
    ///
    /// In extracted-nonce mode the wire form is the 4-byte big-endian
    /// counter followed by the ciphertext.
    pub fn encrypt(&mut self, plaintext: &[u8], associated_data: &[u8]) -> Result<Vec<u8>> {
        if self.send_counter >= MAX_SEND_COUNTER {
            return Err(BitchatError::Noise(NoiseError::NonceExhausted));
        }

        let ciphertext = aead_encrypt(&self.key, self.send_counter, associated_data, plaintext)?;
        let wire = if self.use_extracted_nonce {
            let mut framed = Vec::with_capacity(EXTRACTED_NONCE_PREFIX + ciphertext.len());
            framed.extend_from_slice(&(self.send_counter as u32).to_be_bytes());
            framed.extend_from_slice(&ciphertext);
            framed
        } else {
            ciphertext
        };
        self.send_counter += 1;
        Ok(wire)
    }

    /// Decrypt a wire message.
    ///
    /// Extracted mode validates the wire counter against the sliding window
    /// and only marks it after the ciphertext authenticates, so a forged
    /// prefix cannot poison the window.
    pub fn decrypt(&mut self, wire: &[u8], associated_data: &[u8]) -> Result<Vec<u8>> {
        if !self.use_extracted_nonce {
            let plaintext = aead_decrypt(&self.key, self.highest_received, associated_data, wire)?;
            self.highest_received += 1;
            return Ok(plaintext);
        }

        if wire.len() < EXTRACTED_NONCE_PREFIX + TAG_SIZE {
            return Err(BitchatError::Noise(NoiseError::InvalidCiphertext));
        }
        let counter = u32::from_be_bytes([wire[0], wire[1], wire[2], wire[3]]) as u64;
        self.check_replay(counter)?;

        let plaintext = aead_decrypt(
            &self.key,
            counter,
            associated_data,
            &wire[EXTRACTED_NONCE_PREFIX..],
        )?;

        self.record_received(counter);
        if counter > REKEY_ADVISORY_COUNTER {
            tracing::warn!(counter, "receive counter is high; session should rekey");
        }
        Ok(plaintext)
    }

    fn check_replay(&self, counter: u64) -> Result<()> {
        if counter > self.highest_received {
            return Ok(());
        }
        let distance = self.highest_received - counter;
        if distance >= REPLAY_WINDOW_SIZE {
            return Err(BitchatError::Noise(NoiseError::ReplayDetected { counter }));
        }
        if self.window.is_set(distance) {
            return Err(BitchatError::Noise(NoiseError::ReplayDetected { counter }));
        }
        Ok(())
    }

    fn record_received(&mut self, counter: u64) {
        if counter > self.highest_received {
            let advance = counter - self.highest_received;
            self.window.shift(advance);
            self.window.set(0);
            self.highest_received = counter;
        } else {
            self.window.set(self.highest_received - counter);
        }
    }

    /// Wipe key material and counters
    pub fn reset(&mut self) {
        self.key.zeroize();
        self.send_counter = 0;
        self.highest_received = 0;
        self.window.clear();
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (CipherState, CipherState) {
        let key = [7u8; 32];
        (CipherState::new(key, true), CipherState::new(key, true))
    }

    #[test]
    fn test_roundtrip_and_counter_monotonicity() {
        let (mut tx, mut rx) = pair();

        for expected in 0..5u64 {
            assert_eq!(tx.send_counter(), expected);
            let wire = tx.encrypt(b"tick", b"").unwrap();
            assert_eq!(rx.decrypt(&wire, b"").unwrap(), b"tick");
        }
        assert_eq!(tx.send_counter(), 5);
    }

    #[test]
    fn test_wire_prefix_is_big_endian_counter() {
        let (mut tx, _) = pair();
        tx.encrypt(b"a", b"").unwrap();
        let wire = tx.encrypt(b"b", b"").unwrap();
        assert_eq!(&wire[..4], &1u32.to_be_bytes());
        assert_eq!(wire.len(), 4 + 1 + TAG_SIZE);
    }

    #[test]
    fn test_out_of_order_within_window_accepted_once() {
        let (mut tx, mut rx) = pair();

        let frames: Vec<Vec<u8>> = (0..6).map(|_| tx.encrypt(b"m", b"").unwrap()).collect();

        // Deliver 5, 4, 3 out of order (scenario S4).
        assert!(rx.decrypt(&frames[5], b"").is_ok());
        assert!(rx.decrypt(&frames[4], b"").is_ok());
        assert!(rx.decrypt(&frames[3], b"").is_ok());

        // Replays of any of them are rejected.
        for frame in &frames[3..6] {
            let err = rx.decrypt(frame, b"").unwrap_err();
            assert!(matches!(
                err,
                BitchatError::Noise(NoiseError::ReplayDetected { .. })
            ));
        }

        // Still-unseen older counters inside the window are accepted.
        assert!(rx.decrypt(&frames[0], b"").is_ok());
        assert!(rx.decrypt(&frames[2], b"").is_ok());
        assert!(rx.decrypt(&frames[1], b"").is_ok());
    }

    #[test]
    fn test_counters_outside_window_rejected() {
        let key = [9u8; 32];
        let mut rx = CipherState::new(key, true);

        // Simulate a sender far ahead.
        let mut tx = CipherState::new(key, true);
        tx.send_counter = 5_000;
        let newest = tx.encrypt(b"new", b"").unwrap();
        assert!(rx.decrypt(&newest, b"").is_ok());
        assert_eq!(rx.highest_received(), 5_000);

        // A counter 1024 behind the highest is out of window even though
        // its ciphertext is authentic.
        let mut old_tx = CipherState::new(key, true);
        old_tx.send_counter = 5_000 - REPLAY_WINDOW_SIZE;
        let stale = old_tx.encrypt(b"old", b"").unwrap();
        assert!(matches!(
            rx.decrypt(&stale, b"").unwrap_err(),
            BitchatError::Noise(NoiseError::ReplayDetected { .. })
        ));

        // Just inside the window is fine.
        let mut edge_tx = CipherState::new(key, true);
        edge_tx.send_counter = 5_000 - (REPLAY_WINDOW_SIZE - 1);
        let edge = edge_tx.encrypt(b"edge", b"").unwrap();
        assert!(rx.decrypt(&edge, b"").is_ok());
    }

    #[test]
    fn test_forged_prefix_does_not_poison_window() {
        let (mut tx, mut rx) = pair();
        let good = tx.encrypt(b"ok", b"").unwrap();

        // Claim a huge counter with garbage ciphertext.
        let mut forged = vec![0x00, 0x00, 0x40, 0x00];
        forged.extend_from_slice(&[0u8; 32]);
        assert!(rx.decrypt(&forged, b"").is_err());
        assert_eq!(rx.highest_received(), 0);

        // The genuine frame still decrypts.
        assert_eq!(rx.decrypt(&good, b"").unwrap(), b"ok");
    }

    #[test]
    fn test_send_counter_fails_closed() {
        let (mut tx, _) = pair();
        tx.send_counter = MAX_SEND_COUNTER;
        assert!(matches!(
            tx.encrypt(b"x", b"").unwrap_err(),
            BitchatError::Noise(NoiseError::NonceExhausted)
        ));
    }

    #[test]
    fn test_own_counter_mode() {
        let key = [3u8; 32];
        let mut tx = CipherState::new(key, false);
        let mut rx = CipherState::new(key, false);

        let first = tx.encrypt(b"one", b"ad").unwrap();
        let second = tx.encrypt(b"two", b"ad").unwrap();
        // No wire prefix in this regime.
        assert_eq!(first.len(), 3 + TAG_SIZE);

        assert_eq!(rx.decrypt(&first, b"ad").unwrap(), b"one");
        assert_eq!(rx.decrypt(&second, b"ad").unwrap(), b"two");

        // Losing a frame desynchronizes the counters by design.
        let _third = tx.encrypt(b"three", b"ad").unwrap();
        let fourth = tx.encrypt(b"four", b"ad").unwrap();
        assert!(rx.decrypt(&fourth, b"ad").is_err());
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let (mut tx, mut rx) = pair();
        let mut wire = tx.encrypt(b"payload", b"").unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0x01;
        assert!(rx.decrypt(&wire, b"").is_err());
    }
}
