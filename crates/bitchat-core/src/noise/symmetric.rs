//! Noise symmetric state: chaining key, handshake hash, and HKDF
//!
//! Holds the 32-byte chaining key and 32-byte handshake hash that bind
//! every handshake message to the full transcript, plus the HMAC-SHA256
//! expansion used for `mix_key` and `split`.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::errors::{BitchatError, NoiseError, Result};
use crate::noise::cipher::{aead_decrypt, aead_encrypt, CipherState, TAG_SIZE};

type HmacSha256 = Hmac<Sha256>;

/// The protocol name hashed into every session transcript
pub const NOISE_PROTOCOL_NAME: &str = "Noise_XX_25519_ChaChaPoly_SHA256";

// ----------------------------------------------------------------------------
// HKDF
// ----------------------------------------------------------------------------

fn hmac(key: &[u8; 32], chunks: &[&[u8]]) -> Result<[u8; 32]> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|_| BitchatError::Noise(NoiseError::MissingKeyMaterial))?;
    for chunk in chunks {
        mac.update(chunk);
    }
    Ok(mac.finalize().into_bytes().into())
}

/// Noise HKDF: `T = HMAC(ck, ikm)`, then `out_i = HMAC(T, out_{i-1} ‖ i)`.
///
/// Returns three outputs; callers use the first two or all three.
fn hkdf(chaining_key: &[u8; 32], ikm: &[u8]) -> Result<([u8; 32], [u8; 32], [u8; 32])> {
    let mut temp = hmac(chaining_key, &[ikm])?;
    let out1 = hmac(&temp, &[&[1u8]])?;
    let out2 = hmac(&temp, &[&out1, &[2u8]])?;
    let out3 = hmac(&temp, &[&out2, &[3u8]])?;
    temp.zeroize();
    Ok((out1, out2, out3))
}

// ----------------------------------------------------------------------------
// Symmetric State
// ----------------------------------------------------------------------------

/// Chaining key + handshake hash + the in-handshake cipher.
pub struct SymmetricState {
    chaining_key: [u8; 32],
    hash: [u8; 32],
    cipher_key: Option<[u8; 32]>,
    nonce: u64,
}

impl Drop for SymmetricState {
    fn drop(&mut self) {
        self.clear();
    }
}

impl core::fmt::Debug for SymmetricState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SymmetricState")
            .field("has_key", &self.cipher_key.is_some())
            .finish_non_exhaustive()
    }
}

impl SymmetricState {
    /// Initialize from a protocol name: names up to 32 bytes are
    /// zero-padded into the hash, longer names are hashed first. The
    /// chaining key starts equal to the hash.
    pub fn new(protocol_name: &str) -> Self {
        let name = protocol_name.as_bytes();
        let mut hash = [0u8; 32];
        if name.len() <= 32 {
            hash[..name.len()].copy_from_slice(name);
        } else {
            hash.copy_from_slice(&Sha256::digest(name));
        }

        Self {
            chaining_key: hash,
            hash,
            cipher_key: None,
            nonce: 0,
        }
    }

    /// `h = SHA-256(h ‖ data)`
    pub fn mix_hash(&mut self, data: &[u8]) {
        let mut hasher = Sha256::new();
        hasher.update(self.hash);
        hasher.update(data);
        self.hash.copy_from_slice(&hasher.finalize());
    }

    /// Fold DH output into the chaining key and arm a fresh cipher key
    pub fn mix_key(&mut self, ikm: &[u8]) -> Result<()> {
        let (chaining_key, mut cipher_key, mut spare) = hkdf(&self.chaining_key, ikm)?;
        spare.zeroize();
        self.chaining_key = chaining_key;
        self.cipher_key = Some(cipher_key);
        cipher_key.zeroize();
        self.nonce = 0;
        Ok(())
    }

    /// Three-output variant that also folds entropy into the hash (used by
    /// pre-shared-key patterns)
    pub fn mix_key_and_hash(&mut self, ikm: &[u8]) -> Result<()> {
        let (chaining_key, temp_hash, mut cipher_key) = hkdf(&self.chaining_key, ikm)?;
        self.chaining_key = chaining_key;
        self.mix_hash(&temp_hash);
        self.cipher_key = Some(cipher_key);
        cipher_key.zeroize();
        self.nonce = 0;
        Ok(())
    }

    /// True once a cipher key has been derived
    pub fn has_key(&self) -> bool {
        self.cipher_key.is_some()
    }

    /// Current transcript hash
    pub fn handshake_hash(&self) -> [u8; 32] {
        self.hash
    }

    /// Encrypt (when keyed) with the transcript hash as associated data,
    /// then absorb the ciphertext into the transcript.
    pub fn encrypt_and_hash(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let output = match self.cipher_key {
            Some(ref key) => {
                let ciphertext = aead_encrypt(key, self.nonce, &self.hash, plaintext)?;
                self.nonce += 1;
                ciphertext
            }
            None => plaintext.to_vec(),
        };
        self.mix_hash(&output);
        Ok(output)
    }

    /// Inverse of [`Self::encrypt_and_hash`]
    pub fn decrypt_and_hash(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let output = match self.cipher_key {
            Some(ref key) => {
                if ciphertext.len() < TAG_SIZE {
                    return Err(BitchatError::Noise(NoiseError::InvalidCiphertext));
                }
                let plaintext = aead_decrypt(key, self.nonce, &self.hash, ciphertext)?;
                self.nonce += 1;
                plaintext
            }
            None => ciphertext.to_vec(),
        };
        self.mix_hash(ciphertext);
        Ok(output)
    }

    /// Number of ciphertext bytes `encrypt_and_hash` will emit for a
    /// plaintext of `len` bytes in the current keying state
    pub fn sealed_len(&self, len: usize) -> usize {
        if self.cipher_key.is_some() {
            len + TAG_SIZE
        } else {
            len
        }
    }

    /// Derive the two transport cipher states and clear the symmetric
    /// state. The caller orients the pair by handshake role.
    pub fn split(&mut self) -> Result<(CipherState, CipherState)> {
        let (key_one, key_two, mut spare) = hkdf(&self.chaining_key, &[])?;
        spare.zeroize();
        let pair = (CipherState::new(key_one, true), CipherState::new(key_two, true));
        self.clear();
        Ok(pair)
    }

    fn clear(&mut self) {
        self.chaining_key.zeroize();
        self.hash.zeroize();
        if let Some(ref mut key) = self.cipher_key {
            key.zeroize();
        }
        self.cipher_key = None;
        self.nonce = 0;
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_name_fits_hash_exactly() {
        assert_eq!(NOISE_PROTOCOL_NAME.len(), 32);
        let state = SymmetricState::new(NOISE_PROTOCOL_NAME);
        assert_eq!(&state.handshake_hash(), NOISE_PROTOCOL_NAME.as_bytes());
    }

    #[test]
    fn test_long_protocol_name_is_hashed() {
        let state = SymmetricState::new("Noise_XXfallback_25519_ChaChaPoly_SHA256");
        assert_ne!(state.handshake_hash(), [0u8; 32]);
    }

    #[test]
    fn test_mix_hash_changes_transcript() {
        let mut a = SymmetricState::new(NOISE_PROTOCOL_NAME);
        let mut b = SymmetricState::new(NOISE_PROTOCOL_NAME);

        a.mix_hash(b"one");
        b.mix_hash(b"two");
        assert_ne!(a.handshake_hash(), b.handshake_hash());

        let mut c = SymmetricState::new(NOISE_PROTOCOL_NAME);
        c.mix_hash(b"one");
        assert_eq!(a.handshake_hash(), c.handshake_hash());
    }

    #[test]
    fn test_hkdf_outputs_are_distinct() {
        let (one, two, three) = hkdf(&[1u8; 32], b"ikm").unwrap();
        assert_ne!(one, two);
        assert_ne!(two, three);
        assert_ne!(one, three);
    }

    #[test]
    fn test_encrypt_without_key_is_plaintext() {
        let mut state = SymmetricState::new(NOISE_PROTOCOL_NAME);
        assert!(!state.has_key());
        let out = state.encrypt_and_hash(b"in the clear").unwrap();
        assert_eq!(out, b"in the clear");
        assert_eq!(state.sealed_len(12), 12);
    }

    #[test]
    fn test_encrypt_decrypt_symmetry_after_mix_key() {
        let mut tx = SymmetricState::new(NOISE_PROTOCOL_NAME);
        let mut rx = SymmetricState::new(NOISE_PROTOCOL_NAME);
        tx.mix_key(b"shared secret").unwrap();
        rx.mix_key(b"shared secret").unwrap();

        let ciphertext = tx.encrypt_and_hash(b"hello").unwrap();
        assert_eq!(ciphertext.len(), 5 + TAG_SIZE);
        assert_eq!(rx.decrypt_and_hash(&ciphertext).unwrap(), b"hello");
        // Transcripts advance identically.
        assert_eq!(tx.handshake_hash(), rx.handshake_hash());
    }

    #[test]
    fn test_transcript_mismatch_fails_decrypt() {
        let mut tx = SymmetricState::new(NOISE_PROTOCOL_NAME);
        let mut rx = SymmetricState::new(NOISE_PROTOCOL_NAME);
        tx.mix_key(b"secret").unwrap();
        rx.mix_key(b"secret").unwrap();
        rx.mix_hash(b"divergent transcript");

        let ciphertext = tx.encrypt_and_hash(b"hello").unwrap();
        assert!(rx.decrypt_and_hash(&ciphertext).is_err());
    }

    #[test]
    fn test_split_clears_state() {
        let mut a = SymmetricState::new(NOISE_PROTOCOL_NAME);
        let mut b = SymmetricState::new(NOISE_PROTOCOL_NAME);
        a.mix_key(b"dh output").unwrap();
        b.mix_key(b"dh output").unwrap();

        let (mut a_send, _a_recv) = a.split().unwrap();
        let (_b_send, mut b_recv) = b.split().unwrap();
        assert!(!a.has_key());
        assert_eq!(a.handshake_hash(), [0u8; 32]);

        let wire = a_send.encrypt(b"post-split", b"").unwrap();
        assert_eq!(b_recv.decrypt(&wire, b"").unwrap(), b"post-split");
    }

    #[test]
    fn test_mix_key_and_hash_diverges_from_mix_key() {
        let mut plain = SymmetricState::new(NOISE_PROTOCOL_NAME);
        let mut mixed = SymmetricState::new(NOISE_PROTOCOL_NAME);
        plain.mix_key(b"ikm").unwrap();
        mixed.mix_key_and_hash(b"ikm").unwrap();
        assert_ne!(plain.handshake_hash(), mixed.handshake_hash());
    }
}
