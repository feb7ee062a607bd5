//! Device identity: static keypairs, peer id derivation, and the identity
//! store interface.
//!
//! The device identity is a Curve25519 static keypair created on first run.
//! The 16-hex short peer id is derived from the public key and is the only
//! identity form that appears on the wire. Persistence (encrypted under a
//! hardware-backed master key) is host glue behind [`IdentityStore`].

use std::sync::RwLock;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::{CryptoRng, OsRng, RngCore};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, SharedSecret, StaticSecret};

use crate::errors::{BitchatError, NoiseError, Result};
use crate::types::{Fingerprint, PeerId};

// ----------------------------------------------------------------------------
// Noise Key Pair (X25519)
// ----------------------------------------------------------------------------

/// X25519 static key pair used by the Noise handshake
pub struct NoiseKeyPair {
    secret: StaticSecret,
    public: [u8; 32],
}

impl core::fmt::Debug for NoiseKeyPair {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NoiseKeyPair")
            .field("public", &hex::encode(self.public))
            .finish_non_exhaustive()
    }
}

impl Clone for NoiseKeyPair {
    fn clone(&self) -> Self {
        Self {
            secret: StaticSecret::from(self.secret.to_bytes()),
            public: self.public,
        }
    }
}

impl NoiseKeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret).to_bytes();
        Self { secret, public }
    }

    /// Create from raw private key bytes
    pub fn from_bytes(private_key: [u8; 32]) -> Self {
        let secret = StaticSecret::from(private_key);
        let public = X25519PublicKey::from(&secret).to_bytes();
        Self { secret, public }
    }

    /// Get the public key bytes
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.public
    }

    /// Get the private key bytes
    pub fn private_key_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    /// X25519 shared secret with a validated remote public key.
    ///
    /// The remote key must be 32 bytes and non-zero, and the resulting
    /// secret must be contributory; anything else aborts the handshake with
    /// `InvalidPublicKey`. The shared secret zeroizes itself on drop.
    pub fn diffie_hellman(&self, remote_public: &[u8]) -> Result<SharedSecret> {
        let bytes: [u8; 32] = remote_public
            .try_into()
            .map_err(|_| BitchatError::Noise(NoiseError::InvalidPublicKey))?;
        if bytes == [0u8; 32] {
            return Err(BitchatError::Noise(NoiseError::InvalidPublicKey));
        }
        let shared = self.secret.diffie_hellman(&X25519PublicKey::from(bytes));
        if !shared.was_contributory() {
            return Err(BitchatError::Noise(NoiseError::InvalidPublicKey));
        }
        Ok(shared)
    }

    /// Fingerprint of the public key
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(self.public)
    }

    /// Short peer id derived from the public key
    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(self.public)
    }
}

// ----------------------------------------------------------------------------
// Identity Key Pair (Ed25519)
// ----------------------------------------------------------------------------

/// Ed25519 signing key pair for packet signatures
#[derive(Clone)]
pub struct IdentityKeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl core::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public", &hex::encode(self.verifying_key.to_bytes()))
            .finish_non_exhaustive()
    }
}

impl IdentityKeyPair {
    /// Generate a new random identity key pair
    pub fn generate() -> Self {
        Self::generate_with_rng(&mut OsRng)
    }

    /// Generate a new identity key pair with a custom RNG
    pub fn generate_with_rng<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut secret_bytes = [0u8; 32];
        rng.fill_bytes(&mut secret_bytes);
        Self::from_bytes(&secret_bytes)
    }

    /// Create from raw private key bytes
    pub fn from_bytes(private_key: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(private_key);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Get the public key bytes
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    /// Sign data
    pub fn sign<T: AsRef<[u8]>>(&self, data: T) -> [u8; 64] {
        self.signing_key.sign(data.as_ref()).to_bytes()
    }

    /// Verify a signature from another key
    pub fn verify<D: AsRef<[u8]>>(
        public_key: &[u8; 32],
        data: D,
        signature: &[u8; 64],
    ) -> Result<()> {
        let verifying_key = VerifyingKey::from_bytes(public_key)
            .map_err(|_| BitchatError::Noise(NoiseError::AuthenticationFailed))?;
        let signature = Signature::from_bytes(signature);
        verifying_key
            .verify(data.as_ref(), &signature)
            .map_err(|_| BitchatError::Noise(NoiseError::AuthenticationFailed))
    }
}

// ----------------------------------------------------------------------------
// Identity Store Interface
// ----------------------------------------------------------------------------

/// Persistence interface implemented by the host.
///
/// The host stores the static keypair encrypted under its hardware-backed
/// master key; the core only ever sees the decrypted material.
pub trait IdentityStore: Send + Sync {
    /// Return the persistent static keypair as (private, public) bytes
    fn static_keypair(&self) -> ([u8; 32], [u8; 32]);

    /// 64-hex fingerprint of a public key
    fn fingerprint(&self, public_key: &[u8; 32]) -> String {
        Fingerprint::of(public_key).to_string()
    }

    /// Persist the user's nickname
    fn save_nickname(&self, nickname: &str);

    /// The current nickname
    fn nickname(&self) -> String;
}

/// In-memory identity store used by tests and short-lived hosts.
#[derive(Debug)]
pub struct MemoryIdentityStore {
    keypair: ([u8; 32], [u8; 32]),
    nickname: RwLock<String>,
}

impl MemoryIdentityStore {
    /// Create a store around a freshly generated keypair
    pub fn generate(nickname: &str) -> Self {
        let keys = NoiseKeyPair::generate();
        Self {
            keypair: (keys.private_key_bytes(), keys.public_key_bytes()),
            nickname: RwLock::new(nickname.to_string()),
        }
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn static_keypair(&self) -> ([u8; 32], [u8; 32]) {
        self.keypair
    }

    fn save_nickname(&self, nickname: &str) {
        if let Ok(mut guard) = self.nickname.write() {
            *guard = nickname.to_string();
        }
    }

    fn nickname(&self) -> String {
        self.nickname
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// Local Identity
// ----------------------------------------------------------------------------

/// The local device identity handed to the router and transports.
///
/// Constructed once from the identity store at startup; never a process
/// global.
#[derive(Debug)]
pub struct LocalIdentity {
    noise: NoiseKeyPair,
    signing: IdentityKeyPair,
    peer_id: PeerId,
    nickname: RwLock<String>,
}

impl LocalIdentity {
    /// Load the identity from a store
    pub fn from_store(store: &dyn IdentityStore) -> Self {
        let (private, _public) = store.static_keypair();
        let noise = NoiseKeyPair::from_bytes(private);
        // The signing key is derived from the static secret so a device
        // presents one stable identity across both key uses.
        let seed = Sha256::digest(private);
        let signing = IdentityKeyPair::from_bytes(&seed.into());
        let peer_id = noise.peer_id();
        Self {
            noise,
            signing,
            peer_id,
            nickname: RwLock::new(store.nickname()),
        }
    }

    /// Create an ephemeral identity (tests, first run before persistence)
    pub fn ephemeral(nickname: &str) -> Self {
        let store = MemoryIdentityStore::generate(nickname);
        Self::from_store(&store)
    }

    /// The short routing id
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// The Noise static keypair
    pub fn noise_keys(&self) -> &NoiseKeyPair {
        &self.noise
    }

    /// The Ed25519 signing keypair
    pub fn signing_keys(&self) -> &IdentityKeyPair {
        &self.signing
    }

    /// Fingerprint of the static public key
    pub fn fingerprint(&self) -> Fingerprint {
        self.noise.fingerprint()
    }

    /// Current nickname
    pub fn nickname(&self) -> String {
        self.nickname
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    /// Update the nickname
    pub fn set_nickname(&self, nickname: &str) {
        if let Ok(mut guard) = self.nickname.write() {
            *guard = nickname.to_string();
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noise_keypair_roundtrip() {
        let keys = NoiseKeyPair::generate();
        let restored = NoiseKeyPair::from_bytes(keys.private_key_bytes());
        assert_eq!(keys.public_key_bytes(), restored.public_key_bytes());
        assert_eq!(keys.peer_id(), restored.peer_id());
    }

    #[test]
    fn test_diffie_hellman_agreement() {
        let alice = NoiseKeyPair::generate();
        let bob = NoiseKeyPair::generate();

        let ab = alice.diffie_hellman(&bob.public_key_bytes()).unwrap();
        let ba = bob.diffie_hellman(&alice.public_key_bytes()).unwrap();
        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }

    #[test]
    fn test_diffie_hellman_rejects_bad_keys() {
        let keys = NoiseKeyPair::generate();
        assert!(keys.diffie_hellman(&[0u8; 32]).is_err());
        assert!(keys.diffie_hellman(&[1u8; 16]).is_err());
    }

    #[test]
    fn test_identity_sign_verify() {
        let keys = IdentityKeyPair::generate();
        let data = b"announce payload";
        let signature = keys.sign(data);

        IdentityKeyPair::verify(&keys.public_key_bytes(), data, &signature).unwrap();
        assert!(IdentityKeyPair::verify(&keys.public_key_bytes(), data, &[0u8; 64]).is_err());
    }

    #[test]
    fn test_local_identity_from_store() {
        let store = MemoryIdentityStore::generate("alice");
        let identity = LocalIdentity::from_store(&store);
        let again = LocalIdentity::from_store(&store);

        assert_eq!(identity.peer_id(), again.peer_id());
        assert_eq!(identity.nickname(), "alice");

        identity.set_nickname("alice2");
        assert_eq!(identity.nickname(), "alice2");
    }
}
