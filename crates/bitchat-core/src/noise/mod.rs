//! Noise-XX session engine
//!
//! Handshake state machine, transport cipher states with sliding-window
//! replay defense, and the per-peer session manager.

pub mod cipher;
pub mod handshake;
pub mod manager;
pub mod session;
pub mod symmetric;

pub use cipher::{CipherState, MAX_SEND_COUNTER, REPLAY_WINDOW_SIZE};
pub use handshake::{HandshakeRole, HandshakeState};
pub use manager::{NoiseService, NoiseSessionManager};
pub use session::{NoiseSession, SessionState};
pub use symmetric::{SymmetricState, NOISE_PROTOCOL_NAME};
