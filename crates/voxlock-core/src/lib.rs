//! Voxlock media-plane encryption engine.
//!
//! The stateful half of the end-to-end encryption stack. Sits between the
//! wire formats in `voxlock-proto` and the primitives in `voxlock-crypto`:
//!
//! - [`manager`] - maps wire nonces to ratchet generations, materializes
//!   per-generation ciphers, tracks replays, expires old generations.
//! - [`encryptor`] - the outbound path: ratchet selection, AEAD, frame
//!   assembly, codec-aware ciphertext validation with retry.
//! - [`decryptor`] - the inbound path: newest-first ratchet scan,
//!   passthrough windows, frame reconstruction.
//! - [`mls`] - the group session: proposals, commits, welcomes, per-member
//!   key ratchets, privacy codes.
//! - [`env`] - the clock/RNG abstraction that keeps all of the above
//!   deterministic under test.
//!
//! Nothing here touches a socket; drivers live in `voxlock-client`.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod decryptor;
pub mod encryptor;
pub mod env;
mod errors;
pub mod manager;
pub mod mls;

pub use decryptor::{Decryptor, DecryptorStats};
pub use encryptor::{Encryptor, EncryptorStats, ProtocolVersionObserver};
pub use env::Environment;
pub use errors::{MediaCryptoError, MlsError};
pub use manager::{
    BigNonce, CIPHER_EXPIRY, CipherManager, DEFAULT_TRANSITION_EXPIRY, MAX_FRAMES_PER_SECOND,
    MAX_GENERATION_GAP, MAX_MISSING_NONCES, RATCHET_GENERATION_SHIFT_BITS,
    compute_wrapped_big_nonce, compute_wrapped_generation,
};

/// Media stream classification for the encrypt/decrypt paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MediaType {
    /// Opus voice frames.
    Audio = 0,
    /// Video frames. Transport is out of scope, but the stats and frame
    /// layout carry the distinction.
    Video = 1,
}

impl MediaType {
    /// Validate a raw media-type code from an embedder.
    pub fn from_raw(raw: u8) -> Result<Self, MediaCryptoError> {
        match raw {
            0 => Ok(Self::Audio),
            1 => Ok(Self::Video),
            other => Err(MediaCryptoError::InvalidMediaType(other)),
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// Highest end-to-end protocol version this build speaks.
pub const MAX_PROTOCOL_VERSION: u16 = 1;

/// Protocol version value meaning "end-to-end encryption off".
pub const DISABLED_PROTOCOL_VERSION: u16 = 0;
