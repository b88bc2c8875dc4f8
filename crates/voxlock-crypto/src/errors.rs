//! Error types for cryptographic operations.

use thiserror::Error;

/// Errors from the cryptographic primitives.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// A ratchet generation was requested after its key was deleted.
    #[error("generation {requested} deleted: ratchet floor is {floor}")]
    GenerationDeleted {
        /// Generation the caller asked for.
        requested: u32,
        /// Oldest generation the ratchet can still produce.
        floor: u32,
    },

    /// The ratchet cannot advance past the final generation.
    #[error("ratchet exhausted at generation {current}")]
    GenerationOverflow {
        /// Generation the ratchet stopped at.
        current: u32,
    },

    /// A key or seed had the wrong length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Required length in bytes.
        expected: usize,
        /// Provided length in bytes.
        actual: usize,
    },

    /// AEAD open failed: wrong key, nonce, tag, or tampered data.
    #[error("authentication failed")]
    AuthenticationFailed,
}
