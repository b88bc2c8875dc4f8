//! Error taxonomy for the media-crypto engine.
//!
//! Per-frame errors are isolated by design: the encryptor and decryptor
//! log and count them, then drop the frame. Nothing here unwinds a
//! session.

use thiserror::Error;

/// Errors on the per-frame encrypt/decrypt paths.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MediaCryptoError {
    /// A raw media-type code was neither audio nor video.
    #[error("invalid media type: {0}")]
    InvalidMediaType(u8),

    /// Encryption requested before a key ratchet was installed.
    #[error("no key ratchet set")]
    NoRatchet,

    /// AEAD or frame assembly failed, including exhausting the ciphertext
    /// validation retry budget.
    #[error("encryption failure")]
    EncryptionFailure,

    /// No active ratchet could authenticate the frame.
    #[error("decryption failure")]
    DecryptionFailure,

    /// The frame's nonce was already processed.
    #[error("replayed nonce: {nonce}")]
    ReplayedNonce {
        /// The replayed big nonce.
        nonce: u64,
    },

    /// The frame's generation predates the oldest one we track.
    #[error("generation {generation} older than oldest tracked {oldest}")]
    GenerationTooOld {
        /// Generation demanded by the frame.
        generation: u32,
        /// Oldest generation the manager still serves.
        oldest: u32,
    },

    /// The frame's generation is implausibly far in the future.
    #[error("generation {generation} exceeds newest {newest} by more than the allowed gap")]
    GenerationTooFarFuture {
        /// Generation demanded by the frame.
        generation: u32,
        /// Newest generation seen so far.
        newest: u32,
    },

    /// The claimed generation exceeds what the ratchet could have produced
    /// in its lifetime at the maximum frame rate.
    #[error("generation {generation} beyond ratchet lifetime bound {bound}")]
    GenerationBeyondRatchetLifetime {
        /// Generation demanded by the frame.
        generation: u32,
        /// Maximum generation the ratchet's age allows.
        bound: u32,
    },

    /// The wire frame failed structural parsing.
    #[error("frame parse failure")]
    FrameParseFailure,

    /// An unencrypted frame arrived after the passthrough window closed.
    #[error("passthrough disabled")]
    PassthroughDisabled,
}

impl From<voxlock_proto::ProtocolError> for MediaCryptoError {
    fn from(_: voxlock_proto::ProtocolError) -> Self {
        Self::FrameParseFailure
    }
}

impl From<voxlock_crypto::CryptoError> for MediaCryptoError {
    fn from(err: voxlock_crypto::CryptoError) -> Self {
        match err {
            voxlock_crypto::CryptoError::GenerationDeleted { requested, floor } => {
                Self::GenerationTooOld { generation: requested, oldest: floor }
            },
            _ => Self::EncryptionFailure,
        }
    }
}

/// Errors from the MLS session wrapper.
#[derive(Debug, Error)]
pub enum MlsError {
    /// The session is not in a state that allows the operation.
    #[error("invalid session state: {0}")]
    InvalidState(&'static str),

    /// An MLS message failed to deserialize.
    #[error("mls serialization: {0}")]
    Serialization(String),

    /// An MLS cryptographic operation failed.
    #[error("mls crypto: {0}")]
    Crypto(String),

    /// A proposal or welcome referenced a user outside the call roster.
    #[error("unrecognized user id: {0}")]
    UnrecognizedUser(String),

    /// The message was ignored (stale epoch, wrong group); the session
    /// state is unchanged and no reset is needed.
    #[error("mls message ignored: {0}")]
    Ignored(&'static str),
}
