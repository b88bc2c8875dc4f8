//! Voxlock cryptographic primitives.
//!
//! Building blocks for the two encryption layers of the voice media plane.
//! Everything here is deterministic given its inputs; callers own nonce
//! management and randomness.
//!
//! # Key Lifecycle
//!
//! Media keys descend from the MLS group secret. For each epoch, a
//! per-member base secret seeds a one-way HMAC ratchet; the ratchet turns a
//! generation index into a short-lived AES-128 frame key. Advancing past a
//! generation and deleting its key makes every earlier generation
//! unrecoverable.
//!
//! ```text
//! MLS Epoch Secret
//!        │
//!        ▼
//! export → Per-member ratchet seed
//!        │
//!        ▼
//! HMAC Key Ratchet → Frame Keys (one per generation)
//!        │
//!        ▼
//! AES-128-GCM → Encrypted media frames (8-byte truncated tag)
//! ```
//!
//! The transport layer is separate: every UDP packet is sealed with
//! XChaCha20-Poly1305 under the session transport key, regardless of
//! whether the inner frame is end-to-end encrypted.
//!
//! # Security
//!
//! Forward secrecy:
//! - Epoch rotation replaces every ratchet seed
//! - Chain keys are zeroized as the ratchet advances
//! - Deleted generations cannot be re-derived
//!
//! Authenticity:
//! - Frame AEAD binds the packetizer-visible header bytes as additional
//!   data; a tampered header fails the tag check
//! - Transport AEAD binds the RTP header the same way

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod aead;
mod errors;
pub mod ratchet;
pub mod transport;

pub use aead::{
    AES_GCM_KEY_BYTES, AES_GCM_NONCE_BYTES, FrameCipher, TRUNCATED_SYNC_NONCE_BYTES,
    TRUNCATED_SYNC_NONCE_OFFSET, TRUNCATED_TAG_BYTES,
};
pub use errors::CryptoError;
pub use ratchet::{FrameKey, HmacKeyRatchet, KeyGeneration, KeyRatchet, derive_ratchet_seed};
pub use transport::{
    TRANSPORT_KEY_BYTES, TRANSPORT_NONCE_BYTES, TRANSPORT_TAG_BYTES, TransportCipher,
};
