//! MLS group session for the voice call.
//!
//! Wraps OpenMLS behind the small surface the voice session needs: publish
//! a key package, process proposals into an optional commit, apply commits
//! and welcomes, and hand out a per-member media key ratchet after every
//! epoch change. The epoch authenticator doubles as the source of the
//! displayable privacy code.

mod display;
mod provider;
mod session;

pub use display::generate_displayable_code;
pub use provider::MlsProvider;
pub use session::{
    MlsSession, PAIRWISE_CODE_DIGITS, PAIRWISE_FINGERPRINT_BYTES, PRIVACY_CODE_DIGITS,
    USER_MEDIA_KEY_BASE_LABEL,
};
