//! Client-level errors.
//!
//! Per-frame media errors never reach this level; they are counted and
//! dropped inside the engine. These errors concern the session itself.

use thiserror::Error;

/// Errors from the voice session and its transports.
#[derive(Debug, Error)]
pub enum ClientError {
    /// A socket could not be bound or connected.
    #[error("transport setup failure: {0}")]
    TransportSetupFailure(String),

    /// The server closed the session with a fatal voice error code.
    /// Codes 4003-4016 are fatal except 4014, which triggers a resume.
    #[error("fatal voice protocol error {0}")]
    VoiceProtocolFatal(u16),

    /// A control frame failed to parse.
    #[error(transparent)]
    Protocol(#[from] voxlock_proto::ProtocolError),

    /// The MLS session rejected a message.
    #[error(transparent)]
    Mls(#[from] voxlock_core::MlsError),

    /// An operation arrived in a state that cannot handle it.
    #[error("invalid session state: {0}")]
    InvalidState(&'static str),

    /// The WebSocket failed.
    #[error("gateway transport: {0}")]
    Gateway(String),

    /// Persisted key storage failed.
    #[error("key storage: {0}")]
    KeyStorage(String),
}

impl ClientError {
    /// Whether the voice error code is fatal: 4003..=4016, except 4014
    /// which triggers a resume.
    pub fn is_fatal_code(code: u16) -> bool {
        (4003..=4016).contains(&code) && code != 4014
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_code_policy() {
        assert!(ClientError::is_fatal_code(4003));
        assert!(ClientError::is_fatal_code(4006));
        assert!(ClientError::is_fatal_code(4016));
        assert!(!ClientError::is_fatal_code(4014));
        assert!(!ClientError::is_fatal_code(4002));
        assert!(!ClientError::is_fatal_code(1000));
    }
}
