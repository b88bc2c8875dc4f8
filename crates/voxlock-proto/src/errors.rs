//! Error types for wire-format parsing and serialization.

use thiserror::Error;

/// Errors produced while parsing or emitting wire formats.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame is too short to contain the claimed structure.
    #[error("frame truncated: need {needed} bytes, have {available}")]
    FrameTruncated {
        /// Bytes required by the structure being parsed.
        needed: usize,
        /// Bytes actually present.
        available: usize,
    },

    /// A LEB128 varint ran past the end of the buffer or overflowed.
    #[error("malformed varint")]
    MalformedVarint,

    /// The unencrypted-range table is inconsistent with the frame.
    #[error("invalid unencrypted ranges: {reason}")]
    InvalidRanges {
        /// Why the range table was rejected.
        reason: &'static str,
    },

    /// The supplemental block claims a size the frame cannot hold.
    #[error("invalid supplemental size {supplemental} for frame of {frame} bytes")]
    InvalidSupplementalSize {
        /// Claimed supplemental byte count.
        supplemental: usize,
        /// Total frame size.
        frame: usize,
    },

    /// RTP header failed structural validation.
    #[error("invalid rtp packet: {reason}")]
    InvalidRtp {
        /// Why the packet was rejected.
        reason: &'static str,
    },

    /// A gateway JSON payload failed to decode.
    #[error("invalid gateway payload: {0}")]
    InvalidPayload(String),

    /// A DAVE binary frame was shorter than its fixed header.
    #[error("dave binary frame truncated")]
    DaveFrameTruncated,

    /// Unknown opcode value on the wire.
    #[error("unknown opcode: {0}")]
    UnknownOpcode(u8),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidPayload(err.to_string())
    }
}
