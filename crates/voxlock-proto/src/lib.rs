//! Wire formats for the Voxlock voice media plane.
//!
//! Everything in this crate is sans-IO: byte-level codecs and plain data
//! types with no sockets, no clocks, and no crypto. Higher layers feed
//! buffers in and get structured views or serialized frames out.
//!
//! # Layers
//!
//! - [`frame`] - the encrypted media frame layout carried inside RTP
//!   payloads: unencrypted prefix, ciphertext, truncated tag, LEB128 nonce,
//!   unencrypted-range table, supplemental size, magic marker.
//! - [`rtp`] - the outer RTP packet shape: header, CSRC list, extension
//!   header, trailing wire nonce.
//! - [`gateway`] - the JSON control plane and the binary MLS message
//!   framing spoken over the voice gateway WebSocket.
//! - [`discovery`] - the fixed 74-byte IP discovery packet.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod codecs;
pub mod discovery;
mod errors;
pub mod frame;
pub mod gateway;
pub mod leb128;
pub mod rtp;

pub use codecs::Codec;
pub use errors::ProtocolError;
pub use frame::{
    FRAME_TAG_BYTES, InboundFrameProcessor, MAGIC_MARKER, OutboundFrameProcessor, Range,
    SUPPLEMENTAL_OVERHEAD, TRANSFORM_PADDING, deserialize_unencrypted_ranges,
    serialize_unencrypted_ranges, unencrypted_ranges_size, validate_unencrypted_ranges,
};
pub use gateway::{DaveBinaryFrame, DaveOpcode, GatewayOpcode};
pub use rtp::{OPUS_SILENCE_PACKET, RtpHeader};

/// Result alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;
