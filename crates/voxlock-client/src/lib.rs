//! Voxlock voice client.
//!
//! The driver half of the media plane: the sans-IO voice session state
//! machine, the WebSocket and UDP transports that feed it, the courier
//! thread that turns decrypted packets back into ordered audio, and the
//! persisted signature key storage.
//!
//! # Architecture
//!
//! The [`session::VoiceSession`] is a pure state machine in the action
//! pattern: the transports push received frames in, actions (frames to
//! send, sockets to open, discovery to run) come out, and the drivers
//! execute them. Time is injected through the [`voxlock_core::Environment`]
//! trait, so every timeout and heartbeat is testable without a network.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod courier;
pub mod decoder;
mod env;
mod errors;
pub mod key_store;
pub mod mixer;
pub mod session;
pub mod transport;
pub mod udp;

pub use courier::{Courier, VoicePayload, VoiceSink};
pub use decoder::{
    AudioDecoder, DecoderFactory, OPUS_CHANNEL_COUNT, OPUS_FRAME_SAMPLES, OPUS_SAMPLE_RATE_HZ,
};
pub use env::SystemEnv;
pub use errors::ClientError;
pub use key_store::KeyPairStore;
pub use session::{SessionAction, SessionState, VoiceConfig, VoiceSession};
