//! Per-codec frame splitting rules.
//!
//! Each codec decides which header bytes must stay visible to packetizers
//! and which bytes get encrypted. Audio is the supported media here: Opus
//! packets are fully self-describing after depacketization, so the whole
//! packet is encrypted with no unencrypted prefix.

use crate::frame::OutboundFrameProcessor;

/// Media codec carried in a frame, keyed by SSRC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    /// Codec not negotiated for this SSRC; treated as having no
    /// unencrypted header.
    #[default]
    Unknown,
    /// Opus audio.
    Opus,
}

/// Split `frame` into unencrypted and encrypted parts per codec rules.
pub(crate) fn split_frame(processor: &mut OutboundFrameProcessor, frame: &[u8], codec: Codec) {
    match codec {
        // No packetizer-visible header: encrypt everything.
        Codec::Unknown | Codec::Opus => processor.add_encrypted_bytes(frame),
    }
}

/// Validate a fully reconstructed encrypted frame for the codec.
///
/// Some video packetizers reject specific byte sequences in the ciphertext
/// and force a re-encrypt under a fresh nonce; audio packetizers accept any
/// byte sequence, so this always passes for the supported codecs. The
/// encryptor still routes every frame through this hook.
pub fn validate_encrypted_frame(codec: Codec, _frame: &[u8]) -> bool {
    match codec {
        Codec::Unknown | Codec::Opus => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opus_frames_are_fully_encrypted() {
        let mut processor = OutboundFrameProcessor::new();
        processor.process_frame(&[1, 2, 3, 4], Codec::Opus);

        assert!(processor.unencrypted_ranges().is_empty());
        assert!(processor.unencrypted_bytes().is_empty());
        assert_eq!(processor.plaintext_bytes(), &[1, 2, 3, 4]);
    }

    #[test]
    fn unknown_codec_has_no_header() {
        let mut processor = OutboundFrameProcessor::new();
        processor.process_frame(&[9, 9], Codec::Unknown);

        assert!(processor.unencrypted_bytes().is_empty());
        assert_eq!(processor.plaintext_bytes(), &[9, 9]);
    }

    #[test]
    fn audio_validation_accepts_any_bytes() {
        assert!(validate_encrypted_frame(Codec::Opus, &[0, 0, 1]));
        assert!(validate_encrypted_frame(Codec::Unknown, &[]));
    }
}
