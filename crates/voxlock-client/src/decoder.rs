//! Audio decoder contract.
//!
//! The Opus codec library is an external collaborator; the receive
//! pipeline consumes only this narrow contract. The embedder supplies a
//! factory producing one decoder per speaker; the courier thread owns each
//! decoder exclusively after that.

/// Sample rate the voice pipeline runs at.
pub const OPUS_SAMPLE_RATE_HZ: u32 = 48_000;

/// Stereo.
pub const OPUS_CHANNEL_COUNT: usize = 2;

/// Samples per channel in a 20 ms frame at 48 kHz.
pub const OPUS_FRAME_SAMPLES: usize = 960;

/// A voice decoder for one speaker.
///
/// Decoders are stateful across frames (Opus carries inter-frame
/// prediction), which is why each speaker gets their own.
pub trait AudioDecoder: Send {
    /// Decode one packet into interleaved 16-bit stereo PCM.
    ///
    /// `packet = None` requests packet-loss concealment for one frame.
    /// Returns the number of samples per channel written, zero on a
    /// corrupt packet.
    fn decode(&mut self, packet: Option<&[u8]>, pcm_out: &mut [i16]) -> usize;

    /// Set the decoder output gain in Q8 dB units
    /// (`gain = log10(factor) * 20 * 256`).
    fn set_gain_q8_db(&mut self, _gain: i16) {}
}

/// Factory producing a fresh decoder per speaker.
pub type DecoderFactory = Box<dyn Fn() -> Box<dyn AudioDecoder> + Send>;

/// Convert a linear amplitude factor to Q8 dB gain units.
///
/// A factor of zero maps to the decoder minimum (hard mute); negative
/// factors are invalid and map to `None`.
pub fn gain_factor_to_q8_db(factor: f32) -> Option<i16> {
    if factor < 0.0 {
        return None;
    }
    if factor == 0.0 {
        return Some(i16::MIN);
    }
    Some((factor.log10() * 20.0 * 256.0) as i16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_gain_is_zero() {
        assert_eq!(gain_factor_to_q8_db(1.0), Some(0));
    }

    #[test]
    fn zero_factor_is_hard_mute() {
        assert_eq!(gain_factor_to_q8_db(0.0), Some(i16::MIN));
    }

    #[test]
    fn negative_factor_is_invalid() {
        assert_eq!(gain_factor_to_q8_db(-1.0), None);
    }

    #[test]
    fn double_amplitude_is_about_six_db() {
        let gain = gain_factor_to_q8_db(2.0).unwrap();
        // 6.02 dB in Q8: ~1541.
        assert!((1500..1600).contains(&gain));
    }
}
