//! Inbound media decryption.
//!
//! The decryptor holds an ordered queue of cipher managers, one per key
//! ratchet the call has transitioned through, oldest at the head. Each
//! frame is tried against the newest ratchet first. Unencrypted frames are
//! forwarded only while the passthrough window is open; the window starts
//! open (nothing is end-to-end encrypted before the group exists) and is
//! closed, with a grace period, when a transition demands it.

use std::{
    sync::Mutex,
    time::Duration,
};

use tracing::{debug, info, warn};
use voxlock_crypto::{KeyRatchet, aead::expand_truncated_nonce};
use voxlock_proto::{InboundFrameProcessor, rtp::OPUS_SILENCE_PACKET};

use crate::{
    Environment, MediaType,
    manager::{CipherManager, DEFAULT_TRANSITION_EXPIRY, RATCHET_GENERATION_SHIFT_BITS},
};

/// Interval between stats log lines.
const STATS_INTERVAL: Duration = Duration::from_secs(10);

/// Per-media-type inbound counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct DecryptorStats {
    /// Unencrypted frames forwarded during the passthrough window.
    pub passthrough_count: u64,
    /// Frames decrypted successfully.
    pub decrypt_success_count: u64,
    /// Frames no active ratchet could authenticate.
    pub decrypt_failure_count: u64,
    /// Total microseconds spent in decrypt.
    pub decrypt_duration_micros: u64,
    /// Individual AEAD attempts across all managers.
    pub decrypt_attempts: u64,
}

/// How long unencrypted frames may still pass.
#[derive(Clone, Copy)]
enum PassthroughWindow<I> {
    /// Forwarded unconditionally.
    Open,
    /// Forwarded until the deadline.
    Until(I),
}

struct State<E: Environment> {
    managers: std::collections::VecDeque<CipherManager<E>>,
    passthrough: PassthroughWindow<E::Instant>,
}

/// Inbound frame decryptor.
pub struct Decryptor<E: Environment> {
    env: E,
    state: Mutex<State<E>>,
    processors: Mutex<Vec<InboundFrameProcessor>>,
    stats: Mutex<[DecryptorStats; 2]>,
    last_stats_time: Mutex<Option<E::Instant>>,
}

impl<E: Environment> Decryptor<E> {
    /// Create a decryptor with no ratchets and an open passthrough window.
    pub fn new(env: E) -> Self {
        Self {
            env,
            state: Mutex::new(State {
                managers: std::collections::VecDeque::new(),
                passthrough: PassthroughWindow::Open,
            }),
            processors: Mutex::new(Vec::new()),
            stats: Mutex::new([DecryptorStats::default(); 2]),
            last_stats_time: Mutex::new(None),
        }
    }

    /// Install a new key ratchet.
    ///
    /// Every existing manager's expiry is clamped to `now +
    /// transition_expiry`; the new manager never expires until superseded
    /// itself.
    pub fn transition_to_key_ratchet(
        &self,
        ratchet: Box<dyn KeyRatchet>,
        transition_expiry: Duration,
    ) {
        info!(expiry_secs = transition_expiry.as_secs(), "transitioning to new key ratchet");
        let deadline = self.env.now() + transition_expiry;

        let Ok(mut state) = self.state.lock() else {
            unreachable!("decryptor state mutex poisoned");
        };
        for manager in &mut state.managers {
            manager.update_expiry(deadline);
        }
        state.managers.push_back(CipherManager::new(self.env.clone(), ratchet));
    }

    /// Install a new key ratchet with the default transition grace.
    pub fn transition_to_key_ratchet_default(&self, ratchet: Box<dyn KeyRatchet>) {
        self.transition_to_key_ratchet(ratchet, DEFAULT_TRANSITION_EXPIRY);
    }

    /// Open or (gracefully) close the passthrough window.
    ///
    /// `passthrough = true` opens it indefinitely; `false` shrinks it to
    /// at most `now + transition_expiry`.
    pub fn transition_to_passthrough(&self, passthrough: bool, transition_expiry: Duration) {
        let Ok(mut state) = self.state.lock() else {
            unreachable!("decryptor state mutex poisoned");
        };
        if passthrough {
            state.passthrough = PassthroughWindow::Open;
        } else {
            let deadline = self.env.now() + transition_expiry;
            state.passthrough = match state.passthrough {
                PassthroughWindow::Open => PassthroughWindow::Until(deadline),
                PassthroughWindow::Until(current) => {
                    PassthroughWindow::Until(current.min(deadline))
                },
            };
        }
    }

    /// Inbound counters for a media type.
    pub fn stats(&self, media_type: MediaType) -> DecryptorStats {
        let Ok(stats) = self.stats.lock() else {
            unreachable!("decryptor stats mutex poisoned");
        };
        stats[media_type.index()]
    }

    /// Worst-case plaintext size for an encrypted frame.
    pub fn max_plaintext_size(encrypted_frame_size: usize) -> usize {
        encrypted_frame_size
    }

    /// Decrypt `wire` into `out`. Returns the bytes written; zero means
    /// the frame was dropped (and counted as a failure).
    pub fn decrypt(&self, media_type: MediaType, wire: &[u8], out: &mut [u8]) -> usize {
        let start = self.env.now();

        // Silence frames are never encrypted.
        if media_type == MediaType::Audio && wire == OPUS_SILENCE_PACKET {
            debug!(size = wire.len(), "skipping silence frame");
            out[..wire.len()].copy_from_slice(wire);
            return wire.len();
        }

        let mut processor = self.take_processor();
        let written = self.decrypt_with_processor(&mut processor, media_type, wire, out, start);
        self.return_processor(processor);

        let now = self.env.now();
        let elapsed = (now - start).as_micros() as u64;
        self.bump(media_type, |stats| stats.decrypt_duration_micros += elapsed);
        self.maybe_log_stats(now);

        written
    }

    fn decrypt_with_processor(
        &self,
        processor: &mut InboundFrameProcessor,
        media_type: MediaType,
        wire: &[u8],
        out: &mut [u8],
        start: E::Instant,
    ) -> usize {
        let Ok(mut state) = self.state.lock() else {
            unreachable!("decryptor state mutex poisoned");
        };

        // Remove managers whose transition grace has lapsed.
        while matches!(state.managers.front(), Some(manager) if manager.is_expired()) {
            info!("removing expired cipher manager");
            state.managers.pop_front();
        }

        if processor.parse_frame(wire).is_err() {
            warn!(size = wire.len(), "inbound frame failed to parse");
            self.bump(media_type, |stats| stats.decrypt_failure_count += 1);
            return 0;
        }

        let passthrough_open = match state.passthrough {
            PassthroughWindow::Open => true,
            PassthroughWindow::Until(deadline) => deadline > start,
        };

        if !processor.is_encrypted() {
            if passthrough_open {
                out[..wire.len()].copy_from_slice(wire);
                self.bump(media_type, |stats| stats.passthrough_count += 1);
                return wire.len();
            }
            debug!("unencrypted frame after passthrough window closed");
            self.bump(media_type, |stats| stats.decrypt_failure_count += 1);
            return 0;
        }

        // Newest ratchet first: during a transition most traffic is
        // already on the new key.
        let mut success = false;
        for manager in state.managers.iter_mut().rev() {
            if self.try_decrypt(manager, media_type, processor) {
                success = true;
                break;
            }
        }

        if !success {
            self.bump(media_type, |stats| stats.decrypt_failure_count += 1);
            warn!(
                media_type = ?media_type,
                frame_size = wire.len(),
                managers = state.managers.len(),
                passthrough = passthrough_open,
                "no active ratchet could decrypt frame"
            );
            return 0;
        }

        self.bump(media_type, |stats| stats.decrypt_success_count += 1);
        processor.reconstruct_frame(out)
    }

    fn try_decrypt(
        &self,
        manager: &mut CipherManager<E>,
        media_type: MediaType,
        processor: &mut InboundFrameProcessor,
    ) -> bool {
        let truncated_nonce = processor.truncated_nonce();
        let generation =
            manager.compute_wrapped_generation(truncated_nonce >> RATCHET_GENERATION_SHIFT_BITS);

        if !manager.can_process_nonce(generation, truncated_nonce) {
            debug!(truncated_nonce, "replayed or stale nonce");
            return false;
        }

        let Ok(cipher) = manager.get_cipher(generation) else {
            debug!(generation, "no cipher for generation");
            return false;
        };

        let nonce = expand_truncated_nonce(truncated_nonce);
        let tag = *processor.tag();
        let ciphertext = processor.ciphertext().to_vec();
        let authenticated = processor.authenticated_data().to_vec();
        let success =
            cipher.decrypt(processor.plaintext_mut(), &ciphertext, &tag, &nonce, &authenticated);

        self.bump(media_type, |stats| stats.decrypt_attempts += 1);

        if success {
            manager.report_cipher_success(generation, truncated_nonce);
        }
        success
    }

    fn take_processor(&self) -> InboundFrameProcessor {
        let Ok(mut processors) = self.processors.lock() else {
            unreachable!("decryptor pool mutex poisoned");
        };
        processors.pop().unwrap_or_default()
    }

    fn return_processor(&self, processor: InboundFrameProcessor) {
        let Ok(mut processors) = self.processors.lock() else {
            unreachable!("decryptor pool mutex poisoned");
        };
        processors.push(processor);
    }

    fn bump(&self, media_type: MediaType, update: impl FnOnce(&mut DecryptorStats)) {
        let Ok(mut stats) = self.stats.lock() else {
            unreachable!("decryptor stats mutex poisoned");
        };
        update(&mut stats[media_type.index()]);
    }

    fn maybe_log_stats(&self, now: E::Instant) {
        let Ok(mut last) = self.last_stats_time.lock() else {
            unreachable!("decryptor stats mutex poisoned");
        };
        let due = match *last {
            Some(previous) => now - previous > STATS_INTERVAL,
            None => true,
        };
        if !due {
            return;
        }
        *last = Some(now);

        let Ok(stats) = self.stats.lock() else {
            unreachable!("decryptor stats mutex poisoned");
        };
        let audio = stats[MediaType::Audio.index()];
        let video = stats[MediaType::Video.index()];
        info!(
            audio_success = audio.decrypt_success_count,
            video_success = video.decrypt_success_count,
            audio_failure = audio.decrypt_failure_count,
            video_failure = video.decrypt_failure_count,
            "decryptor stats"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::env::SimEnv;

    #[test]
    fn silence_frames_pass_untouched() {
        let decryptor = Decryptor::new(SimEnv::default());
        let mut out = [0u8; 3];

        let written = decryptor.decrypt(MediaType::Audio, &OPUS_SILENCE_PACKET, &mut out);
        assert_eq!(written, 3);
        assert_eq!(out, OPUS_SILENCE_PACKET);
    }

    #[test]
    fn unencrypted_frames_pass_while_window_open() {
        let decryptor = Decryptor::new(SimEnv::default());
        let frame = [1u8, 2, 3, 4, 5];
        let mut out = [0u8; 5];

        let written = decryptor.decrypt(MediaType::Audio, &frame, &mut out);
        assert_eq!(written, 5);
        assert_eq!(out, frame);
        assert_eq!(decryptor.stats(MediaType::Audio).passthrough_count, 1);
    }

    #[test]
    fn passthrough_window_closes_after_expiry() {
        let env = SimEnv::default();
        let decryptor = Decryptor::new(env.clone());
        let frame = [1u8, 2, 3, 4, 5];
        let mut out = [0u8; 5];

        decryptor.transition_to_passthrough(false, Duration::from_millis(200));

        // Inside the grace window.
        assert_eq!(decryptor.decrypt(MediaType::Audio, &frame, &mut out), 5);

        env.advance(Duration::from_millis(300));
        assert_eq!(decryptor.decrypt(MediaType::Audio, &frame, &mut out), 0);
        assert_eq!(decryptor.stats(MediaType::Audio).decrypt_failure_count, 1);
    }

    #[test]
    fn reopening_passthrough_overrides_deadline() {
        let env = SimEnv::default();
        let decryptor = Decryptor::new(env.clone());
        let frame = [1u8, 2, 3, 4, 5];
        let mut out = [0u8; 5];

        decryptor.transition_to_passthrough(false, Duration::from_millis(100));
        env.advance(Duration::from_millis(500));
        decryptor.transition_to_passthrough(true, Duration::ZERO);

        assert_eq!(decryptor.decrypt(MediaType::Audio, &frame, &mut out), 5);
    }
}
