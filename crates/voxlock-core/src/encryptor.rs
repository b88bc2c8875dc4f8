//! Outbound media encryption.
//!
//! The encryptor owns the send-side key ratchet exclusively. For every
//! frame it advances a 32-bit truncated nonce, derives the generation from
//! the nonce's top bits, encrypts under that generation's cipher, and
//! assembles the wire frame. Codecs whose packetizers reject certain byte
//! sequences get a validation pass with nonce re-roll and retry.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicU16, Ordering},
};

use tracing::{debug, info, warn};
use voxlock_crypto::{
    FrameCipher, KeyGeneration, KeyRatchet, TRUNCATED_TAG_BYTES, aead::expand_truncated_nonce,
};
use voxlock_proto::{
    Codec, MAGIC_MARKER, OutboundFrameProcessor, SUPPLEMENTAL_OVERHEAD, TRANSFORM_PADDING,
    codecs::validate_encrypted_frame,
    leb128::{LEB128_MAX_SIZE, leb128_size, write_leb128},
    serialize_unencrypted_ranges, unencrypted_ranges_size,
};

use crate::{
    DISABLED_PROTOCOL_VERSION, Environment, MAX_PROTOCOL_VERSION, MediaType,
    errors::MediaCryptoError,
    manager::{RATCHET_GENERATION_SHIFT_BITS, compute_wrapped_generation},
};

/// Retry budget for codec-rejected ciphertexts.
pub const MAX_CIPHERTEXT_VALIDATION_RETRIES: u32 = 10;

/// Interval between stats log lines.
const STATS_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);

/// Observer notified when the effective protocol version flips between
/// end-to-end encrypted and passthrough.
pub trait ProtocolVersionObserver: Send + Sync {
    /// The encryptor's effective protocol version changed.
    fn protocol_version_changed(&self, version: u16);
}

/// Per-media-type outbound counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct EncryptorStats {
    /// Frames forwarded unencrypted while passthrough was on.
    pub passthrough_count: u64,
    /// Frames encrypted successfully.
    pub encrypt_success_count: u64,
    /// Frames dropped on the floor.
    pub encrypt_failure_count: u64,
    /// Total microseconds spent in encrypt.
    pub encrypt_duration_micros: u64,
    /// Individual encryption attempts, including retries.
    pub encrypt_attempts: u64,
    /// Largest retry count any single frame needed.
    pub encrypt_max_attempts: u64,
}

struct KeyState {
    ratchet: Option<Box<dyn KeyRatchet>>,
    cipher: Option<Arc<FrameCipher>>,
    current_generation: KeyGeneration,
    truncated_nonce: u32,
}

/// Outbound frame encryptor.
pub struct Encryptor<E: Environment> {
    env: E,
    passthrough: AtomicBool,
    key_state: Mutex<KeyState>,
    processors: Mutex<Vec<OutboundFrameProcessor>>,
    ssrc_codecs: Mutex<Vec<(u32, Codec)>>,
    stats: Mutex<[EncryptorStats; 2]>,
    last_stats_time: Mutex<Option<E::Instant>>,
    protocol_version: AtomicU16,
    version_observer: Option<Arc<dyn ProtocolVersionObserver>>,
}

impl<E: Environment> Encryptor<E> {
    /// Create an encryptor with no ratchet installed.
    pub fn new(env: E) -> Self {
        Self::with_observer(env, None)
    }

    /// Create an encryptor that notifies `observer` on protocol version
    /// changes.
    pub fn with_observer(env: E, observer: Option<Arc<dyn ProtocolVersionObserver>>) -> Self {
        Self {
            env,
            passthrough: AtomicBool::new(false),
            key_state: Mutex::new(KeyState {
                ratchet: None,
                cipher: None,
                current_generation: 0,
                truncated_nonce: 0,
            }),
            processors: Mutex::new(Vec::new()),
            ssrc_codecs: Mutex::new(Vec::new()),
            stats: Mutex::new([EncryptorStats::default(); 2]),
            last_stats_time: Mutex::new(None),
            protocol_version: AtomicU16::new(MAX_PROTOCOL_VERSION),
            version_observer: observer,
        }
    }

    /// Install a fresh key ratchet, resetting generation and nonce state.
    pub fn set_key_ratchet(&self, ratchet: Box<dyn KeyRatchet>) {
        let Ok(mut state) = self.key_state.lock() else {
            unreachable!("encryptor key state mutex poisoned");
        };
        state.ratchet = Some(ratchet);
        state.cipher = None;
        state.current_generation = 0;
        state.truncated_nonce = 0;
    }

    /// Whether a ratchet is installed.
    pub fn has_key_ratchet(&self) -> bool {
        let Ok(state) = self.key_state.lock() else {
            unreachable!("encryptor key state mutex poisoned");
        };
        state.ratchet.is_some()
    }

    /// Switch passthrough on or off.
    ///
    /// Passthrough forwards frames unencrypted (used before the group is
    /// established and during downgrades) and pins the effective protocol
    /// version to the disabled value.
    pub fn set_passthrough_mode(&self, passthrough: bool) {
        self.passthrough.store(passthrough, Ordering::Relaxed);
        self.update_protocol_version(if passthrough {
            DISABLED_PROTOCOL_VERSION
        } else {
            MAX_PROTOCOL_VERSION
        });
    }

    /// Whether passthrough is on.
    pub fn is_passthrough(&self) -> bool {
        self.passthrough.load(Ordering::Relaxed)
    }

    /// Effective protocol version.
    pub fn protocol_version(&self) -> u16 {
        self.protocol_version.load(Ordering::Relaxed)
    }

    /// Bind an SSRC to a codec for header-split decisions.
    pub fn assign_ssrc_to_codec(&self, ssrc: u32, codec: Codec) {
        let Ok(mut codecs) = self.ssrc_codecs.lock() else {
            unreachable!("encryptor ssrc map mutex poisoned");
        };
        match codecs.iter_mut().find(|(existing, _)| *existing == ssrc) {
            Some(entry) => entry.1 = codec,
            None => codecs.push((ssrc, codec)),
        }
    }

    /// Codec for an SSRC; unassigned SSRCs get [`Codec::Unknown`].
    pub fn codec_for_ssrc(&self, ssrc: u32) -> Codec {
        let Ok(codecs) = self.ssrc_codecs.lock() else {
            unreachable!("encryptor ssrc map mutex poisoned");
        };
        codecs.iter().find(|(existing, _)| *existing == ssrc).map(|(_, codec)| *codec).unwrap_or_default()
    }

    /// Worst-case output size for a frame of `frame_size` bytes.
    pub fn max_ciphertext_size(frame_size: usize) -> usize {
        frame_size + SUPPLEMENTAL_OVERHEAD + TRUNCATED_TAG_BYTES + TRANSFORM_PADDING
    }

    /// Outbound counters for a media type.
    pub fn stats(&self, media_type: MediaType) -> EncryptorStats {
        let Ok(stats) = self.stats.lock() else {
            unreachable!("encryptor stats mutex poisoned");
        };
        stats[media_type.index()]
    }

    /// Encrypt `frame` into `out`, returning the bytes written.
    ///
    /// In passthrough mode the frame is copied verbatim. Without a ratchet
    /// this fails with [`MediaCryptoError::NoRatchet`].
    pub fn encrypt(
        &self,
        media_type: MediaType,
        ssrc: u32,
        frame: &[u8],
        out: &mut [u8],
    ) -> Result<usize, MediaCryptoError> {
        if self.is_passthrough() {
            out[..frame.len()].copy_from_slice(frame);
            self.bump(media_type, |stats| stats.passthrough_count += 1);
            return Ok(frame.len());
        }

        if !self.has_key_ratchet() {
            self.bump(media_type, |stats| stats.encrypt_failure_count += 1);
            return Err(MediaCryptoError::NoRatchet);
        }

        let start = self.env.now();
        let mut processor = self.take_processor();
        let result = self.encrypt_with_processor(&mut processor, media_type, ssrc, frame, out);
        self.return_processor(processor);

        let now = self.env.now();
        let elapsed = (now - start).as_micros() as u64;
        self.bump(media_type, |stats| {
            stats.encrypt_duration_micros += elapsed;
            match result {
                Ok(_) => stats.encrypt_success_count += 1,
                Err(_) => stats.encrypt_failure_count += 1,
            }
        });
        self.maybe_log_stats(now, media_type, ssrc, frame.len());

        result
    }

    fn encrypt_with_processor(
        &self,
        processor: &mut OutboundFrameProcessor,
        media_type: MediaType,
        ssrc: u32,
        frame: &[u8],
        out: &mut [u8],
    ) -> Result<usize, MediaCryptoError> {
        let codec = self.codec_for_ssrc(ssrc);
        processor.process_frame(frame, codec);

        let ranges = processor.unencrypted_ranges().to_vec();
        let ranges_size = unencrypted_ranges_size(&ranges);
        let frame_size = processor.reconstructed_size();

        let plaintext = processor.plaintext_bytes().to_vec();
        let additional_data = processor.unencrypted_bytes().to_vec();

        // Some codec packetizers cannot handle specific byte sequences, so
        // we re-roll the nonce (which changes ciphertext, tag, and the
        // nonce bytes on the wire) and retry until validation passes.
        for attempt in 1..=MAX_CIPHERTEXT_VALIDATION_RETRIES {
            let (cipher, truncated_nonce) = self.next_cipher_and_nonce()?;
            let nonce = expand_truncated_nonce(truncated_nonce);

            let mut tag = [0u8; TRUNCATED_TAG_BYTES];
            let encrypted = cipher.encrypt(
                processor.ciphertext_bytes_mut(),
                &plaintext,
                &nonce,
                &additional_data,
                &mut tag,
            );

            self.bump(media_type, |stats| {
                stats.encrypt_attempts += 1;
                stats.encrypt_max_attempts = stats.encrypt_max_attempts.max(u64::from(attempt));
            });

            if !encrypted {
                warn!(ssrc, "frame encryption failed");
                return Err(MediaCryptoError::EncryptionFailure);
            }

            let nonce_size = leb128_size(u64::from(truncated_nonce));
            let total = frame_size
                + TRUNCATED_TAG_BYTES
                + nonce_size
                + ranges_size
                + SUPPLEMENTAL_OVERHEAD;
            if out.len() < total {
                return Err(MediaCryptoError::EncryptionFailure);
            }

            let reconstructed = processor.reconstruct_frame(out);
            debug_assert_eq!(reconstructed, frame_size);

            let mut at = frame_size;
            out[at..at + TRUNCATED_TAG_BYTES].copy_from_slice(&tag);
            at += TRUNCATED_TAG_BYTES;

            let mut nonce_buf = [0u8; LEB128_MAX_SIZE];
            let written = write_leb128(u64::from(truncated_nonce), &mut nonce_buf)?;
            debug_assert_eq!(written, nonce_size);
            out[at..at + nonce_size].copy_from_slice(&nonce_buf[..nonce_size]);
            at += nonce_size;

            let written = serialize_unencrypted_ranges(&ranges, &mut out[at..at + ranges_size])?;
            debug_assert_eq!(written, ranges_size);
            at += ranges_size;

            out[at] = (SUPPLEMENTAL_OVERHEAD + nonce_size + ranges_size) as u8;
            at += 1;
            out[at..at + 2].copy_from_slice(&MAGIC_MARKER.to_be_bytes());
            at += 2;
            debug_assert_eq!(at, total);

            if validate_encrypted_frame(codec, &out[..total]) {
                return Ok(total);
            }
            if attempt == MAX_CIPHERTEXT_VALIDATION_RETRIES {
                warn!(ssrc, attempts = attempt, "ciphertext validation budget exhausted");
                return Err(MediaCryptoError::EncryptionFailure);
            }
            debug!(ssrc, attempt, "ciphertext rejected by codec, re-rolling nonce");
        }

        Err(MediaCryptoError::EncryptionFailure)
    }

    fn next_cipher_and_nonce(&self) -> Result<(Arc<FrameCipher>, u32), MediaCryptoError> {
        let Ok(mut state) = self.key_state.lock() else {
            unreachable!("encryptor key state mutex poisoned");
        };
        if state.ratchet.is_none() {
            return Err(MediaCryptoError::NoRatchet);
        }

        state.truncated_nonce = state.truncated_nonce.wrapping_add(1);
        let truncated_nonce = state.truncated_nonce;
        let generation = compute_wrapped_generation(
            state.current_generation,
            truncated_nonce >> RATCHET_GENERATION_SHIFT_BITS,
        );

        if generation != state.current_generation || state.cipher.is_none() {
            state.current_generation = generation;
            let Some(ratchet) = state.ratchet.as_mut() else {
                unreachable!("checked above");
            };
            let key = ratchet.get_key(generation)?;
            state.cipher = Some(Arc::new(FrameCipher::new(key.key())));
        }

        let Some(cipher) = state.cipher.clone() else {
            unreachable!("cipher installed above");
        };
        Ok((cipher, truncated_nonce))
    }

    fn update_protocol_version(&self, version: u16) {
        if self.protocol_version.swap(version, Ordering::Relaxed) != version {
            if let Some(observer) = &self.version_observer {
                observer.protocol_version_changed(version);
            }
        }
    }

    fn take_processor(&self) -> OutboundFrameProcessor {
        let Ok(mut processors) = self.processors.lock() else {
            unreachable!("encryptor pool mutex poisoned");
        };
        processors.pop().unwrap_or_default()
    }

    fn return_processor(&self, processor: OutboundFrameProcessor) {
        let Ok(mut processors) = self.processors.lock() else {
            unreachable!("encryptor pool mutex poisoned");
        };
        processors.push(processor);
    }

    fn bump(&self, media_type: MediaType, update: impl FnOnce(&mut EncryptorStats)) {
        let Ok(mut stats) = self.stats.lock() else {
            unreachable!("encryptor stats mutex poisoned");
        };
        update(&mut stats[media_type.index()]);
    }

    fn maybe_log_stats(&self, now: E::Instant, media_type: MediaType, ssrc: u32, size: usize) {
        let Ok(mut last) = self.last_stats_time.lock() else {
            unreachable!("encryptor stats mutex poisoned");
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
            unreachable!("encryptor stats mutex poisoned");
        };
        let audio = stats[MediaType::Audio.index()];
        let video = stats[MediaType::Video.index()];
        info!(
            audio_success = audio.encrypt_success_count,
            video_success = video.encrypt_success_count,
            audio_failure = audio.encrypt_failure_count,
            video_failure = video.encrypt_failure_count,
            "encryptor stats"
        );
        info!(media_type = ?media_type, ssrc, size, "last encrypted frame");
    }
}
