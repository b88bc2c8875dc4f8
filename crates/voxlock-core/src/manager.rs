//! Ratchet and cipher management for the inbound path.
//!
//! A [`CipherManager`] owns one key ratchet and the ciphers materialized
//! from it. It extends 24-bit wire generations back to full 32-bit
//! counters, enforces plausibility gates before deriving keys, tracks a
//! bounded window of missing nonces for replay protection, and expires
//! ciphers for superseded generations.

use std::{
    collections::{BTreeMap, VecDeque},
    time::Duration,
};

use tracing::debug;
use voxlock_crypto::{FrameCipher, KeyGeneration, KeyRatchet};

use crate::{Environment, errors::MediaCryptoError};

/// Bits of the truncated nonce that identify the frame within a
/// generation; the remaining top bits carry the generation.
pub const RATCHET_GENERATION_SHIFT_BITS: u32 = 24;

/// Wire generations wrap at this modulus.
pub const GENERATION_WRAP: u32 = 1 << RATCHET_GENERATION_SHIFT_BITS;

/// Maximum plausible jump above the newest seen generation.
pub const MAX_GENERATION_GAP: u32 = 250;

/// Bound on the missing-nonce window.
pub const MAX_MISSING_NONCES: usize = 50;

/// Frame-rate bound used for the ratchet lifetime gate.
pub const MAX_FRAMES_PER_SECOND: u64 = 50;

/// How long a superseded generation's cipher survives.
pub const CIPHER_EXPIRY: Duration = Duration::from_secs(10);

/// Default grace period for superseded cipher managers.
pub const DEFAULT_TRANSITION_EXPIRY: Duration = Duration::from_secs(10);

/// A (wrapped generation, truncated nonce) pair projected into a single
/// monotonically increasing replay identifier.
pub type BigNonce = u64;

/// Extend a truncated 24-bit wire generation to a full 32-bit counter,
/// anchored at the oldest generation still tracked.
pub fn compute_wrapped_generation(oldest: KeyGeneration, generation: KeyGeneration) -> KeyGeneration {
    // Assume generation >= oldest; a wrong assumption lands in the max
    // generation gap check instead.
    let remainder = oldest % GENERATION_WRAP;
    let factor = oldest / GENERATION_WRAP + u32::from(generation < remainder);
    factor.wrapping_mul(GENERATION_WRAP).wrapping_add(generation)
}

/// Project a wrapped generation and truncated nonce into a [`BigNonce`].
pub fn compute_wrapped_big_nonce(generation: KeyGeneration, nonce: u32) -> BigNonce {
    let masked = u64::from(nonce) & ((1 << RATCHET_GENERATION_SHIFT_BITS) - 1);
    (u64::from(generation) << RATCHET_GENERATION_SHIFT_BITS) | masked
}

struct ExpiringCipher<I> {
    cipher: FrameCipher,
    /// `None` = never expires.
    expiry: Option<I>,
}

/// Per-ratchet cipher cache and replay tracker.
pub struct CipherManager<E: Environment> {
    env: E,
    ratchet: Box<dyn KeyRatchet>,
    ratchet_creation: E::Instant,
    /// `None` = never expires.
    ratchet_expiry: Option<E::Instant>,
    oldest_generation: KeyGeneration,
    newest_generation: KeyGeneration,
    ciphers: BTreeMap<KeyGeneration, ExpiringCipher<E::Instant>>,
    newest_processed_nonce: Option<BigNonce>,
    missing_nonces: VecDeque<BigNonce>,
}

impl<E: Environment> CipherManager<E> {
    /// Create a manager over a freshly installed ratchet.
    pub fn new(env: E, ratchet: Box<dyn KeyRatchet>) -> Self {
        let ratchet_creation = env.now();
        Self {
            env,
            ratchet,
            ratchet_creation,
            ratchet_expiry: None,
            oldest_generation: 0,
            newest_generation: 0,
            ciphers: BTreeMap::new(),
            newest_processed_nonce: None,
            missing_nonces: VecDeque::new(),
        }
    }

    /// Extend a truncated wire generation using this manager's anchor.
    pub fn compute_wrapped_generation(&self, generation: KeyGeneration) -> KeyGeneration {
        compute_wrapped_generation(self.oldest_generation, generation)
    }

    /// Replay check: true if this nonce is new or known-missing.
    ///
    /// The first nonce ever seen is always processable. After that, a
    /// nonce must be strictly newer than the newest processed one, or
    /// still sitting in the missing window.
    pub fn can_process_nonce(&self, generation: KeyGeneration, nonce: u32) -> bool {
        let Some(newest) = self.newest_processed_nonce else {
            return true;
        };
        let big_nonce = compute_wrapped_big_nonce(generation, nonce);
        big_nonce > newest || self.missing_nonces.iter().rev().any(|&missing| missing == big_nonce)
    }

    /// Get (materializing if needed) the cipher for a generation.
    ///
    /// Three gates run first: the generation must not predate the oldest
    /// tracked one, must not exceed the newest by more than
    /// [`MAX_GENERATION_GAP`], and must not exceed what the ratchet could
    /// have produced at [`MAX_FRAMES_PER_SECOND`] over its lifetime.
    pub fn get_cipher(
        &mut self,
        generation: KeyGeneration,
    ) -> Result<&FrameCipher, MediaCryptoError> {
        self.cleanup_expired_ciphers();

        if generation < self.oldest_generation {
            debug!(generation, oldest = self.oldest_generation, "frame with old generation");
            return Err(MediaCryptoError::GenerationTooOld {
                generation,
                oldest: self.oldest_generation,
            });
        }

        if generation > self.newest_generation.saturating_add(MAX_GENERATION_GAP) {
            debug!(generation, newest = self.newest_generation, "frame with future generation");
            return Err(MediaCryptoError::GenerationTooFarFuture {
                generation,
                newest: self.newest_generation,
            });
        }

        let lifetime = self.env.now() - self.ratchet_creation;
        let max_lifetime_frames = MAX_FRAMES_PER_SECOND * lifetime.as_secs();
        let max_lifetime_generations =
            (max_lifetime_frames >> RATCHET_GENERATION_SHIFT_BITS) as u32;
        if generation > max_lifetime_generations {
            debug!(
                generation,
                bound = max_lifetime_generations,
                lifetime_secs = lifetime.as_secs(),
                "frame generation beyond ratchet lifetime"
            );
            return Err(MediaCryptoError::GenerationBeyondRatchetLifetime {
                generation,
                bound: max_lifetime_generations,
            });
        }

        if !self.ciphers.contains_key(&generation) {
            let entry = self.make_expiring_cipher(generation)?;
            self.ciphers.insert(generation, entry);
        }

        let Some(entry) = self.ciphers.get(&generation) else {
            unreachable!("cipher inserted above");
        };
        Ok(&entry.cipher)
    }

    /// Record a successful decrypt under (generation, nonce).
    ///
    /// Advances the replay window and, when a new generation proves
    /// itself, clamps every older cipher's expiry and deletes superseded
    /// ratchet keys.
    pub fn report_cipher_success(&mut self, generation: KeyGeneration, nonce: u32) {
        let big_nonce = compute_wrapped_big_nonce(generation, nonce);

        match self.newest_processed_nonce {
            None => {
                self.newest_processed_nonce = Some(big_nonce);
            },
            Some(newest) if big_nonce > newest => {
                let oldest_missing =
                    big_nonce.saturating_sub(MAX_MISSING_NONCES as u64);

                while matches!(self.missing_nonces.front(), Some(&front) if front < oldest_missing)
                {
                    self.missing_nonces.pop_front();
                }

                // Don't enumerate an arbitrarily large gap; only the
                // window that could still arrive.
                let missing_range_start = oldest_missing.max(newest + 1);
                for missing in missing_range_start..big_nonce {
                    if self.missing_nonces.len() == MAX_MISSING_NONCES {
                        self.missing_nonces.pop_front();
                    }
                    self.missing_nonces.push_back(missing);
                }

                self.newest_processed_nonce = Some(big_nonce);
            },
            Some(_) => {
                if let Some(position) =
                    self.missing_nonces.iter().position(|&missing| missing == big_nonce)
                {
                    self.missing_nonces.remove(position);
                }
            },
        }

        if generation <= self.newest_generation || !self.ciphers.contains_key(&generation) {
            return;
        }
        debug!(generation, "cipher success advanced newest generation");
        self.newest_generation = generation;

        let expiry = self.env.now() + CIPHER_EXPIRY;
        for (&cipher_generation, entry) in &mut self.ciphers {
            if cipher_generation < generation {
                entry.expiry = Some(match entry.expiry {
                    Some(current) => current.min(expiry),
                    None => expiry,
                });
            }
        }
    }

    /// Clamp this manager's own expiry to `deadline`.
    pub fn update_expiry(&mut self, deadline: E::Instant) {
        self.ratchet_expiry = Some(match self.ratchet_expiry {
            Some(current) => current.min(deadline),
            None => deadline,
        });
    }

    /// Whether the whole manager has expired.
    pub fn is_expired(&self) -> bool {
        matches!(self.ratchet_expiry, Some(expiry) if self.env.now() > expiry)
    }

    /// Oldest generation this manager still serves.
    pub fn oldest_generation(&self) -> KeyGeneration {
        self.oldest_generation
    }

    /// Newest generation that has decrypted successfully.
    pub fn newest_generation(&self) -> KeyGeneration {
        self.newest_generation
    }

    /// Newest processed replay identifier.
    pub fn newest_processed_nonce(&self) -> Option<BigNonce> {
        self.newest_processed_nonce
    }

    /// Number of nonces currently in the missing window.
    pub fn missing_nonce_count(&self) -> usize {
        self.missing_nonces.len()
    }

    fn make_expiring_cipher(
        &mut self,
        generation: KeyGeneration,
    ) -> Result<ExpiringCipher<E::Instant>, MediaCryptoError> {
        let key = self.ratchet.get_key(generation)?;
        // Out-of-order frames may demand a generation we've already moved
        // past; such ciphers are born with a finite expiry.
        let expiry = if generation < self.newest_generation {
            debug!(generation, "creating cipher for old generation");
            Some(self.env.now() + CIPHER_EXPIRY)
        } else {
            debug!(generation, "creating cipher for new generation");
            None
        };
        Ok(ExpiringCipher { cipher: FrameCipher::new(key.key()), expiry })
    }

    fn cleanup_expired_ciphers(&mut self) {
        let now = self.env.now();
        self.ciphers.retain(|generation, entry| {
            let expired = matches!(entry.expiry, Some(expiry) if expiry < now);
            if expired {
                debug!(generation, "removing expired cipher");
            }
            !expired
        });

        while self.oldest_generation < self.newest_generation
            && !self.ciphers.contains_key(&self.oldest_generation)
        {
            debug!(generation = self.oldest_generation, "deleting key for old generation");
            self.ratchet.delete_key(self.oldest_generation);
            self.oldest_generation += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use voxlock_crypto::HmacKeyRatchet;

    use super::*;
    use crate::env::SimEnv;

    fn manager(env: &SimEnv) -> CipherManager<SimEnv> {
        let ratchet = HmacKeyRatchet::new(&[7u8; 32]);
        CipherManager::new(env.clone(), Box::new(ratchet))
    }

    #[test]
    fn wrapped_generation_extends_past_wrap() {
        // Oldest is high in the first window; a low wire generation means
        // we wrapped into the next window.
        let oldest = GENERATION_WRAP - 2;
        assert_eq!(compute_wrapped_generation(oldest, GENERATION_WRAP - 1), GENERATION_WRAP - 1);
        assert_eq!(compute_wrapped_generation(oldest, 3), GENERATION_WRAP + 3);
    }

    #[test]
    fn wrapped_generation_identity_below_wrap() {
        assert_eq!(compute_wrapped_generation(0, 0), 0);
        assert_eq!(compute_wrapped_generation(0, 17), 17);
    }

    #[test]
    fn big_nonce_combines_generation_and_frame_bits() {
        let nonce = compute_wrapped_big_nonce(2, 0x0100_0005);
        assert_eq!(nonce, (2u64 << 24) | 5);
    }

    #[test]
    fn first_nonce_always_processable() {
        let env = SimEnv::default();
        let manager = manager(&env);
        assert!(manager.can_process_nonce(0, 1));
    }

    #[test]
    fn replayed_nonce_rejected() {
        let env = SimEnv::default();
        let mut manager = manager(&env);

        manager.report_cipher_success(0, 5);
        assert!(!manager.can_process_nonce(0, 5));
        assert!(manager.can_process_nonce(0, 6));
    }

    #[test]
    fn missing_nonces_accepted_then_consumed() {
        let env = SimEnv::default();
        let mut manager = manager(&env);

        manager.report_cipher_success(0, 1);
        manager.report_cipher_success(0, 4);

        // 2 and 3 are missing and still processable.
        assert!(manager.can_process_nonce(0, 2));
        assert!(manager.can_process_nonce(0, 3));
        assert_eq!(manager.missing_nonce_count(), 2);

        manager.report_cipher_success(0, 2);
        assert!(!manager.can_process_nonce(0, 2));
        assert_eq!(manager.missing_nonce_count(), 1);
    }

    #[test]
    fn missing_window_is_bounded() {
        let env = SimEnv::default();
        let mut manager = manager(&env);

        manager.report_cipher_success(0, 1);
        manager.report_cipher_success(0, 10_000);

        assert!(manager.missing_nonce_count() <= MAX_MISSING_NONCES);
        // Far outside the window: too late to be useful.
        assert!(!manager.can_process_nonce(0, 2));
        // Just inside the window.
        assert!(manager.can_process_nonce(0, 9_999));
    }

    #[test]
    fn old_generation_rejected_after_advance() {
        let env = SimEnv::default();
        let mut manager = manager(&env);

        assert!(manager.get_cipher(0).is_ok());

        // Age the ratchet enough for generation 1 to be plausible, then
        // advance to it and let generation 0 expire.
        env.advance(Duration::from_secs((1u64 << 24) / MAX_FRAMES_PER_SECOND + 1));
        assert!(manager.get_cipher(1).is_ok());
        manager.report_cipher_success(1, 1 << 24);

        env.advance(CIPHER_EXPIRY + Duration::from_secs(1));
        assert!(matches!(
            manager.get_cipher(0),
            Err(MediaCryptoError::GenerationTooOld { generation: 0, oldest: 1 })
        ));
        assert_eq!(manager.oldest_generation(), 1);
    }

    #[test]
    fn far_future_generation_rejected() {
        let env = SimEnv::default();
        let mut manager = manager(&env);

        assert!(matches!(
            manager.get_cipher(MAX_GENERATION_GAP + 1),
            Err(MediaCryptoError::GenerationTooFarFuture { .. })
        ));
    }

    #[test]
    fn lifetime_gate_rejects_young_ratchet() {
        let env = SimEnv::default();
        let mut manager = manager(&env);

        // A just-created ratchet cannot have produced generation 1 yet.
        assert!(matches!(
            manager.get_cipher(1),
            Err(MediaCryptoError::GenerationBeyondRatchetLifetime { .. })
        ));

        env.advance(Duration::from_secs((1u64 << 24) / MAX_FRAMES_PER_SECOND + 1));
        assert!(manager.get_cipher(1).is_ok());
    }

    #[test]
    fn manager_expiry_clamps_down_only() {
        let env = SimEnv::default();
        let mut manager = manager(&env);

        assert!(!manager.is_expired());

        let deadline = env.now() + Duration::from_secs(5);
        manager.update_expiry(deadline);
        manager.update_expiry(env.now() + Duration::from_secs(60));

        env.advance(Duration::from_secs(6));
        assert!(manager.is_expired());
    }
}
