//! One-way key ratchet for frame keys.
//!
//! A ratchet is a one-way function from a generation index to a symmetric
//! key. Generations are materialized lazily and cached so out-of-order
//! frames within the replay window can still be decrypted; deleting a
//! generation permanently forecloses it and everything before it.
//!
//! # Security Properties
//!
//! - Forward Secrecy: chain keys are overwritten as the ratchet advances
//! - Key Uniqueness: each generation produces a distinct frame key
//! - Determinism: the same seed always produces the same key sequence

use std::collections::HashMap;

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::{aead::AES_GCM_KEY_BYTES, errors::CryptoError};

type HmacSha256 = Hmac<Sha256>;

/// Label for deriving the next chain key.
const CHAIN_LABEL: &[u8] = b"chain";

/// Label for deriving a generation's frame key.
const FRAME_LABEL: &[u8] = b"frame";

/// Label for deriving per-member ratchet seeds from the group base secret.
const RATCHET_SEED_LABEL: &[u8] = b"voxlockMediaKeyV1";

/// Index into a key ratchet. Advances monotonically per sender.
pub type KeyGeneration = u32;

/// A symmetric frame key for one ratchet generation.
#[derive(Clone)]
pub struct FrameKey {
    key: [u8; AES_GCM_KEY_BYTES],
    generation: KeyGeneration,
}

impl FrameKey {
    /// The 16-byte AES-128 key.
    pub fn key(&self) -> &[u8; AES_GCM_KEY_BYTES] {
        &self.key
    }

    /// Ratchet generation this key belongs to.
    pub fn generation(&self) -> KeyGeneration {
        self.generation
    }
}

impl Drop for FrameKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// One-way function from generation to frame key.
///
/// # Invariants
///
/// - `get_key` for the same generation returns the same key until deleted
/// - After `delete_key(g)`, no key for any generation `<= g` can be
///   produced again
pub trait KeyRatchet: Send {
    /// Materialize (or return the cached) key for `generation`.
    fn get_key(&mut self, generation: KeyGeneration) -> Result<FrameKey, CryptoError>;

    /// Permanently delete `generation` and foreclose everything before it.
    fn delete_key(&mut self, generation: KeyGeneration);
}

/// HMAC-SHA256 chain ratchet.
///
/// The seed is the generation-0 chain key. Each advance derives the
/// generation's frame key and the next chain key, then overwrites the old
/// chain key. Materialized keys stay cached until deleted so the decryptor
/// can serve out-of-order generations inside its replay window.
pub struct HmacKeyRatchet {
    chain_key: [u8; 32],
    next_generation: KeyGeneration,
    /// Oldest generation this ratchet will still produce.
    floor: KeyGeneration,
    cached: HashMap<KeyGeneration, [u8; AES_GCM_KEY_BYTES]>,
}

impl HmacKeyRatchet {
    /// Create a ratchet from a 32-byte seed.
    pub fn new(seed: &[u8; 32]) -> Self {
        Self { chain_key: *seed, next_generation: 0, floor: 0, cached: HashMap::new() }
    }

    /// Oldest generation still producible.
    pub fn floor(&self) -> KeyGeneration {
        self.floor
    }

    fn derive_frame_key(&self) -> [u8; AES_GCM_KEY_BYTES] {
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.chain_key) else {
            unreachable!("HMAC-SHA256 accepts any key size");
        };
        mac.update(FRAME_LABEL);
        let digest = mac.finalize().into_bytes();

        let mut key = [0u8; AES_GCM_KEY_BYTES];
        key.copy_from_slice(&digest[..AES_GCM_KEY_BYTES]);
        key
    }

    fn derive_next_chain_key(&self) -> [u8; 32] {
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.chain_key) else {
            unreachable!("HMAC-SHA256 accepts any key size");
        };
        mac.update(CHAIN_LABEL);
        let digest = mac.finalize().into_bytes();

        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        key
    }

    fn advance(&mut self) -> Result<(), CryptoError> {
        if self.next_generation == KeyGeneration::MAX {
            return Err(CryptoError::GenerationOverflow { current: self.next_generation });
        }

        let frame_key = self.derive_frame_key();
        let mut next_chain = self.derive_next_chain_key();

        self.cached.insert(self.next_generation, frame_key);
        self.chain_key.zeroize();
        self.chain_key = next_chain;
        next_chain.zeroize();
        self.next_generation += 1;
        Ok(())
    }
}

impl KeyRatchet for HmacKeyRatchet {
    fn get_key(&mut self, generation: KeyGeneration) -> Result<FrameKey, CryptoError> {
        if generation < self.floor {
            return Err(CryptoError::GenerationDeleted {
                requested: generation,
                floor: self.floor,
            });
        }

        if let Some(key) = self.cached.get(&generation) {
            return Ok(FrameKey { key: *key, generation });
        }
        if generation < self.next_generation {
            // Materialized once and deleted since.
            return Err(CryptoError::GenerationDeleted {
                requested: generation,
                floor: self.floor,
            });
        }

        while self.next_generation <= generation {
            self.advance()?;
        }

        let Some(key) = self.cached.get(&generation).copied() else {
            unreachable!("advance() caches every generation it passes");
        };
        Ok(FrameKey { key, generation })
    }

    fn delete_key(&mut self, generation: KeyGeneration) {
        if let Some(mut key) = self.cached.remove(&generation) {
            key.zeroize();
        }
        self.cached.retain(|&cached_generation, _| cached_generation > generation);
        self.floor = self.floor.max(generation.saturating_add(1));
    }
}

impl Drop for HmacKeyRatchet {
    fn drop(&mut self) {
        self.chain_key.zeroize();
        for (_, key) in self.cached.iter_mut() {
            key.zeroize();
        }
    }
}

/// Derive a member's ratchet seed from the group base secret.
///
/// Different members produce unrelated seeds; the same (secret, member)
/// pair always produces the same seed.
pub fn derive_ratchet_seed(base_secret: &[u8], user_id: &str) -> [u8; 32] {
    let hkdf = Hkdf::<Sha256>::new(None, base_secret);

    let mut info = Vec::with_capacity(RATCHET_SEED_LABEL.len() + user_id.len());
    info.extend_from_slice(RATCHET_SEED_LABEL);
    info.extend_from_slice(user_id.as_bytes());

    let mut seed = [0u8; 32];
    let Ok(()) = hkdf.expand(&info, &mut seed) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };

    seed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_seed() -> [u8; 32] {
        let mut seed = [0u8; 32];
        for (i, byte) in seed.iter_mut().enumerate() {
            *byte = i as u8;
        }
        seed
    }

    #[test]
    fn keys_are_deterministic() {
        let mut first = HmacKeyRatchet::new(&test_seed());
        let mut second = HmacKeyRatchet::new(&test_seed());

        for generation in 0..10 {
            let a = first.get_key(generation).unwrap();
            let b = second.get_key(generation).unwrap();
            assert_eq!(a.key(), b.key());
            assert_eq!(a.generation(), generation);
        }
    }

    #[test]
    fn keys_are_unique_per_generation() {
        let mut ratchet = HmacKeyRatchet::new(&test_seed());
        let key0 = ratchet.get_key(0).unwrap();
        let key1 = ratchet.get_key(1).unwrap();
        let key2 = ratchet.get_key(2).unwrap();

        assert_ne!(key0.key(), key1.key());
        assert_ne!(key1.key(), key2.key());
        assert_ne!(key0.key(), key2.key());
    }

    #[test]
    fn skipping_ahead_matches_sequential() {
        let mut sequential = HmacKeyRatchet::new(&test_seed());
        for generation in 0..5 {
            sequential.get_key(generation).unwrap();
        }
        let expected = sequential.get_key(5).unwrap();

        let mut skipping = HmacKeyRatchet::new(&test_seed());
        let skipped = skipping.get_key(5).unwrap();

        assert_eq!(expected.key(), skipped.key());
    }

    #[test]
    fn cached_generation_survives_advance() {
        let mut ratchet = HmacKeyRatchet::new(&test_seed());
        let early = ratchet.get_key(1).unwrap();
        ratchet.get_key(10).unwrap();

        // Generation 1 was materialized, not deleted; still retrievable.
        let again = ratchet.get_key(1).unwrap();
        assert_eq!(early.key(), again.key());
    }

    #[test]
    fn deleted_generation_is_gone_forever() {
        let mut ratchet = HmacKeyRatchet::new(&test_seed());
        ratchet.get_key(3).unwrap();
        ratchet.delete_key(3);

        assert!(matches!(
            ratchet.get_key(3),
            Err(CryptoError::GenerationDeleted { requested: 3, floor: 4 })
        ));
        assert!(ratchet.get_key(2).is_err());
        assert!(ratchet.get_key(0).is_err());
        assert!(ratchet.get_key(4).is_ok());
    }

    #[test]
    fn different_seeds_produce_different_keys() {
        let mut seed2 = test_seed();
        seed2[0] ^= 0xFF;

        let mut first = HmacKeyRatchet::new(&test_seed());
        let mut second = HmacKeyRatchet::new(&seed2);

        assert_ne!(first.get_key(0).unwrap().key(), second.get_key(0).unwrap().key());
    }

    #[test]
    fn seed_derivation_separates_members() {
        let secret = b"group base secret material here!";
        let alice = derive_ratchet_seed(secret, "alice");
        let bob = derive_ratchet_seed(secret, "bob");

        assert_ne!(alice, bob);
        assert_eq!(alice, derive_ratchet_seed(secret, "alice"));
    }
}
