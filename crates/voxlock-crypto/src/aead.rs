//! Per-frame AEAD: AES-128-GCM with a truncated tag.
//!
//! Media frames carry an 8-byte tag rather than GCM's full 16 bytes to
//! keep per-packet overhead down. OpenSSL's EVP interface supports
//! truncated GCM tags natively, so encryption produces the short tag
//! directly and decryption verifies against it.
//!
//! The full 12-byte nonce is never transmitted: the wire carries a 4-byte
//! truncated counter which both sides embed at a fixed offset in a
//! zero-filled nonce buffer.

use openssl::symm::{Cipher, decrypt_aead, encrypt_aead};
use zeroize::Zeroize;

/// AES-128 key size.
pub const AES_GCM_KEY_BYTES: usize = 16;

/// GCM nonce size.
pub const AES_GCM_NONCE_BYTES: usize = 12;

/// Truncated tag carried on the wire.
pub const TRUNCATED_TAG_BYTES: usize = 8;

/// Size of the truncated nonce counter carried on the wire.
pub const TRUNCATED_SYNC_NONCE_BYTES: usize = 4;

/// Offset of the truncated counter within the 12-byte nonce.
pub const TRUNCATED_SYNC_NONCE_OFFSET: usize = 4;

/// AEAD cipher bound to one AES-128 frame key.
///
/// Stateless with respect to nonces: callers guarantee nonce uniqueness
/// per key. Failure is reported as `false` with no partial output
/// observable in the destination buffers.
pub struct FrameCipher {
    key: [u8; AES_GCM_KEY_BYTES],
}

impl FrameCipher {
    /// Bind a cipher to a frame key.
    pub fn new(key: &[u8; AES_GCM_KEY_BYTES]) -> Self {
        Self { key: *key }
    }

    /// Encrypt `plaintext` into `ciphertext_out`, writing the truncated tag
    /// into `tag_out`. `additional_data` is authenticated but not
    /// encrypted. Returns `false` on failure.
    pub fn encrypt(
        &self,
        ciphertext_out: &mut [u8],
        plaintext: &[u8],
        nonce: &[u8; AES_GCM_NONCE_BYTES],
        additional_data: &[u8],
        tag_out: &mut [u8; TRUNCATED_TAG_BYTES],
    ) -> bool {
        if ciphertext_out.len() < plaintext.len() {
            return false;
        }
        match encrypt_aead(
            Cipher::aes_128_gcm(),
            &self.key,
            Some(nonce),
            additional_data,
            plaintext,
            tag_out,
        ) {
            Ok(ciphertext) => {
                ciphertext_out[..ciphertext.len()].copy_from_slice(&ciphertext);
                true
            },
            Err(_) => false,
        }
    }

    /// Decrypt `ciphertext` into `plaintext_out`, verifying the truncated
    /// tag over the ciphertext and `additional_data`. Returns `false` on
    /// authentication failure; `plaintext_out` holds nothing usable in that
    /// case.
    pub fn decrypt(
        &self,
        plaintext_out: &mut [u8],
        ciphertext: &[u8],
        tag: &[u8; TRUNCATED_TAG_BYTES],
        nonce: &[u8; AES_GCM_NONCE_BYTES],
        additional_data: &[u8],
    ) -> bool {
        if plaintext_out.len() < ciphertext.len() {
            return false;
        }
        match decrypt_aead(
            Cipher::aes_128_gcm(),
            &self.key,
            Some(nonce),
            additional_data,
            ciphertext,
            tag,
        ) {
            Ok(plaintext) => {
                plaintext_out[..plaintext.len()].copy_from_slice(&plaintext);
                true
            },
            Err(_) => false,
        }
    }
}

impl Drop for FrameCipher {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Build the full 12-byte nonce from the 4-byte wire counter.
///
/// The counter is embedded little-endian at
/// [`TRUNCATED_SYNC_NONCE_OFFSET`]; the rest of the nonce is zero.
pub fn expand_truncated_nonce(truncated: u32) -> [u8; AES_GCM_NONCE_BYTES] {
    let mut nonce = [0u8; AES_GCM_NONCE_BYTES];
    nonce[TRUNCATED_SYNC_NONCE_OFFSET..TRUNCATED_SYNC_NONCE_OFFSET + TRUNCATED_SYNC_NONCE_BYTES]
        .copy_from_slice(&truncated.to_le_bytes());
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> [u8; AES_GCM_KEY_BYTES] {
        let mut key = [0u8; AES_GCM_KEY_BYTES];
        for (i, byte) in key.iter_mut().enumerate() {
            *byte = i as u8;
        }
        key
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let cipher = FrameCipher::new(&test_key());
        let nonce = expand_truncated_nonce(1);
        let plaintext = [0x01, 0x02, 0x03, 0x04];
        let aad = [0xAA, 0xBB];

        let mut ciphertext = [0u8; 4];
        let mut tag = [0u8; TRUNCATED_TAG_BYTES];
        assert!(cipher.encrypt(&mut ciphertext, &plaintext, &nonce, &aad, &mut tag));
        assert_ne!(ciphertext, plaintext);

        let mut recovered = [0u8; 4];
        assert!(cipher.decrypt(&mut recovered, &ciphertext, &tag, &nonce, &aad));
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn empty_plaintext_still_authenticates() {
        let cipher = FrameCipher::new(&test_key());
        let nonce = expand_truncated_nonce(9);

        let mut ciphertext = [0u8; 0];
        let mut tag = [0u8; TRUNCATED_TAG_BYTES];
        assert!(cipher.encrypt(&mut ciphertext, &[], &nonce, b"header", &mut tag));

        let mut plaintext = [0u8; 0];
        assert!(cipher.decrypt(&mut plaintext, &[], &tag, &nonce, b"header"));
        assert!(!cipher.decrypt(&mut plaintext, &[], &tag, &nonce, b"tampered"));
    }

    #[test]
    fn wrong_tag_fails() {
        let cipher = FrameCipher::new(&test_key());
        let nonce = expand_truncated_nonce(2);

        let mut ciphertext = [0u8; 3];
        let mut tag = [0u8; TRUNCATED_TAG_BYTES];
        assert!(cipher.encrypt(&mut ciphertext, &[1, 2, 3], &nonce, &[], &mut tag));

        tag[0] ^= 0xFF;
        let mut plaintext = [0u8; 3];
        assert!(!cipher.decrypt(&mut plaintext, &ciphertext, &tag, &nonce, &[]));
    }

    #[test]
    fn tampered_aad_fails() {
        let cipher = FrameCipher::new(&test_key());
        let nonce = expand_truncated_nonce(3);

        let mut ciphertext = [0u8; 2];
        let mut tag = [0u8; TRUNCATED_TAG_BYTES];
        assert!(cipher.encrypt(&mut ciphertext, &[7, 8], &nonce, &[1], &mut tag));

        let mut plaintext = [0u8; 2];
        assert!(!cipher.decrypt(&mut plaintext, &ciphertext, &tag, &nonce, &[2]));
    }

    #[test]
    fn different_nonces_differ() {
        let cipher = FrameCipher::new(&test_key());
        let plaintext = [5u8; 8];

        let mut first = [0u8; 8];
        let mut second = [0u8; 8];
        let mut tag = [0u8; TRUNCATED_TAG_BYTES];
        assert!(cipher.encrypt(&mut first, &plaintext, &expand_truncated_nonce(1), &[], &mut tag));
        assert!(cipher.encrypt(&mut second, &plaintext, &expand_truncated_nonce(2), &[], &mut tag));
        assert_ne!(first, second);
    }

    #[test]
    fn nonce_expansion_layout() {
        let nonce = expand_truncated_nonce(0x0403_0201);
        assert_eq!(nonce, [0, 0, 0, 0, 0x01, 0x02, 0x03, 0x04, 0, 0, 0, 0]);
    }
}
