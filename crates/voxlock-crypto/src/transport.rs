//! Transport-layer AEAD: `aead_xchacha20_poly1305_rtpsize`.
//!
//! Every UDP packet is sealed under the 32-byte session transport key. The
//! wire carries only a 4-byte packet counter at the packet tail; the
//! 24-byte XChaCha20 nonce is that counter, big-endian, followed by twenty
//! zero bytes. The RTP header (through the extension header) is the
//! additional data.

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};
use zeroize::Zeroize;

use crate::errors::CryptoError;

/// Transport key size.
pub const TRANSPORT_KEY_BYTES: usize = 32;

/// Full XChaCha20 nonce size.
pub const TRANSPORT_NONCE_BYTES: usize = 24;

/// Poly1305 tag appended to the ciphertext.
pub const TRANSPORT_TAG_BYTES: usize = 16;

/// AEAD bound to one session transport key.
pub struct TransportCipher {
    key: [u8; TRANSPORT_KEY_BYTES],
}

impl TransportCipher {
    /// Bind a cipher to the session secret from `SESSION_DESCRIPTION`.
    pub fn new(key: &[u8; TRANSPORT_KEY_BYTES]) -> Self {
        Self { key: *key }
    }

    /// Seal `plaintext`, authenticating `rtp_header`. Returns ciphertext
    /// with the 16-byte tag appended.
    pub fn seal(
        &self,
        packet_nonce: u32,
        rtp_header: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = XChaCha20Poly1305::new((&self.key).into());
        let nonce = build_nonce(packet_nonce);
        cipher
            .encrypt(XNonce::from_slice(&nonce), Payload { msg: plaintext, aad: rtp_header })
            .map_err(|_| CryptoError::AuthenticationFailed)
    }

    /// Open a sealed payload, verifying `rtp_header`.
    pub fn open(
        &self,
        packet_nonce: u32,
        rtp_header: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = XChaCha20Poly1305::new((&self.key).into());
        let nonce = build_nonce(packet_nonce);
        cipher
            .decrypt(XNonce::from_slice(&nonce), Payload { msg: ciphertext, aad: rtp_header })
            .map_err(|_| CryptoError::AuthenticationFailed)
    }
}

impl Drop for TransportCipher {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Place the big-endian wire counter at the head of a zero-filled nonce.
fn build_nonce(packet_nonce: u32) -> [u8; TRANSPORT_NONCE_BYTES] {
    let mut nonce = [0u8; TRANSPORT_NONCE_BYTES];
    nonce[..4].copy_from_slice(&packet_nonce.to_be_bytes());
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> [u8; TRANSPORT_KEY_BYTES] {
        let mut key = [0u8; TRANSPORT_KEY_BYTES];
        for (i, byte) in key.iter_mut().enumerate() {
            *byte = (i * 3) as u8;
        }
        key
    }

    #[test]
    fn seal_open_roundtrip() {
        let cipher = TransportCipher::new(&test_key());
        let header = [0x80u8, 0x78, 0, 1, 0, 0, 0, 2, 0, 0, 0, 3];

        let sealed = cipher.seal(1, &header, b"opus frame").unwrap();
        assert_eq!(sealed.len(), b"opus frame".len() + TRANSPORT_TAG_BYTES);

        let opened = cipher.open(1, &header, &sealed).unwrap();
        assert_eq!(opened, b"opus frame");
    }

    #[test]
    fn wrong_nonce_fails() {
        let cipher = TransportCipher::new(&test_key());
        let sealed = cipher.seal(1, &[], b"payload").unwrap();
        assert!(cipher.open(2, &[], &sealed).is_err());
    }

    #[test]
    fn tampered_header_fails() {
        let cipher = TransportCipher::new(&test_key());
        let sealed = cipher.seal(5, &[1, 2, 3], b"payload").unwrap();
        assert!(cipher.open(5, &[1, 2, 4], &sealed).is_err());
    }

    #[test]
    fn nonce_layout() {
        let nonce = build_nonce(0x0102_0304);
        assert_eq!(&nonce[..4], &[0x01, 0x02, 0x03, 0x04]);
        assert!(nonce[4..].iter().all(|&b| b == 0));
    }
}
