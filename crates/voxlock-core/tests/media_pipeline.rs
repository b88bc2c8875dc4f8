//! End-to-end tests for the encrypt/decrypt pipeline.
//!
//! Drives the outbound encryptor and inbound decryptor against each other
//! with a shared ratchet seed, the way a sender and receiver derive the
//! same per-member ratchet from the MLS session.

use std::time::Duration;

use voxlock_core::{
    Decryptor, Encryptor, MediaType,
    env::SimEnv,
    manager::DEFAULT_TRANSITION_EXPIRY,
};
use voxlock_crypto::HmacKeyRatchet;
use voxlock_proto::{FRAME_TAG_BYTES, MAGIC_MARKER};

fn ratchet(seed: u8) -> Box<HmacKeyRatchet> {
    Box::new(HmacKeyRatchet::new(&[seed; 32]))
}

fn pipeline(env: &SimEnv, seed: u8) -> (Encryptor<SimEnv>, Decryptor<SimEnv>) {
    let encryptor = Encryptor::new(env.clone());
    encryptor.set_key_ratchet(ratchet(seed));

    let decryptor = Decryptor::new(env.clone());
    decryptor.transition_to_key_ratchet(ratchet(seed), DEFAULT_TRANSITION_EXPIRY);

    (encryptor, decryptor)
}

fn encrypt(encryptor: &Encryptor<SimEnv>, frame: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; Encryptor::<SimEnv>::max_ciphertext_size(frame.len())];
    let written = encryptor.encrypt(MediaType::Audio, 1, frame, &mut out).unwrap();
    out.truncate(written);
    out
}

#[test]
fn encrypt_decrypt_symmetry() {
    let env = SimEnv::default();
    let (encryptor, decryptor) = pipeline(&env, 0);
    let frame = [0x01, 0x02, 0x03, 0x04];

    let wire = encrypt(&encryptor, &frame);

    // Trailer shape: magic marker last, supplemental size before it,
    // first truncated nonce is 1 (a single LEB128 byte after the tag).
    assert_eq!(&wire[wire.len() - 2..], &MAGIC_MARKER.to_be_bytes());
    let supplemental = wire[wire.len() - 3] as usize;
    assert_eq!(wire.len(), frame.len() + FRAME_TAG_BYTES + supplemental);
    assert_eq!(wire[frame.len() + FRAME_TAG_BYTES], 1);

    let mut out = vec![0u8; wire.len()];
    let written = decryptor.decrypt(MediaType::Audio, &wire, &mut out);
    assert_eq!(&out[..written], &frame);
}

#[test]
fn replayed_frame_rejected() {
    let env = SimEnv::default();
    let (encryptor, decryptor) = pipeline(&env, 1);

    let wire = encrypt(&encryptor, &[0x01, 0x02, 0x03, 0x04]);
    let mut out = vec![0u8; wire.len()];

    assert!(decryptor.decrypt(MediaType::Audio, &wire, &mut out) > 0);

    // Same wire bytes again: replay.
    let failures_before = decryptor.stats(MediaType::Audio).decrypt_failure_count;
    assert_eq!(decryptor.decrypt(MediaType::Audio, &wire, &mut out), 0);
    assert_eq!(decryptor.stats(MediaType::Audio).decrypt_failure_count, failures_before + 1);
}

#[test]
fn out_of_order_frames_all_decrypt() {
    let env = SimEnv::default();
    let (encryptor, decryptor) = pipeline(&env, 2);

    let first = encrypt(&encryptor, b"frame one");
    let second = encrypt(&encryptor, b"frame two");
    let third = encrypt(&encryptor, b"frame three");

    let mut out = vec![0u8; 64];
    // Deliver 3, 1, 2.
    let written = decryptor.decrypt(MediaType::Audio, &third, &mut out);
    assert_eq!(&out[..written], b"frame three");
    let written = decryptor.decrypt(MediaType::Audio, &first, &mut out);
    assert_eq!(&out[..written], b"frame one");
    let written = decryptor.decrypt(MediaType::Audio, &second, &mut out);
    assert_eq!(&out[..written], b"frame two");

    assert_eq!(decryptor.stats(MediaType::Audio).decrypt_success_count, 3);
    assert_eq!(decryptor.stats(MediaType::Audio).decrypt_failure_count, 0);
}

#[test]
fn tampered_frame_rejected() {
    let env = SimEnv::default();
    let (encryptor, decryptor) = pipeline(&env, 3);

    let mut wire = encrypt(&encryptor, &[9u8; 16]);
    wire[0] ^= 0x01;

    let mut out = vec![0u8; wire.len()];
    assert_eq!(decryptor.decrypt(MediaType::Audio, &wire, &mut out), 0);
}

#[test]
fn wrong_ratchet_rejects_frame() {
    let env = SimEnv::default();
    let (encryptor, _) = pipeline(&env, 4);
    let decryptor = Decryptor::new(env.clone());
    decryptor.transition_to_key_ratchet(ratchet(5), DEFAULT_TRANSITION_EXPIRY);

    let wire = encrypt(&encryptor, &[1, 2, 3]);
    let mut out = vec![0u8; wire.len()];
    assert_eq!(decryptor.decrypt(MediaType::Audio, &wire, &mut out), 0);
}

#[test]
fn ratchet_transition_expires_old_managers() {
    let env = SimEnv::default();
    let (encryptor, decryptor) = pipeline(&env, 6);

    let old_wire = encrypt(&encryptor, b"under old key");
    let mut out = vec![0u8; 64];
    assert!(decryptor.decrypt(MediaType::Audio, &old_wire, &mut out) > 0);

    // Transition both sides to a new ratchet with a 1 second grace.
    encryptor.set_key_ratchet(ratchet(7));
    decryptor.transition_to_key_ratchet(ratchet(7), Duration::from_secs(1));

    // Old-key traffic still decrypts inside the grace window. Re-encrypt
    // under the old seed via a fresh encryptor at the same nonce state.
    let stale_encryptor = Encryptor::new(env.clone());
    stale_encryptor.set_key_ratchet(ratchet(6));
    let stale1 = encrypt(&stale_encryptor, b"stale but fresh nonce");
    // Skip the nonce already consumed by old_wire.
    let stale2 = encrypt(&stale_encryptor, b"stale two");
    let _ = stale1;
    assert!(decryptor.decrypt(MediaType::Audio, &stale2, &mut out) > 0);

    // After the grace lapses, the old manager is dropped on the next
    // decrypt and old-key traffic fails.
    env.advance(Duration::from_secs(2));
    let stale3 = encrypt(&stale_encryptor, b"stale three");
    assert_eq!(decryptor.decrypt(MediaType::Audio, &stale3, &mut out), 0);

    // New-key traffic flows.
    let fresh = encrypt(&encryptor, b"under new key");
    let written = decryptor.decrypt(MediaType::Audio, &fresh, &mut out);
    assert_eq!(&out[..written], b"under new key");
}

#[test]
fn decryptor_prefers_newest_ratchet() {
    let env = SimEnv::default();
    let decryptor = Decryptor::new(env.clone());
    decryptor.transition_to_key_ratchet(ratchet(8), DEFAULT_TRANSITION_EXPIRY);
    decryptor.transition_to_key_ratchet(ratchet(9), DEFAULT_TRANSITION_EXPIRY);

    // Traffic under both keys decrypts while both managers are alive.
    let old_encryptor = Encryptor::new(env.clone());
    old_encryptor.set_key_ratchet(ratchet(8));
    let new_encryptor = Encryptor::new(env.clone());
    new_encryptor.set_key_ratchet(ratchet(9));

    let mut out = vec![0u8; 64];
    let old_wire = encrypt(&old_encryptor, b"old");
    let new_wire = encrypt(&new_encryptor, b"new");

    let written = decryptor.decrypt(MediaType::Audio, &new_wire, &mut out);
    assert_eq!(&out[..written], b"new");
    let written = decryptor.decrypt(MediaType::Audio, &old_wire, &mut out);
    assert_eq!(&out[..written], b"old");
}

#[test]
fn larger_frames_roundtrip() {
    let env = SimEnv::default();
    let (encryptor, decryptor) = pipeline(&env, 10);

    let frame: Vec<u8> = (0..960).map(|i| (i % 251) as u8).collect();
    let wire = encrypt(&encryptor, &frame);

    let mut out = vec![0u8; wire.len()];
    let written = decryptor.decrypt(MediaType::Audio, &wire, &mut out);
    assert_eq!(&out[..written], frame.as_slice());
}
