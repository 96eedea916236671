//! Integration tests for the record transform with a real key facility.

use cipherstore_transform::{
    DecryptFallback, EncryptionConfig, EncryptionUtility, FrameState, KeyedEncryption,
    LocalKeyFacility, RecordTransform, TransformError,
};
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

fn keyed(dir: &TempDir) -> RecordTransform {
    EncryptionConfig::local(dir.path().join("kek.key"), dir.path().join("dek"))
        .build()
        .unwrap()
}

#[test]
fn keyed_roundtrip_hides_plaintext() {
    let dir = TempDir::new().unwrap();
    let transform = keyed(&dir);

    let record = b"a record that is long enough to be compressed, compressed, compressed";
    let framed = transform.protect(record).unwrap();

    assert_eq!(FrameState::of(&framed), FrameState::Encrypted);
    assert!(!framed.windows(8).any(|w| w == b"compress"));
    assert_eq!(transform.unprotect(&framed).unwrap().as_ref(), record);
}

#[test]
fn second_transform_reads_first_transforms_records() {
    let dir = TempDir::new().unwrap();
    let framed = keyed(&dir).protect(b"persisted").unwrap().into_owned();

    // A fresh transform over the same files reuses the stored key.
    let reopened = keyed(&dir);
    assert_eq!(reopened.unprotect(&framed).unwrap().as_ref(), b"persisted");
}

#[test]
fn kek_file_holds_generated_key() {
    let dir = TempDir::new().unwrap();
    let kek_path = dir.path().join("kek.key");
    let facility = Arc::new(LocalKeyFacility::new(dir.path().join("dek")).unwrap());

    let util = KeyedEncryption::open(&kek_path, facility.clone()).unwrap();
    let stored = fs::read(&kek_path).unwrap();
    assert_eq!(stored.len(), cipherstore_transform::KEY_SIZE);
    assert_eq!(util.fingerprint(), cipherstore_transform::key_fingerprint(&stored));
    assert!(facility.dek_path(&stored).exists());
}

#[test]
fn mixed_mode_records_load() {
    let dir = TempDir::new().unwrap();
    let transform = keyed(&dir);

    let legacy = b"written before encryption".to_vec();
    let framed = transform.protect(b"written after").unwrap().into_owned();

    assert_eq!(transform.unprotect(&legacy).unwrap().as_ref(), legacy.as_slice());
    assert_eq!(transform.unprotect(&framed).unwrap().as_ref(), b"written after");
}

#[test]
fn double_transform_guard() {
    let dir = TempDir::new().unwrap();
    let transform = keyed(&dir);

    let mut data = b".e".to_vec();
    data.extend(std::iter::repeat(b'x').take(80));
    assert_eq!(transform.protect(&data).unwrap().as_ref(), data.as_slice());
}

/// Bytes with no repetition for zlib to exploit.
fn noise(len: usize) -> Vec<u8> {
    let mut state: u32 = 0x9e37_79b9;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state.to_le_bytes()[0]
        })
        .collect()
}

#[test]
fn compression_marked_plaintext_roundtrips() {
    let dir = TempDir::new().unwrap();
    let transform = keyed(&dir);

    let mut long = b".z".to_vec();
    long.extend(noise(100));
    let inputs: [&[u8]; 3] = [b".z", b".zabc", &long];

    for input in inputs {
        let framed = transform.protect(input).unwrap();
        assert_eq!(FrameState::of(&framed), FrameState::Encrypted);
        assert_eq!(transform.unprotect(&framed).unwrap().as_ref(), input);
    }
}

#[test]
fn undecryptable_record_falls_back_to_payload() {
    let dir = TempDir::new().unwrap();
    let transform = keyed(&dir);

    // Marked as ciphertext, but not produced by this key.
    let bogus = b".enot really ciphertext at all";
    assert_eq!(
        transform.unprotect(bogus).unwrap().as_ref(),
        b"not really ciphertext at all"
    );
}

#[test]
fn strict_policy_rejects_undecryptable_record() {
    let dir = TempDir::new().unwrap();
    let transform = EncryptionConfig::local(dir.path().join("kek.key"), dir.path().join("dek"))
        .with_decrypt_fallback(DecryptFallback::Strict)
        .build()
        .unwrap();

    let err = transform.unprotect(b".enot really ciphertext").unwrap_err();
    assert!(matches!(err, TransformError::Decryption { .. }));
}

#[test]
fn records_from_another_key_are_not_decrypted() {
    let first = TempDir::new().unwrap();
    let second = TempDir::new().unwrap();

    let framed = keyed(&first).protect(b"for the first key").unwrap().into_owned();
    let other = keyed(&second).unprotect(&framed).unwrap();

    assert_ne!(other.as_ref(), b"for the first key");
    assert_eq!(other.as_ref(), &framed[2..]);
}

#[test]
fn text_roundtrip_and_garbage() {
    let dir = TempDir::new().unwrap();
    let facility = Arc::new(LocalKeyFacility::new(dir.path().join("dek")).unwrap());
    let util = KeyedEncryption::open(dir.path().join("kek.key"), facility).unwrap();

    let sealed = util.encrypt_text("test").unwrap();
    assert_ne!(sealed, b"test");
    assert_eq!(util.decrypt_text(&sealed).unwrap(), "test");

    let garbage = b"gobbledygook!".to_vec();
    assert_eq!(util.decrypt_text(&garbage).unwrap(), "gobbledygook!");
}

#[test]
fn blob_stream_roundtrip() {
    let dir = TempDir::new().unwrap();
    let transform = keyed(&dir);

    let mut sealed = Vec::new();
    transform
        .protect_stream(&mut &b"Hi\nworld.\n"[..], &mut sealed)
        .unwrap();
    assert!(sealed.starts_with(b".e"));
    assert_ne!(&sealed[2..], b"Hi\nworld.\n");

    let mut plain = Vec::new();
    transform
        .unprotect_stream(&mut &sealed[..], &mut plain)
        .unwrap();
    assert_eq!(plain, b"Hi\nworld.\n");
}

#[test]
fn large_blob_stream_is_one_sealed_message() {
    let dir = TempDir::new().unwrap();
    let transform = keyed(&dir);
    let blob = noise(3 << 20);

    let mut sealed = Vec::new();
    transform.protect_stream(&mut &blob[..], &mut sealed).unwrap();
    // Marker, one nonce and one tag around the whole blob.
    assert_eq!(
        sealed.len(),
        2 + cipherstore_transform::NONCE_SIZE + blob.len() + cipherstore_transform::TAG_SIZE
    );

    let mut plain = Vec::new();
    transform.unprotect_stream(&mut &sealed[..], &mut plain).unwrap();
    assert_eq!(plain, blob);
}

#[test]
fn unmarked_and_undecryptable_streams_are_copied() {
    let dir = TempDir::new().unwrap();
    let transform = keyed(&dir);

    let mut out = Vec::new();
    transform
        .unprotect_stream(&mut &b"plain blob"[..], &mut out)
        .unwrap();
    assert_eq!(out, b"plain blob");

    out.clear();
    transform
        .unprotect_stream(&mut &b".ebroken blob"[..], &mut out)
        .unwrap();
    assert_eq!(out, b"broken blob");
}

#[test]
fn disabled_config_uses_identity_encryption() {
    let transform = EncryptionConfig::new().build().unwrap();
    assert!(transform.utility().is_trivial());
    assert_eq!(transform.protect(b"abc").unwrap().as_ref(), b".eabc");
}
