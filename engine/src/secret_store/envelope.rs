//! Envelope encryption — spec §4.6 "Secret Store: storage format".
//!
//! A single master key, derived from `MASTER_KEY_MATERIAL` via HKDF, wraps
//! per-secret data keys; each data key in turn encrypts exactly one secret
//! value with ChaCha20-Poly1305. Grounded on `keystore-worker::crypto`'s
//! wrap/unwrap shape, re-targeted from its AES-GCM-over-TDX-sealed-key scheme
//! onto the stack the rest of this crate already depends on.

use crate::error::EngineError;
use crate::types::DataKeyId;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;

/// Derive a 32-byte master key from operator-supplied seed material.
pub fn derive_master_key(material: &str) -> [u8; KEY_LEN] {
    let hk = Hkdf::<Sha256>::new(Some(b"tee-engine/secret-store/master-key/v1"), material.as_bytes());
    let mut out = [0u8; KEY_LEN];
    hk.expand(b"master", &mut out)
        .expect("32 bytes is a valid HKDF output length for SHA-256");
    out
}

/// A single-use symmetric key that encrypts one secret's plaintext.
pub struct DataKey {
    pub id: DataKeyId,
    pub key_bytes: [u8; KEY_LEN],
}

pub fn generate_data_key() -> DataKey {
    let mut key_bytes = [0u8; KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key_bytes);
    DataKey {
        id: DataKeyId(uuid::Uuid::new_v4().to_string()),
        key_bytes,
    }
}

/// Wrap a data key under the master key. Returned bytes are
/// `nonce || ciphertext` and are what gets persisted alongside the secret.
pub fn wrap_data_key(master_key: &[u8; KEY_LEN], data_key: &DataKey) -> Result<Vec<u8>, EngineError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(master_key));
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, data_key.key_bytes.as_slice())
        .map_err(|e| EngineError::CryptoFailure(format!("failed to wrap data key: {e}")))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub fn unwrap_data_key(master_key: &[u8; KEY_LEN], wrapped: &[u8]) -> Result<[u8; KEY_LEN], EngineError> {
    if wrapped.len() < NONCE_LEN {
        return Err(EngineError::CryptoFailure("wrapped data key is truncated".into()));
    }
    let (nonce_bytes, ciphertext) = wrapped.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(master_key));
    let nonce = Nonce::from_slice(nonce_bytes);

    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|e| EngineError::CryptoFailure(format!("failed to unwrap data key: {e}")))?;

    plaintext
        .try_into()
        .map_err(|_| EngineError::CryptoFailure("unwrapped data key has unexpected length".into()))
}

/// Encrypt a secret value under a (freshly unwrapped) data key.
pub fn seal(data_key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<(Vec<u8>, [u8; NONCE_LEN]), EngineError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(data_key));
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| EngineError::CryptoFailure(format!("failed to seal secret: {e}")))?;

    Ok((ciphertext, nonce_bytes))
}

pub fn open(data_key: &[u8; KEY_LEN], ciphertext: &[u8], nonce_bytes: &[u8; NONCE_LEN]) -> Result<Vec<u8>, EngineError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(data_key));
    let nonce = Nonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|e| EngineError::CryptoFailure(format!("failed to open secret: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_key_round_trips_through_wrap_unwrap() {
        let master = derive_master_key("0123456789abcdef0123456789abcdef");
        let dk = generate_data_key();
        let wrapped = wrap_data_key(&master, &dk).unwrap();
        let unwrapped = unwrap_data_key(&master, &wrapped).unwrap();
        assert_eq!(unwrapped, dk.key_bytes);
    }

    #[test]
    fn unwrap_fails_under_wrong_master_key() {
        let master_a = derive_master_key("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
        let master_b = derive_master_key("bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb");
        let dk = generate_data_key();
        let wrapped = wrap_data_key(&master_a, &dk).unwrap();
        assert!(unwrap_data_key(&master_b, &wrapped).is_err());
    }

    #[test]
    fn secret_round_trips_through_seal_open() {
        let dk = generate_data_key();
        let (ciphertext, nonce) = seal(&dk.key_bytes, b"top secret value").unwrap();
        let plaintext = open(&dk.key_bytes, &ciphertext, &nonce).unwrap();
        assert_eq!(plaintext, b"top secret value");
    }

    #[test]
    fn tampered_ciphertext_fails_to_open() {
        let dk = generate_data_key();
        let (mut ciphertext, nonce) = seal(&dk.key_bytes, b"top secret value").unwrap();
        ciphertext[0] ^= 0xff;
        assert!(open(&dk.key_bytes, &ciphertext, &nonce).is_err());
    }
}
