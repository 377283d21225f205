//! AES-256-GCM for the exchanged datum.
//!
//! Ciphertext is the GCM output (ciphertext plus tag) hex-encoded, so it
//! can ride inside the `datum` field of a first message.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};

use crate::errors::CryptoError;
use crate::util;

/// Exact AES-256 key length in bytes.
pub const KEY_LEN: usize = 32;

/// Exact GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;

/// Creates a random 12-byte nonce.
pub fn generate_nonce() -> [u8; NONCE_LEN] {
    util::random_array()
}

fn cipher(key: &[u8]) -> Result<Aes256Gcm, CryptoError> {
    if key.len() != KEY_LEN {
        return Err(CryptoError::InvalidLength {
            field: "key",
            expected: KEY_LEN,
            actual: key.len(),
        });
    }
    Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::Aead)
}

fn check_nonce(nonce: &[u8]) -> Result<(), CryptoError> {
    if nonce.len() != NONCE_LEN {
        return Err(CryptoError::InvalidLength {
            field: "nonce",
            expected: NONCE_LEN,
            actual: nonce.len(),
        });
    }
    Ok(())
}

/// Encrypts `plaintext`, returning the hex-encoded ciphertext.
pub fn encrypt(key: &[u8], nonce: &[u8], plaintext: &[u8]) -> Result<String, CryptoError> {
    check_nonce(nonce)?;
    let ciphertext =
        cipher(key)?.encrypt(Nonce::from_slice(nonce), plaintext).map_err(|_| CryptoError::Aead)?;
    Ok(hex::encode(ciphertext))
}

/// Decrypts hex ciphertext produced by [`encrypt`].
pub fn decrypt(key: &[u8], nonce: &[u8], ciphertext_hex: &str) -> Result<Vec<u8>, CryptoError> {
    check_nonce(nonce)?;
    let ciphertext = hex::decode(ciphertext_hex)?;
    cipher(key)?.decrypt(Nonce::from_slice(nonce), ciphertext.as_slice()).map_err(|_| CryptoError::Aead)
}
