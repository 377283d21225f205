//! The non-repudiation requirement parametrising one listener-side
//! exchange.
//!
//! Created after the first message arrives, destroyed when the exchange
//! ends. It owns the ephemeral signing key, the encryption values for the
//! datum ciphertext, and a FIFO queue of decoy decryption bundles. The
//! decoys and the real bundle have identical shape and are signed by the
//! same key, so an eavesdropper cannot tell which of the `N + 1` signed
//! bundles is the one that actually derives the datum key.

use std::collections::VecDeque;

use base64::alphabet;
use base64::engine::general_purpose::NO_PAD;
use base64::engine::GeneralPurpose;
use base64::Engine;
use tokio::task;

use crate::errors::CryptoError;
use crate::keys::PrivateKey;
use crate::messages::DecryptionData;
use crate::password::{self, PasswordPool};
use crate::{aead, util};

/// Lower bound (inclusive) of the decoy count.
pub const MIN_REPETITIONS: usize = 25;

/// Upper bound (exclusive) of the decoy count.
pub const MAX_REPETITIONS: usize = 126;

// Fixed encryption values for cover traffic. A fake exchange carries a
// random throwaway datum, so there is nothing to protect, and skipping
// the bcrypt derivation keeps fake exchanges cheap. The decryption
// values deliberately do not derive this key.
const FAKE_KEY: &[u8; 32] = b"not.a.derived.key.but.thats.ok..";
const FAKE_NONCE: &[u8; 12] = b"decoy.nonce!";
const FAKE_PLAIN: &[u8; 32] = b"hardcoded.cover.traffic.password";
const FAKE_RAW_SALT: &[u8; 16] = b"hardcoded.salt..";

const BCRYPT_B64: GeneralPurpose = GeneralPurpose::new(&alphabet::BCRYPT, NO_PAD);

/// Ephemeral state for one exchange on the data-owner side.
pub struct NonRepudiationRequirement {
    ephemeral: PrivateKey,
    derived_key: [u8; password::KEY_LEN],
    nonce: [u8; aead::NONCE_LEN],
    real: DecryptionData,
    decoys: VecDeque<DecryptionData>,
    repetitions: usize,
}

impl NonRepudiationRequirement {
    /// Builds the requirement for a real exchange, drawing the derived
    /// password bundle from the pre-computation pool.
    pub async fn generate(pool: &PasswordPool) -> Result<Self, CryptoError> {
        let bundle = pool.pop().await?;
        let nonce = aead::generate_nonce();
        let real = DecryptionData {
            plain_password: bundle.plain.clone(),
            salt: bundle.salt.clone(),
            nonce: nonce.to_vec(),
        };
        Self::assemble(bundle.derived, nonce, real).await
    }

    /// Builds the requirement for a fake exchange: fixed encryption
    /// values, no bcrypt work, everything else generated normally so the
    /// wire traffic keeps the same shape. Must never be used for a real
    /// datum.
    pub async fn fake_chatter() -> Result<Self, CryptoError> {
        let real = DecryptionData {
            plain_password: FAKE_PLAIN.to_vec(),
            salt: BCRYPT_B64.encode(FAKE_RAW_SALT).into_bytes(),
            nonce: FAKE_NONCE.to_vec(),
        };
        Self::assemble(*FAKE_KEY, *FAKE_NONCE, real).await
    }

    async fn assemble(
        derived_key: [u8; password::KEY_LEN],
        nonce: [u8; aead::NONCE_LEN],
        real: DecryptionData,
    ) -> Result<Self, CryptoError> {
        let repetitions = util::random_range(MIN_REPETITIONS, MAX_REPETITIONS);
        let decoys = (0..repetitions).map(|_| generate_decoy()).collect();

        let ephemeral =
            task::spawn_blocking(PrivateKey::generate).await.expect("keygen task panicked")?;

        Ok(NonRepudiationRequirement { ephemeral, derived_key, nonce, real, decoys, repetitions })
    }

    /// Encrypts `message` under the requirement's key and nonce.
    pub fn encrypt(&self, message: &[u8]) -> Result<String, CryptoError> {
        aead::encrypt(&self.derived_key, &self.nonce, message)
    }

    /// Removes and returns the front of the decoy queue.
    pub fn pop_decoy(&mut self) -> Option<DecryptionData> {
        self.decoys.pop_front()
    }

    /// The bundle that actually inverts [`NonRepudiationRequirement::encrypt`].
    pub fn real_decryption(&self) -> DecryptionData {
        self.real.clone()
    }

    /// How many decoys this exchange sends before the real bundle.
    pub fn repetitions(&self) -> usize {
        self.repetitions
    }

    /// The per-exchange signing key.
    pub fn ephemeral(&self) -> &PrivateKey {
        &self.ephemeral
    }
}

impl std::fmt::Debug for NonRepudiationRequirement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonRepudiationRequirement")
            .field("repetitions", &self.repetitions)
            .finish_non_exhaustive()
    }
}

fn generate_decoy() -> DecryptionData {
    DecryptionData {
        plain_password: password::generate_plain_password().to_vec(),
        salt: password::generate_salt(),
        nonce: aead::generate_nonce().to_vec(),
    }
}

/// Derives the key named by `data` and decrypts `ciphertext_hex` with it.
///
/// This is the requester's and the verifier's half of the exchange: given
/// the last bundle the owner signed, reproduce the plaintext.
pub fn decrypt_message(data: &DecryptionData, ciphertext_hex: &str) -> Result<String, CryptoError> {
    data.check_lengths()?;
    let key = password::derive_key(&data.plain_password, &data.salt)?;
    let plaintext = aead::decrypt(&key, &data.nonce, ciphertext_hex)?;
    String::from_utf8(plaintext).map_err(|_| CryptoError::NotUtf8)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[tokio::test]
    async fn decoy_queue_matches_repetitions() {
        let mut req = NonRepudiationRequirement::fake_chatter().await.unwrap();
        let n = req.repetitions();
        assert!((MIN_REPETITIONS..MAX_REPETITIONS).contains(&n));

        for _ in 0..n {
            let decoy = req.pop_decoy().expect("queue drained early");
            decoy.check_lengths().expect("decoy with bad lengths");
        }
        assert!(req.pop_decoy().is_none());
    }

    #[tokio::test]
    async fn decoys_come_out_in_fifo_order() {
        let mut req = NonRepudiationRequirement::fake_chatter().await.unwrap();
        let first = req.pop_decoy().unwrap();
        let second = req.pop_decoy().unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn real_bundle_inverts_encrypt() {
        let pool = PasswordPool::prime().await.unwrap();
        let req = NonRepudiationRequirement::generate(&pool).await.unwrap();

        let ciphertext = req.encrypt(b"Requested datum: Q3").unwrap();
        let plaintext = decrypt_message(&req.real_decryption(), &ciphertext).unwrap();
        assert_eq!(plaintext, "Requested datum: Q3");
    }

    #[tokio::test]
    async fn decoy_bundle_does_not_decrypt() {
        let pool = PasswordPool::prime().await.unwrap();
        let mut req = NonRepudiationRequirement::generate(&pool).await.unwrap();

        let ciphertext = req.encrypt(b"Requested datum: Q3").unwrap();
        let decoy = req.pop_decoy().unwrap();
        assert_matches!(decrypt_message(&decoy, &ciphertext), Err(CryptoError::Aead));
    }

    #[tokio::test]
    async fn fake_requirement_has_no_usable_decryption() {
        let req = NonRepudiationRequirement::fake_chatter().await.unwrap();
        let ciphertext = req.encrypt(b"whatever").unwrap();
        assert!(decrypt_message(&req.real_decryption(), &ciphertext).is_err());
    }

    #[test]
    fn length_violations_are_rejected() {
        let mut data = generate_decoy();
        data.plain_password.pop();
        assert_matches!(
            decrypt_message(&data, "00"),
            Err(CryptoError::InvalidLength { field: "plain_password", .. })
        );
    }
}
