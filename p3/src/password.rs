//! Password material and the bcrypt-based key derivation.
//!
//! The AES key protecting a datum is `BLAKE2s-256(bcrypt(password, salt))`
//! at cost 16. The cost is the protocol's puzzle: roughly three seconds per
//! derivation on the target hardware, which bounds how fast a cheating
//! consumer can try candidate bundles. Salts travel in bcrypt's base64
//! alphabet, 22 characters for 16 raw bytes.

use std::collections::VecDeque;
use std::sync::Arc;

use base64::alphabet;
use base64::engine::general_purpose::NO_PAD;
use base64::engine::GeneralPurpose;
use base64::Engine;
use blake2::{Blake2s256, Digest as _};
use tokio::sync::Mutex;
use tokio::task;

use crate::errors::CryptoError;
use crate::util;

/// Length of the random plain password in bytes.
pub const PLAIN_LEN: usize = 32;

/// Length of the transported (base64-encoded) salt in bytes.
pub const SALT_LEN: usize = 22;

/// Length of the derived AES key in bytes.
pub const KEY_LEN: usize = 32;

/// bcrypt cost factor; see the module docs for why it is this high.
pub const COST: u32 = 16;

/// How many derived bundles the pre-computation pool holds.
pub const POOL_CAPACITY: usize = 2;

const RAW_SALT_LEN: usize = 16;
// C bcrypt implementations only emit 23 of the 24 output bytes; the
// derivation keeps that prefix.
const RAW_HASH_LEN: usize = 23;

const BCRYPT_B64: GeneralPurpose = GeneralPurpose::new(&alphabet::BCRYPT, NO_PAD);

/// Returns a fresh 32-byte random plain password.
pub fn generate_plain_password() -> [u8; PLAIN_LEN] {
    util::random_array()
}

/// Returns a fresh random salt, already in its 22-char transport encoding.
pub fn generate_salt() -> Vec<u8> {
    let raw: [u8; RAW_SALT_LEN] = util::random_array();
    BCRYPT_B64.encode(raw).into_bytes()
}

/// Derives the 32-byte AES key from a plain password and a transported salt.
pub fn derive_key(password: &[u8], salt: &[u8]) -> Result<[u8; KEY_LEN], CryptoError> {
    derive_key_with_cost(password, salt, COST)
}

fn derive_key_with_cost(password: &[u8], salt: &[u8], cost: u32) -> Result<[u8; KEY_LEN], CryptoError> {
    if salt.len() != SALT_LEN {
        return Err(CryptoError::InvalidLength {
            field: "salt",
            expected: SALT_LEN,
            actual: salt.len(),
        });
    }
    let salt_str = std::str::from_utf8(salt)
        .map_err(|_| CryptoError::Base64(base64::DecodeError::InvalidByte(0, 0)))?;
    let raw = BCRYPT_B64.decode(salt_str)?;
    let raw: [u8; RAW_SALT_LEN] = raw.try_into().map_err(|v: Vec<u8>| CryptoError::InvalidLength {
        field: "decoded salt",
        expected: RAW_SALT_LEN,
        actual: v.len(),
    })?;

    let hashed = bcrypt::bcrypt(cost, raw, password);
    Ok(Blake2s256::digest(&hashed[..RAW_HASH_LEN]).into())
}

/// A plain password with its derived key and the salt that links the two.
#[derive(Clone)]
pub struct PasswordBundle {
    /// The 32-byte random plain password.
    pub plain: Vec<u8>,
    /// The derived AES key.
    pub derived: [u8; KEY_LEN],
    /// The transported salt.
    pub salt: Vec<u8>,
}

impl PasswordBundle {
    /// Generates a password and salt and runs the full derivation.
    /// Takes seconds; callers on a hot path should use [`PasswordPool`].
    pub fn generate() -> Result<Self, CryptoError> {
        let plain = generate_plain_password();
        let salt = generate_salt();
        let derived = derive_key(&plain, &salt)?;
        Ok(PasswordBundle { plain: plain.to_vec(), derived, salt })
    }
}

impl std::fmt::Debug for PasswordBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PasswordBundle([redacted])")
    }
}

/// A small pool of pre-derived password bundles.
///
/// Deriving a bundle costs seconds, so the listener keeps a few ready:
/// one is derived synchronously at startup to unblock the accept loop,
/// the rest fill in the background, and every pop kicks off a refill.
#[derive(Clone)]
pub struct PasswordPool {
    bundles: Arc<Mutex<VecDeque<PasswordBundle>>>,
    capacity: usize,
}

impl PasswordPool {
    /// Creates a pool with one ready bundle and a background fill for the
    /// remainder. Returns once the first bundle is available.
    pub async fn prime() -> Result<Self, CryptoError> {
        let pool = PasswordPool {
            bundles: Arc::new(Mutex::new(VecDeque::with_capacity(POOL_CAPACITY))),
            capacity: POOL_CAPACITY,
        };

        let first = task::spawn_blocking(PasswordBundle::generate)
            .await
            .expect("derivation task panicked")?;
        pool.bundles.lock().await.push_back(first);

        for _ in 1..pool.capacity {
            pool.spawn_refill();
        }
        Ok(pool)
    }

    /// Pops the oldest ready bundle, deriving one inline when the pool ran
    /// dry, and schedules a replacement.
    pub async fn pop(&self) -> Result<PasswordBundle, CryptoError> {
        let popped = self.bundles.lock().await.pop_front();
        let bundle = match popped {
            Some(bundle) => bundle,
            None => {
                tracing::info!("password pool ran dry, deriving inline");
                task::spawn_blocking(PasswordBundle::generate)
                    .await
                    .expect("derivation task panicked")?
            }
        };
        self.spawn_refill();
        Ok(bundle)
    }

    fn spawn_refill(&self) {
        let bundles = Arc::clone(&self.bundles);
        let capacity = self.capacity;
        task::spawn(async move {
            {
                let queue = bundles.lock().await;
                if queue.len() >= capacity {
                    return;
                }
            }
            match task::spawn_blocking(PasswordBundle::generate).await {
                Ok(Ok(bundle)) => {
                    let mut queue = bundles.lock().await;
                    if queue.len() < capacity {
                        queue.push_back(bundle);
                    }
                }
                Ok(Err(err)) => tracing::warn!(%err, "could not refill password pool"),
                Err(err) => tracing::warn!(%err, "password refill task panicked"),
            }
        });
    }
}
