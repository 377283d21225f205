//! Long-term and ephemeral RSA key material.
//!
//! Every signature in the protocol is PKCS#1 v1.5 over SHA-256; audit
//! payloads use OAEP. Public keys travel and persist as base64-encoded
//! SubjectPublicKeyInfo DER, private keys as PKCS#1 PEM, and a key's
//! pseudonym is the hex BLAKE2s-256 digest of its SPKI encoding.

use std::fmt::{self, Debug, Formatter};
use std::fs;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use blake2::{Blake2s256, Digest as _};
use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::{Oaep, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::Sha256;

use crate::errors::CryptoError;

/// RSA modulus size for every key in the system.
pub const KEY_BITS: usize = 3072;

/// The fixed label bound into every OAEP audit encryption.
pub const OAEP_LABEL: &str = "P3-log";

/// An RSA public key together with its wire encoding rules.
#[derive(Clone, PartialEq)]
pub struct PublicKey(RsaPublicKey);

impl PublicKey {
    /// Verifies a PKCS#1 v1.5 SHA-256 signature over `message`.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), rsa::Error> {
        let digest = Sha256::digest(message);
        self.0.verify(Pkcs1v15Sign::new::<Sha256>(), digest.as_slice(), signature)
    }

    /// Encrypts `plaintext` with OAEP-SHA256 under the audit label,
    /// returning hex ciphertext.
    pub fn oaep_encrypt(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        let padding = Oaep::new_with_label::<Sha256, _>(OAEP_LABEL);
        let ciphertext = self.0.encrypt(&mut OsRng, padding, plaintext)?;
        Ok(hex::encode(ciphertext))
    }

    /// Returns the PKIX/SPKI DER encoding of this key.
    pub fn spki_der(&self) -> Result<Vec<u8>, CryptoError> {
        Ok(self.0.to_public_key_der()?.as_bytes().to_vec())
    }

    /// Decodes a key from its PKIX/SPKI DER encoding.
    pub fn from_spki_der(der: &[u8]) -> Result<Self, CryptoError> {
        Ok(PublicKey(RsaPublicKey::from_public_key_der(der)?))
    }

    /// The exchange pseudonym of this key: 64 hex chars of
    /// BLAKE2s-256 over the SPKI DER.
    pub fn pseudonym(&self) -> Result<String, CryptoError> {
        Ok(hex::encode(Blake2s256::digest(self.spki_der()?)))
    }
}

impl Debug for PublicKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.pseudonym() {
            Ok(p) => write!(f, "PublicKey({p})"),
            Err(_) => f.write_str("PublicKey(<unencodable>)"),
        }
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let der = self.spki_der().map_err(serde::ser::Error::custom)?;
        BASE64.encode(der).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let der = BASE64.decode(encoded).map_err(serde::de::Error::custom)?;
        PublicKey::from_spki_der(&der).map_err(serde::de::Error::custom)
    }
}

/// An RSA private key. Signs, decrypts, and persists as PKCS#1 PEM.
#[derive(Clone)]
pub struct PrivateKey(RsaPrivateKey);

impl PartialEq for PrivateKey {
    fn eq(&self, other: &Self) -> bool {
        self.public() == other.public()
    }
}

impl PrivateKey {
    /// Generates a fresh 3072-bit key with the OS CSPRNG.
    pub fn generate() -> Result<Self, CryptoError> {
        Self::generate_with(&mut OsRng)
    }

    /// Generates a fresh 3072-bit key with the given RNG.
    pub fn generate_with<R: CryptoRng + RngCore>(rng: &mut R) -> Result<Self, CryptoError> {
        Ok(PrivateKey(RsaPrivateKey::new(rng, KEY_BITS)?))
    }

    /// The public half of this key.
    pub fn public(&self) -> PublicKey {
        PublicKey(self.0.to_public_key())
    }

    /// Signs `message` with PKCS#1 v1.5 over SHA-256.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let digest = Sha256::digest(message);
        Ok(self.0.sign(Pkcs1v15Sign::new::<Sha256>(), digest.as_slice())?)
    }

    /// Decrypts hex ciphertext produced by [`PublicKey::oaep_encrypt`].
    pub fn oaep_decrypt(&self, ciphertext_hex: &str) -> Result<Vec<u8>, CryptoError> {
        let ciphertext = hex::decode(ciphertext_hex)?;
        let padding = Oaep::new_with_label::<Sha256, _>(OAEP_LABEL);
        Ok(self.0.decrypt(padding, &ciphertext)?)
    }

    /// Writes the key to `path` as a PKCS#1 PEM file, world-readable like
    /// the identity card next to it.
    pub fn save(&self, path: &Path) -> Result<(), CryptoError> {
        let pem = self.0.to_pkcs1_pem(LineEnding::LF)?;
        fs::write(path, pem.as_bytes())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o644));
        }
        Ok(())
    }

    /// Loads a PKCS#1 PEM key from `path`.
    pub fn load(path: &Path) -> Result<Self, CryptoError> {
        let pem = fs::read_to_string(path)?;
        Ok(PrivateKey(RsaPrivateKey::from_pkcs1_pem(&pem)?))
    }
}

impl Debug for PrivateKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey([redacted])")
    }
}

impl Serialize for PrivateKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let pem = self.0.to_pkcs1_pem(LineEnding::LF).map_err(serde::ser::Error::custom)?;
        pem.as_str().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PrivateKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let pem = String::deserialize(deserializer)?;
        RsaPrivateKey::from_pkcs1_pem(&pem).map(PrivateKey).map_err(serde::de::Error::custom)
    }
}
