use rand::rngs::OsRng;
use rand::{Rng, RngCore};

/// Draws a number from `[min, max)` using the operating system's CSPRNG.
pub fn random_range(min: usize, max: usize) -> usize {
    OsRng.gen_range(min..max)
}

/// Returns `len` random hex characters.
///
/// `len` is rounded up to the next even number, since every random byte
/// yields two hex digits.
pub fn random_hex_string(len: usize) -> String {
    let mut bytes = vec![0u8; len.div_ceil(2)];
    OsRng.fill_bytes(&mut bytes);
    let mut s = hex::encode(bytes);
    s.truncate(len.next_multiple_of(2));
    s
}

/// Fills a fixed-size array with random bytes from the OS CSPRNG.
pub fn random_array<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    OsRng.fill_bytes(&mut out);
    out
}

/// Serde adapter serializing `Vec<u8>` fields as standard base64 strings.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Encodes the bytes as a base64 JSON string.
    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(bytes).serialize(serializer)
    }

    /// Decodes a base64 JSON string back into bytes.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
