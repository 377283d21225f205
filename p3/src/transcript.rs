//! The on-disk transcript store.
//!
//! One JSON file per completed real exchange, named
//! `<YYYY-MM-DDTHH-MM-SS>-<pseudonym>.json` where the pseudonym is that of
//! the storer's ephemeral key. The file is everything the verifier needs:
//! the ephemeral private key, the storer's long-term public key and the
//! signed envelopes that carry the evidence.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::errors::StoreError;
use crate::keys::{PrivateKey, PublicKey};
use crate::wire::Envelope;

/// Where transcripts go unless the operator configures otherwise.
pub const DEFAULT_STORAGE_DIR: &str = "./exchanges";

/// The fewest envelopes any valid transcript can hold: the peer's card,
/// the peer's first message, and at least one piece of trailing evidence.
pub const MIN_MESSAGES: usize = 3;

/// A stored exchange, exactly as serialized to disk.
#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoredExchange {
    /// The storer's ephemeral private key for this exchange.
    pub private_key: PrivateKey,
    /// The storer's long-term public key.
    pub public_identity_key: PublicKey,
    /// The evidence envelopes, in protocol order.
    pub messages: Vec<Envelope>,
}

impl std::fmt::Debug for StoredExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredExchange").field("messages", &self.messages.len()).finish_non_exhaustive()
    }
}

/// Writes a transcript and returns the path of the new file.
pub fn store(
    dir: &Path,
    messages: Vec<Envelope>,
    private_key: &PrivateKey,
    public_identity_key: &PublicKey,
) -> Result<PathBuf, StoreError> {
    if messages.is_empty() {
        return Err(StoreError::Empty);
    }

    fs::create_dir_all(dir)?;

    let pseudonym = private_key.public().pseudonym()?;
    let stamp = Local::now().format("%Y-%m-%dT%H-%M-%S");
    let path = dir.join(format!("{stamp}-{pseudonym}.json"));

    let exchange = StoredExchange {
        private_key: private_key.clone(),
        public_identity_key: public_identity_key.clone(),
        messages,
    };
    fs::write(&path, serde_json::to_vec(&exchange)?)?;

    Ok(path)
}

/// Reads a transcript back, refusing files whose name does not match their
/// key or that hold too few envelopes.
pub fn load(path: &Path) -> Result<StoredExchange, StoreError> {
    let raw = fs::read(path)?;
    let exchange: StoredExchange = serde_json::from_slice(&raw)?;

    if !filename_matches_pseudonym(path, &exchange.private_key)? {
        return Err(StoreError::PseudonymMismatch);
    }
    if exchange.messages.len() < MIN_MESSAGES {
        return Err(StoreError::TooFewMessages(exchange.messages.len()));
    }

    Ok(exchange)
}

fn filename_matches_pseudonym(path: &Path, key: &PrivateKey) -> Result<bool, StoreError> {
    let name = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
    let from_file = name.rsplit('-').next().unwrap_or_default();
    Ok(from_file == key.public().pseudonym()?)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::messages::Acknowledgement;
    use crate::test_helpers::test_key;

    fn three_envelopes() -> Vec<Envelope> {
        (0..3)
            .map(|i| Envelope::seal(&Acknowledgement::new(b"m", i), test_key(0)).unwrap())
            .collect()
    }

    #[test]
    fn store_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = store(dir.path(), three_envelopes(), test_key(1), &test_key(0).public()).unwrap();

        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.ends_with(&format!("{}.json", test_key(1).public().pseudonym().unwrap())));

        let exchange = load(&path).unwrap();
        assert_eq!(exchange.messages.len(), 3);
        assert_eq!(exchange.private_key.public(), test_key(1).public());
        assert_eq!(exchange.public_identity_key, test_key(0).public());
    }

    #[test]
    fn empty_exchange_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        assert_matches!(
            store(dir.path(), Vec::new(), test_key(1), &test_key(0).public()),
            Err(StoreError::Empty)
        );
    }

    #[test]
    fn renamed_file_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = store(dir.path(), three_envelopes(), test_key(1), &test_key(0).public()).unwrap();

        let moved = dir.path().join("2024-01-01T00-00-00-deadbeef.json");
        std::fs::rename(&path, &moved).unwrap();
        assert_matches!(load(&moved), Err(StoreError::PseudonymMismatch));
    }

    #[test]
    fn short_transcript_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path =
            store(dir.path(), three_envelopes()[..2].to_vec(), test_key(1), &test_key(0).public())
                .unwrap();
        assert_matches!(load(&path), Err(StoreError::TooFewMessages(2)));
    }
}
