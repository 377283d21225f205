//! Shared fixtures for the end-to-end tests.
#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, OnceLock};

use p3::identity::IdentityCard;
use p3::keys::PrivateKey;
use p3::listener::ListenerContext;
use p3::messages::MessageType;
use p3::password::PasswordPool;
use p3::requester::RequesterContext;
use p3::wire::{Envelope, TaggedEnvelope};
use rand::SeedableRng;
use rand_chacha::ChaChaRng;

pub const AUTHORITY: usize = 0;
pub const LISTENER: usize = 1;
pub const REQUESTER: usize = 2;
pub const SCRIPTED_EPHEMERAL: usize = 3;
pub const OTHER_LISTENER: usize = 4;

static KEYS: OnceLock<Vec<PrivateKey>> = OnceLock::new();

/// Deterministic long-term keys, generated once per test binary.
pub fn test_key(index: usize) -> &'static PrivateKey {
    let keys = KEYS.get_or_init(|| {
        let mut rng = ChaChaRng::seed_from_u64(0x1DE417);
        (0..5).map(|_| PrivateKey::generate_with(&mut rng).expect("keygen failed")).collect()
    });
    &keys[index]
}

/// The doubly wrapped card envelope `holder` sends for `ssoid`.
pub fn signed_card(ssoid: &str, holder: &PrivateKey) -> Envelope {
    let card = IdentityCard { ssoid: ssoid.into(), public_key: holder.public() };
    let authority_envelope = Envelope::seal(&card, test_key(AUTHORITY)).unwrap();
    let tagged = TaggedEnvelope {
        content: authority_envelope.content,
        signature: authority_envelope.signature,
        kind: MessageType::RealExchange,
    };
    Envelope::seal(&tagged, holder).unwrap()
}

/// A listener context for `ssoid`, storing transcripts under `dir`, with
/// audit export disabled.
pub async fn listener_ctx(ssoid: &str, key_index: usize, dir: &Path) -> ListenerContext {
    ListenerContext {
        private_key: Arc::new(test_key(key_index).clone()),
        signed_card: signed_card(ssoid, test_key(key_index)),
        authority_key: test_key(AUTHORITY).public(),
        pool: PasswordPool::prime().await.unwrap(),
        storage_dir: dir.to_path_buf(),
        audit: None,
    }
}

/// A requester context hunting for `target`, storing transcripts under
/// `dir`.
pub fn requester_ctx(target: &str, dir: &Path) -> RequesterContext {
    RequesterContext {
        private_key: Arc::new(test_key(REQUESTER).clone()),
        signed_card: signed_card("carol@x", test_key(REQUESTER)),
        authority_key: test_key(AUTHORITY).public(),
        target_ssoid: target.into(),
        justification: "audit".into(),
        datum: "Q3".into(),
        storage_dir: dir.to_path_buf(),
    }
}

/// The single JSON file a completed exchange left in `dir`.
pub fn only_transcript(dir: &Path) -> std::path::PathBuf {
    let mut entries: Vec<_> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    assert_eq!(entries.len(), 1, "expected exactly one transcript in {}", dir.display());
    entries.pop().unwrap()
}
