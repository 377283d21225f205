//! The independent judge.
//!
//! Given one transcript, decides whether the exchange completed by
//! reproducing the plaintext from the stored evidence alone. Given two,
//! first establishes that they describe the same exchange, then judges
//! each side and applies the dispute table. The verifier never contacts
//! the identity authority beyond knowing its public key.
//!
//! Because the *receiving* party stores the first message, the stored
//! message's type names the sender, which is the opposite role of the
//! storer: a `Listener`-typed first message means the transcript was
//! written by the requester, and vice versa.

use std::path::Path;

use crate::errors::VerifyError;
use crate::identity::{self, IdentityCard, PeerIdentity};
use crate::keys::PublicKey;
use crate::messages::{Acknowledgement, DecryptionData, FirstMessage, MessageType};
use crate::requirement::decrypt_message;
use crate::transcript::{self, StoredExchange};
use crate::wire::Envelope;

/// The verdict of a dispute, mapped onto exit codes by the binary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Judgment {
    /// The exchange demonstrably completed.
    Success,
    /// The exchange demonstrably did not complete for the first file's
    /// holder.
    Failure,
    /// No decision is possible from the given files.
    NotPossible,
}

impl Judgment {
    /// Process exit code for this verdict.
    pub fn exit_code(self) -> i32 {
        match self {
            Judgment::Success => 0,
            Judgment::Failure => 1,
            Judgment::NotPossible => 2,
        }
    }
}

/// Which party wrote a transcript.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// The data owner.
    Listener,
    /// The data consumer.
    Requester,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Listener => f.write_str("Listener"),
            Role::Requester => f.write_str("Requester"),
        }
    }
}

/// The outcome of success mode on a single transcript.
#[derive(Debug)]
pub struct SuccessReport {
    /// Who wrote the transcript.
    pub storer: Role,
    /// The SSOID of the *other* party, from the stored card.
    pub peer_ssoid: String,
    /// The reproduced plaintext.
    pub decrypted: String,
}

/// Per-file result inside a dispute.
#[derive(Debug)]
pub struct FileReport {
    /// Who wrote this transcript.
    pub storer: Role,
    /// The SSOID of the other party.
    pub peer_ssoid: String,
    /// The reproduced plaintext, or why reproduction failed.
    pub outcome: Result<String, VerifyError>,
}

/// The full result of dispute mode.
#[derive(Debug)]
pub struct DisputeOutcome {
    /// The verdict.
    pub judgment: Judgment,
    /// Operator-readable reasoning for the verdict.
    pub summary: String,
    /// Per-file reports; absent when the files could not even be paired.
    pub reports: Option<(FileReport, FileReport)>,
}

struct Loaded {
    exchange: StoredExchange,
    first: FirstMessage,
    card: IdentityCard,
}

/// Success mode: judges a single transcript.
pub fn verify_success(path: &Path, authority_key: &PublicKey) -> Result<SuccessReport, VerifyError> {
    let loaded = load_and_extract(path, authority_key)?;
    let report = verify_trailing(&loaded);
    Ok(SuccessReport {
        storer: report.storer,
        peer_ssoid: report.peer_ssoid,
        decrypted: report.outcome?,
    })
}

/// Dispute mode: judges two transcripts against each other.
pub fn solve_dispute(first: &Path, second: &Path, authority_key: &PublicKey) -> DisputeOutcome {
    let not_possible = |summary: String| DisputeOutcome {
        judgment: Judgment::NotPossible,
        summary,
        reports: None,
    };

    let a = match load_and_extract(first, authority_key) {
        Ok(loaded) => loaded,
        Err(err) => return not_possible(format!("could not parse the first file: {err}")),
    };
    let b = match load_and_extract(second, authority_key) {
        Ok(loaded) => loaded,
        Err(err) => return not_possible(format!("could not parse the second file: {err}")),
    };

    if let Err(err) = belongs_together(&a, &b) {
        return not_possible(err.to_string());
    }

    let report_a = verify_trailing(&a);
    let report_b = verify_trailing(&b);

    let (judgment, summary) = match (&report_a.outcome, &report_b.outcome) {
        (Ok(left), Ok(right)) if left != right => (
            Judgment::NotPossible,
            "the decrypted content is not equal, unable to make a decision".to_string(),
        ),
        (Ok(_), Ok(_)) => (
            Judgment::Success,
            "both files state that the exchange ended successfully".to_string(),
        ),
        (Err(_), Ok(_)) => (
            Judgment::Success,
            "the first file indicates failure, but the second file proves the exchange ended successfully"
                .to_string(),
        ),
        (Ok(_), Err(_)) => (
            Judgment::Failure,
            "the second file indicates failure, but the first file proves the exchange ended successfully"
                .to_string(),
        ),
        (Err(_), Err(_)) => (
            Judgment::NotPossible,
            "neither file verifies, unable to make a decision".to_string(),
        ),
    };

    DisputeOutcome { judgment, summary, reports: Some((report_a, report_b)) }
}

fn load_and_extract(path: &Path, authority_key: &PublicKey) -> Result<Loaded, VerifyError> {
    let exchange = transcript::load(path)?;
    let (first, card) = extract_and_verify(&exchange.messages, authority_key)?;
    Ok(Loaded { exchange, first, card })
}

/// Verifies the two leading envelopes every transcript shares: the peer's
/// identity card and the first message signed by the card key.
fn extract_and_verify(
    messages: &[Envelope],
    authority_key: &PublicKey,
) -> Result<(FirstMessage, IdentityCard), VerifyError> {
    if messages.len() < 2 {
        return Err(VerifyError::TrailingCount { expected: 2, actual: messages.len() });
    }

    let card = match identity::verify_card(&messages[0], authority_key) {
        Ok(PeerIdentity::Real(card)) => card,
        Ok(PeerIdentity::FakeChatter) => {
            return Err(VerifyError::Card("identity card is marked as fake chatter".into()))
        }
        Err(err) => return Err(VerifyError::Card(err.to_string())),
    };

    messages[1].verify(&card.public_key).map_err(|_| VerifyError::Signature { index: 1 })?;
    let first: FirstMessage = serde_json::from_slice(&messages[1].content)?;
    first.check().map_err(|err| VerifyError::FirstMessage(err.to_string()))?;

    Ok((first, card))
}

fn verify_trailing(loaded: &Loaded) -> FileReport {
    let (storer, outcome) = match loaded.first.kind {
        MessageType::Listener => (
            Role::Requester,
            verify_requester_success(
                &loaded.exchange.messages[2..],
                &loaded.first.public_key,
                &loaded.first.datum,
            ),
        ),
        MessageType::Requester => (
            Role::Listener,
            verify_listener_success(
                &loaded.exchange.messages[2..],
                &loaded.first.public_key,
                &loaded.exchange.private_key.public(),
                &loaded.exchange.public_identity_key,
            ),
        ),
        other => (
            Role::Requester,
            Err(VerifyError::FirstMessage(format!("unexpected first message type {other:?}"))),
        ),
    };

    FileReport { storer, peer_ssoid: loaded.card.ssoid.clone(), outcome }
}

/// The requester stored the owner's last signed decryption bundle; verify
/// it under the owner's ephemeral key and decrypt the stored ciphertext.
fn verify_requester_success(
    trailing: &[Envelope],
    owner_ephemeral: &PublicKey,
    encrypted_datum: &str,
) -> Result<String, VerifyError> {
    let [envelope] = trailing else {
        return Err(VerifyError::TrailingCount { expected: 1, actual: trailing.len() });
    };

    envelope.verify(owner_ephemeral).map_err(|_| VerifyError::Signature { index: 0 })?;
    let data: DecryptionData = serde_json::from_slice(&envelope.content)?;

    decrypt_message(&data, encrypted_datum).map_err(VerifyError::Decrypt)
}

/// The listener stored the consumer's receipts for its first response and
/// for the real bundle. Unwrap both acks, verify the inner envelopes
/// under their signers, then decrypt.
fn verify_listener_success(
    trailing: &[Envelope],
    consumer_ephemeral: &PublicKey,
    owner_ephemeral: &PublicKey,
    owner_identity: &PublicKey,
) -> Result<String, VerifyError> {
    let [first_ack, data_ack] = trailing else {
        return Err(VerifyError::TrailingCount { expected: 2, actual: trailing.len() });
    };

    for (index, envelope) in [first_ack, data_ack].into_iter().enumerate() {
        envelope.verify(consumer_ephemeral).map_err(|_| VerifyError::Signature { index })?;
    }

    // The first response was signed with the owner's long-term key, the
    // real bundle with its ephemeral key.
    let first_bytes = acknowledged_content(first_ack, owner_identity, 0)?;
    let first: FirstMessage = serde_json::from_slice(&first_bytes)?;

    let data_bytes = acknowledged_content(data_ack, owner_ephemeral, 1)?;
    let data: DecryptionData = serde_json::from_slice(&data_bytes)?;

    decrypt_message(&data, &first.datum).map_err(VerifyError::Decrypt)
}

/// Unwraps an acknowledgement: parses the ack, parses the envelope it
/// echoes, verifies that inner envelope under `inner_key` and returns the
/// inner content.
fn acknowledged_content(
    envelope: &Envelope,
    inner_key: &PublicKey,
    index: usize,
) -> Result<Vec<u8>, VerifyError> {
    let ack: Acknowledgement = serde_json::from_slice(&envelope.content)?;
    let inner: Envelope = serde_json::from_slice(&ack.content)?;
    inner.verify(inner_key).map_err(|_| VerifyError::Signature { index })?;
    Ok(inner.content)
}

/// Checks that two transcripts describe the same exchange: opposite
/// roles, different parties, and crossed ephemeral-key pseudonyms (each
/// side stores the other's ephemeral public key in its first message).
fn belongs_together(a: &Loaded, b: &Loaded) -> Result<(), VerifyError> {
    if a.first.kind == b.first.kind {
        return Err(VerifyError::Unrelated("the files have the same type".into()));
    }
    if a.card.ssoid == b.card.ssoid {
        return Err(VerifyError::Unrelated("the files name the same SSOID".into()));
    }

    let crossed = |x: &Loaded, y: &Loaded| -> Result<bool, VerifyError> {
        let from_first = x.first.public_key.pseudonym()?;
        let from_key = y.exchange.private_key.public().pseudonym()?;
        Ok(from_first == from_key)
    };

    if !crossed(a, b)? || !crossed(b, a)? {
        return Err(VerifyError::Unrelated("the ephemeral pseudonyms do not match".into()));
    }
    Ok(())
}
