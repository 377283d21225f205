//! Identity cards and their two-signature verification.
//!
//! A card binds an SSOID to a long-term public key. On the wire a card is
//! doubly wrapped: the authority's signed envelope (proving the binding)
//! travels inside an envelope signed by the peer itself (proving
//! possession of the bound key). The authority signature is checked first;
//! its verified content names the public key, which then checks the outer
//! signature.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

use crate::errors::{AuthorityError, ExchangeError};
use crate::keys::{PrivateKey, PublicKey};
use crate::messages::MessageType;
use crate::wire::{self, Envelope, TaggedEnvelope};

/// Where the node's long-term private key lives.
pub const KEY_FILE: &str = "./_privateKey.pem";

/// Where the authority-signed identity card lives (the raw `/key/sign`
/// response body).
pub const IDENTITY_FILE: &str = "./_identity.json";

/// The authority-signed binding of an SSOID to a long-term public key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IdentityCard {
    /// Opaque identifier minted by the identity authority.
    pub ssoid: String,
    /// The bound long-term public key.
    pub public_key: PublicKey,
}

/// The outcome of verifying a peer's card envelope.
#[derive(Clone, Debug)]
pub enum PeerIdentity {
    /// A fully verified card.
    Real(IdentityCard),
    /// The peer marked itself as cover traffic and sent no card.
    FakeChatter,
}

/// Verifies the doubly wrapped card inside `peer_envelope`.
///
/// An authority-tagged `FakeChatter` card short-circuits without any
/// signature checks, since there is nothing to verify.
pub fn verify_card(
    peer_envelope: &Envelope,
    authority_key: &PublicKey,
) -> Result<PeerIdentity, ExchangeError> {
    let tagged: TaggedEnvelope = peer_envelope.open_unchecked()?;

    if tagged.kind == MessageType::FakeChatter {
        return Ok(PeerIdentity::FakeChatter);
    }

    let authority_envelope = Envelope { content: tagged.content, signature: tagged.signature };
    authority_envelope
        .verify(authority_key)
        .map_err(|_| ExchangeError::Identity("authority signature does not verify".into()))?;

    let card: IdentityCard = authority_envelope.open_unchecked()?;
    if card.ssoid.is_empty() {
        return Err(ExchangeError::Identity("card carries an empty SSOID".into()));
    }

    peer_envelope
        .verify(&card.public_key)
        .map_err(|_| ExchangeError::Identity("peer does not hold the key its card names".into()))?;

    Ok(PeerIdentity::Real(card))
}

/// Reads and verifies a peer's card envelope from the stream.
pub async fn recv_card<R: AsyncRead + Unpin>(
    reader: &mut R,
    authority_key: &PublicKey,
) -> Result<(Envelope, PeerIdentity), ExchangeError> {
    let envelope = wire::recv_envelope(reader, wire::IDENTITY_TIMEOUT).await?;
    let identity = verify_card(&envelope, authority_key)?;
    Ok((envelope, identity))
}

/// Loads the authority-signed card from disk and wraps it in a possession
/// envelope signed with `private_key`, ready to send.
pub fn load_signed_card(path: &Path, private_key: &PrivateKey) -> Result<Envelope, AuthorityError> {
    let raw = fs::read(path)?;
    let authority_envelope: Envelope = serde_json::from_slice(&raw)?;

    let tagged = TaggedEnvelope {
        content: authority_envelope.content,
        signature: authority_envelope.signature,
        kind: MessageType::RealExchange,
    };
    Envelope::seal(&tagged, private_key)
        .map_err(|err| AuthorityError::BadCard(format!("could not sign own card: {err}")))
}

/// Builds the empty, fake-tagged card a cover-traffic node sends instead
/// of a real identity.
pub fn fake_card(private_key: &PrivateKey) -> Result<Envelope, ExchangeError> {
    let tagged =
        TaggedEnvelope { content: Vec::new(), signature: Vec::new(), kind: MessageType::FakeChatter };
    Envelope::seal(&tagged, private_key)
}

/// Re-verifies the stored card and returns the SSOID it binds.
pub fn own_ssoid(
    path: &Path,
    private_key: &PrivateKey,
    authority_key: &PublicKey,
) -> Result<String, AuthorityError> {
    let envelope = load_signed_card(path, private_key)?;
    match verify_card(&envelope, authority_key) {
        Ok(PeerIdentity::Real(card)) => Ok(card.ssoid),
        Ok(PeerIdentity::FakeChatter) => {
            Err(AuthorityError::BadCard("own card is marked as fake chatter".into()))
        }
        Err(err) => Err(AuthorityError::BadCard(err.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::test_helpers::{signed_card, test_key};

    #[test]
    fn valid_card_verifies() {
        let authority = test_key(0);
        let holder = test_key(1);
        let envelope = signed_card("alice@x", holder, authority);

        let identity = verify_card(&envelope, &authority.public()).unwrap();
        assert_matches!(identity, PeerIdentity::Real(card) => {
            assert_eq!(card.ssoid, "alice@x");
            assert_eq!(card.public_key, holder.public());
        });
    }

    #[test]
    fn fake_tag_short_circuits() {
        let envelope = fake_card(test_key(1)).unwrap();
        let identity = verify_card(&envelope, &test_key(0).public()).unwrap();
        assert_matches!(identity, PeerIdentity::FakeChatter);
    }

    #[test]
    fn wrong_authority_is_rejected() {
        let envelope = signed_card("alice@x", test_key(1), test_key(0));
        let result = verify_card(&envelope, &test_key(2).public());
        assert_matches!(result, Err(ExchangeError::Identity(_)));
    }

    #[test]
    fn stolen_card_is_rejected() {
        let authority = test_key(0);
        // A card naming key 1, wrapped by someone holding key 2.
        let card = IdentityCard { ssoid: "alice@x".into(), public_key: test_key(1).public() };
        let authority_envelope = Envelope::seal(&card, authority).unwrap();
        let tagged = TaggedEnvelope {
            content: authority_envelope.content,
            signature: authority_envelope.signature,
            kind: MessageType::RealExchange,
        };
        let envelope = Envelope::seal(&tagged, test_key(2)).unwrap();

        let result = verify_card(&envelope, &authority.public());
        assert_matches!(result, Err(ExchangeError::Identity(msg)) => {
            assert!(msg.contains("possession") || msg.contains("hold"), "{msg}");
        });
    }

    #[test]
    fn empty_ssoid_is_rejected() {
        let envelope = signed_card("", test_key(1), test_key(0));
        assert_matches!(
            verify_card(&envelope, &test_key(0).public()),
            Err(ExchangeError::Identity(_))
        );
    }
}
