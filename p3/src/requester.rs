//! The data-consumer state machine.
//!
//! The requester receives the owner's card first, routes wrong peers to
//! cover traffic, and otherwise runs the exchange: request, encrypted
//! response, then an acknowledge loop that ends when the owner goes
//! quiet. Whatever bundle arrived last is the candidate key; the exchange
//! succeeded iff it decrypts the response.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::task;

use crate::errors::{CryptoError, ExchangeError, StoreError};
use crate::identity::{IdentityCard, PeerIdentity};
use crate::keys::{PrivateKey, PublicKey};
use crate::messages::{Acknowledgement, DecryptionData, FirstMessage, MessageType};
use crate::requirement::decrypt_message;
use crate::wire::{self, Envelope};
use crate::{identity, transcript, util};

/// An error terminating one requester-side exchange.
#[derive(Debug, Error)]
pub enum RequesterError {
    /// The protocol run itself failed.
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    /// The disclosure loop ended but the last bundle does not decrypt the
    /// response; the protocol failed.
    #[error("could not decrypt the response with the last received bundle")]
    Decrypt(#[source] CryptoError),

    /// The exchange succeeded but its transcript could not be written.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Everything a requester needs for one datum request.
pub struct RequesterContext {
    /// The node's long-term private key.
    pub private_key: Arc<PrivateKey>,
    /// The pre-signed own identity card.
    pub signed_card: Envelope,
    /// The identity authority's public key.
    pub authority_key: PublicKey,
    /// SSOID of the data owner to find.
    pub target_ssoid: String,
    /// Why the datum is wanted.
    pub justification: String,
    /// Name of the wanted datum.
    pub datum: String,
    /// Where transcripts are written.
    pub storage_dir: PathBuf,
}

/// A successfully completed real exchange.
#[derive(Debug)]
pub struct RealOutcome {
    /// The decrypted datum.
    pub plaintext: String,
    /// Path of the stored transcript.
    pub transcript: PathBuf,
}

/// What handling one discovered peer produced.
#[derive(Debug)]
pub enum StreamOutcome {
    /// The peer was the target and the exchange completed.
    Completed(RealOutcome),
    /// The peer was somebody else.
    NotTarget {
        /// Whether a fake exchange was run with them instead.
        chattered: bool,
    },
}

/// Handles one freshly opened stream: identity check, routing, and the
/// real exchange when the peer is the target.
pub async fn handle_stream<S>(
    ctx: &RequesterContext,
    stream: S,
    fake_on_mismatch: bool,
) -> Result<StreamOutcome, RequesterError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);

    // The owner talks first. A listener must never mark itself fake.
    let (card_envelope, peer) = identity::recv_card(&mut reader, &ctx.authority_key).await?;
    let listener_card = match peer {
        PeerIdentity::Real(card) => card,
        PeerIdentity::FakeChatter => {
            return Err(ExchangeError::Identity("owner sent a fake-chatter card".into()).into())
        }
    };

    if listener_card.ssoid != ctx.target_ssoid {
        if fake_on_mismatch {
            run_fake(&mut reader, &mut writer, &listener_card).await?;
            return Ok(StreamOutcome::NotTarget { chattered: true });
        }
        return Ok(StreamOutcome::NotTarget { chattered: false });
    }

    tracing::info!(ssoid = %ctx.target_ssoid, "found the correct peer, starting exchange");
    let outcome = run_real(ctx, &mut reader, &mut writer, card_envelope, &listener_card).await?;
    Ok(StreamOutcome::Completed(outcome))
}

async fn run_real<R, W>(
    ctx: &RequesterContext,
    reader: &mut R,
    writer: &mut W,
    card_envelope: Envelope,
    listener_card: &IdentityCard,
) -> Result<RealOutcome, RequesterError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut evidence = vec![card_envelope];

    wire::send_envelope(writer, &ctx.signed_card).await.map_err(ExchangeError::from)?;

    // Fresh per-exchange key; its public half becomes this exchange's
    // pseudonym source.
    let ephemeral = task::spawn_blocking(PrivateKey::generate)
        .await
        .expect("keygen task panicked")
        .map_err(ExchangeError::from)?;

    let request = FirstMessage {
        datum: ctx.datum.clone(),
        justification: ctx.justification.clone(),
        public_key: ephemeral.public(),
        kind: MessageType::Requester,
    };
    wire::send(writer, &request, &ctx.private_key).await?;

    // The response may wait on encryption and the password pool.
    let (response_envelope, response) = wire::recv_first_message(
        reader,
        Some(&listener_card.public_key),
        wire::FIRST_RESPONSE_TIMEOUT,
    )
    .await?;
    response.check()?;
    evidence.push(response_envelope.clone());

    // The owner's ephemeral key signs every bundle that follows.
    let owner_key = response.public_key.clone();

    let ack = Acknowledgement::new(&response_envelope.canonical_bytes().map_err(ExchangeError::from)?, 0);
    wire::send(writer, &ack, &ephemeral).await?;

    let (last_data, last_envelope, end_error) =
        disclosure_loop(reader, writer, &ephemeral, &owner_key).await?;

    match &end_error {
        err if err.is_timeout() => {
            tracing::info!("owner went quiet, trying to decrypt");
        }
        err => {
            tracing::info!(%err, "disclosure loop ended on an error, trying to decrypt anyway");
        }
    }

    let Some(data) = last_data else {
        // Nothing ever arrived; the loop error is the real story.
        return Err(end_error.into());
    };

    let plaintext = decrypt_message(&data, &response.datum).map_err(RequesterError::Decrypt)?;

    evidence.push(last_envelope.expect("bundle without envelope"));
    let path = transcript::store(&ctx.storage_dir, evidence, &ephemeral, &ctx.private_key.public())?;

    Ok(RealOutcome { plaintext, transcript: path })
}

/// Reads bundles and acknowledges each one until the stream goes quiet.
///
/// Returns the last bundle received (with its envelope) and the error
/// that ended the loop; a timeout is the expected terminator because the
/// owner simply stops after the real bundle.
async fn disclosure_loop<R, W>(
    reader: &mut R,
    writer: &mut W,
    ephemeral: &PrivateKey,
    owner_key: &PublicKey,
) -> Result<(Option<DecryptionData>, Option<Envelope>, ExchangeError), RequesterError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut last: Option<(DecryptionData, Envelope)> = None;

    for id in 1u64.. {
        let (envelope, data): (Envelope, DecryptionData) =
            match wire::recv(reader, owner_key, wire::DEFAULT_TIMEOUT).await {
                Ok(received) => received,
                Err(err) => {
                    let (data, envelope) = match last {
                        Some((data, envelope)) => (Some(data), Some(envelope)),
                        None => (None, None),
                    };
                    return Ok((data, envelope, err));
                }
            };

        // A bundle with any length off by one is rejected outright.
        data.check_lengths().map_err(ExchangeError::from)?;

        let ack =
            Acknowledgement::new(&envelope.canonical_bytes().map_err(ExchangeError::from)?, id);
        wire::send(writer, &ack, ephemeral).await?;

        last = Some((data, envelope));
    }
    unreachable!("disclosure loop only ends on a read error")
}

async fn run_fake<R, W>(
    reader: &mut R,
    writer: &mut W,
    listener_card: &IdentityCard,
) -> Result<(), ExchangeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let ephemeral =
        task::spawn_blocking(PrivateKey::generate).await.expect("keygen task panicked")?;

    wire::send_envelope(writer, &identity::fake_card(&ephemeral)?).await?;

    let request = FirstMessage {
        datum: util::random_hex_string(util::random_range(16, 64)),
        justification: "FakeChatter".into(),
        public_key: ephemeral.public(),
        kind: MessageType::FakeChatter,
    };
    wire::send(writer, &request, &ephemeral).await?;

    let (response_envelope, response) = wire::recv_first_message(
        reader,
        Some(&listener_card.public_key),
        wire::FIRST_RESPONSE_TIMEOUT,
    )
    .await?;
    response.check()?;

    let owner_key = response.public_key.clone();
    let ack = Acknowledgement::new(&response_envelope.canonical_bytes()?, 0);
    wire::send(writer, &ack, &ephemeral).await?;

    // Mirror the real acknowledge loop; nothing is kept or decrypted.
    for id in 1u64.. {
        let (envelope, _data): (Envelope, DecryptionData) =
            match wire::recv(reader, &owner_key, wire::DEFAULT_TIMEOUT).await {
                Ok(received) => received,
                Err(_) => break,
            };
        let ack = Acknowledgement::new(&envelope.canonical_bytes()?, id);
        wire::send(writer, &ack, &ephemeral).await?;
    }

    Ok(())
}

/// Runs a complete fake exchange on a fresh stream, identity handshake
/// included. This is what cover-traffic nodes do with every peer they
/// reach.
pub async fn fake_exchange<S>(authority_key: &PublicKey, stream: S) -> Result<(), ExchangeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);

    let (_, peer) = identity::recv_card(&mut reader, authority_key).await?;
    let listener_card = match peer {
        PeerIdentity::Real(card) => card,
        PeerIdentity::FakeChatter => {
            return Err(ExchangeError::Identity("owner sent a fake-chatter card".into()))
        }
    };

    run_fake(&mut reader, &mut writer, &listener_card).await
}
