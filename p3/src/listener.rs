//! The data-owner state machine.
//!
//! One accepted stream, one exchange: identity handshake, datum
//! encryption, then the disclosure loop that refuses to sign the real
//! decryption bundle until every preceding decoy has been acknowledged.
//! Any verification failure aborts silently towards the peer; the abort
//! is visible only in the operator's log.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};

use crate::audit::{self, AuditSinks};
use crate::errors::{ExchangeError, StoreError};
use crate::identity::{IdentityCard, PeerIdentity};
use crate::keys::{PrivateKey, PublicKey};
use crate::messages::{Acknowledgement, FirstMessage, MessageType};
use crate::password::PasswordPool;
use crate::requirement::NonRepudiationRequirement;
use crate::wire::{self, Envelope};
use crate::{identity, transcript, util};

/// An error terminating one listener-side exchange.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// The protocol run itself failed.
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    /// The exchange completed but its transcript could not be written.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Everything a listener needs to serve exchanges; built once at startup
/// and shared by every connection task.
pub struct ListenerContext {
    /// The node's long-term private key.
    pub private_key: Arc<PrivateKey>,
    /// The pre-signed own identity card, ready to send.
    pub signed_card: Envelope,
    /// The identity authority's public key.
    pub authority_key: PublicKey,
    /// Pre-computed password bundles.
    pub pool: PasswordPool,
    /// Where transcripts are written.
    pub storage_dir: PathBuf,
    /// Audit sinks; `None` disables exporting.
    pub audit: Option<Arc<AuditSinks>>,
}

/// What a completed exchange left behind.
#[derive(Debug)]
pub struct ListenerOutcome {
    /// Whether the exchange was cover traffic.
    pub fake: bool,
    /// Path of the stored transcript, for real exchanges.
    pub transcript: Option<PathBuf>,
}

/// Runs one exchange as data owner over an accepted stream.
#[tracing::instrument(level = "info", skip(ctx, stream))]
pub async fn handle_stream<S>(
    ctx: &ListenerContext,
    stream: S,
    conn: u64,
) -> Result<ListenerOutcome, ListenerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);

    let mut last_timestamp = Utc::now().timestamp();
    let mut evidence: Vec<Envelope> = Vec::new();

    // Send own identity card, then learn who is asking.
    wire::send_envelope(&mut writer, &ctx.signed_card).await?;

    let (card_envelope, peer) = identity::recv_card(&mut reader, &ctx.authority_key).await?;
    let peer_card: Option<IdentityCard> = match peer {
        PeerIdentity::Real(card) => Some(card),
        PeerIdentity::FakeChatter => None,
    };
    let is_fake = peer_card.is_none();
    evidence.push(card_envelope);

    // The datum request, signed by the card key for real exchanges.
    let (first_envelope, request) = wire::recv_first_message(
        &mut reader,
        peer_card.as_ref().map(|card| &card.public_key),
        wire::DEFAULT_TIMEOUT,
    )
    .await?;

    if is_fake {
        request.check()?;
        if request.kind != MessageType::FakeChatter {
            return Err(ExchangeError::Protocol(
                "card is marked as fake chatter but the first message is not".into(),
            )
            .into());
        }
    } else {
        request.check_with_justification()?;
        if request.kind != MessageType::Requester {
            return Err(ExchangeError::Protocol(format!(
                "expected a requester first message, got {:?}",
                request.kind
            ))
            .into());
        }
    }
    evidence.push(first_envelope);

    // The consumer's ephemeral key signs everything it sends from here on.
    let consumer_key = request.public_key.clone();

    // Built only now, so fake chatter never pays the bcrypt derivation.
    let mut requirement = if is_fake {
        NonRepudiationRequirement::fake_chatter().await.map_err(ExchangeError::from)?
    } else {
        NonRepudiationRequirement::generate(&ctx.pool).await.map_err(ExchangeError::from)?
    };

    let plaintext = if is_fake {
        util::random_hex_string(util::random_range(64, 512))
    } else {
        format!("Requested datum: {}", request.datum)
    };
    let ciphertext = requirement.encrypt(plaintext.as_bytes()).map_err(ExchangeError::from)?;

    let response = FirstMessage {
        datum: ciphertext,
        justification: String::new(),
        public_key: requirement.ephemeral().public(),
        kind: MessageType::Listener,
    };
    let response_bytes = wire::send(&mut writer, &response, &ctx.private_key).await?;

    let (ack_envelope, ack): (Envelope, Acknowledgement) =
        wire::recv(&mut reader, &consumer_key, wire::DEFAULT_TIMEOUT).await?;
    ack.check(0, last_timestamp, &response_bytes)?;
    last_timestamp = ack.timestamp;
    evidence.push(ack_envelope);

    // The disclosure loop: decoys in FIFO order, the real bundle last,
    // each one released only after a valid receipt for the previous send.
    let repetitions = requirement.repetitions();
    for round in 0..=repetitions {
        let (data, is_real) = if round < repetitions {
            let decoy = requirement
                .pop_decoy()
                .ok_or_else(|| ExchangeError::Protocol("decoy queue drained early".into()))?;
            (decoy, false)
        } else {
            (requirement.real_decryption(), true)
        };

        let sent = wire::send(&mut writer, &data, requirement.ephemeral()).await?;
        let (ack_envelope, ack): (Envelope, Acknowledgement) =
            wire::recv(&mut reader, &consumer_key, wire::DEFAULT_TIMEOUT).await?;
        ack.check(round as u64 + 1, last_timestamp, &sent)?;
        last_timestamp = ack.timestamp;

        if is_real {
            // The receipt for the real bundle is the evidence the whole
            // protocol exists for.
            evidence.push(ack_envelope);
        }
    }

    if is_fake {
        tracing::info!(conn, "fake exchange ended");
        return Ok(ListenerOutcome { fake: true, transcript: None });
    }

    tracing::info!(conn, "exchange ended successfully");

    let ephemeral = requirement.ephemeral().clone();
    let path = transcript::store(&ctx.storage_dir, evidence, &ephemeral, &ctx.private_key.public())?;

    if let Some(sinks) = &ctx.audit {
        let record = audit::ExchangeRecord {
            justification: request.justification.clone(),
            datum: request.datum.clone(),
            consumer_ephemeral: consumer_key.clone(),
            owner_ephemeral: ephemeral.public(),
            consumer_identity: peer_card.expect("real exchange always has a card").public_key,
            owner_identity: ctx.private_key.public(),
        };
        // Sink failures are logged; the exchange itself stands.
        sinks.export(&record, conn).await;
    }

    Ok(ListenerOutcome { fake: false, transcript: Some(path) })
}
