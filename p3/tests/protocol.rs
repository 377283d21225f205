//! End-to-end protocol runs over in-memory streams.

mod common;

use assert_matches::assert_matches;
use common::*;
use p3::errors::ExchangeError;
use p3::listener::{self, ListenerError};
use p3::messages::{Acknowledgement, DecryptionData, FirstMessage, MessageType};
use p3::requester::{self, StreamOutcome};
use p3::wire::{self, Envelope};
use p3::{transcript, verifier};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn happy_path_produces_matching_transcripts() {
    let listener_dir = tempfile::tempdir().unwrap();
    let requester_dir = tempfile::tempdir().unwrap();

    let lctx = listener_ctx("alice@x", LISTENER, listener_dir.path()).await;
    let rctx = requester_ctx("alice@x", requester_dir.path());

    let (listener_stream, requester_stream) = tokio::io::duplex(64 * 1024);
    let (listener_result, requester_result) = tokio::join!(
        listener::handle_stream(&lctx, listener_stream, 1),
        requester::handle_stream(&rctx, requester_stream, false),
    );

    let listener_outcome = listener_result.expect("listener side failed");
    assert!(!listener_outcome.fake);
    let listener_path = listener_outcome.transcript.expect("listener stored no transcript");

    let requester_outcome = match requester_result.expect("requester side failed") {
        StreamOutcome::Completed(outcome) => outcome,
        other => panic!("unexpected outcome {other:?}"),
    };
    assert_eq!(requester_outcome.plaintext, "Requested datum: Q3");

    // The listener holds four envelopes, the requester three.
    assert_eq!(transcript::load(&listener_path).unwrap().messages.len(), 4);
    assert_eq!(transcript::load(&requester_outcome.transcript).unwrap().messages.len(), 3);

    // Success mode reproduces the plaintext from either transcript alone.
    let authority = test_key(AUTHORITY).public();
    let from_listener = verifier::verify_success(&listener_path, &authority).unwrap();
    assert_eq!(from_listener.storer, verifier::Role::Listener);
    assert_eq!(from_listener.peer_ssoid, "carol@x");
    assert_eq!(from_listener.decrypted, "Requested datum: Q3");

    let from_requester =
        verifier::verify_success(&requester_outcome.transcript, &authority).unwrap();
    assert_eq!(from_requester.storer, verifier::Role::Requester);
    assert_eq!(from_requester.peer_ssoid, "alice@x");
    assert_eq!(from_requester.decrypted, "Requested datum: Q3");

    // Dispute mode agrees in either file order.
    let dispute =
        verifier::solve_dispute(&listener_path, &requester_outcome.transcript, &authority);
    assert_eq!(dispute.judgment, verifier::Judgment::Success);

    let dispute =
        verifier::solve_dispute(&requester_outcome.transcript, &listener_path, &authority);
    assert_eq!(dispute.judgment, verifier::Judgment::Success);
    let (first, second) = dispute.reports.unwrap();
    assert_eq!(first.outcome.unwrap(), second.outcome.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wrong_peer_is_not_engaged() {
    let listener_dir = tempfile::tempdir().unwrap();
    let requester_dir = tempfile::tempdir().unwrap();

    let lctx = listener_ctx("bob@x", LISTENER, listener_dir.path()).await;
    let rctx = requester_ctx("alice@x", requester_dir.path());

    let (listener_stream, requester_stream) = tokio::io::duplex(64 * 1024);
    let (listener_result, requester_result) = tokio::join!(
        listener::handle_stream(&lctx, listener_stream, 1),
        requester::handle_stream(&rctx, requester_stream, false),
    );

    assert_matches!(requester_result.unwrap(), StreamOutcome::NotTarget { chattered: false });
    // The requester hung up, so the listener never got a card.
    assert!(listener_result.is_err());
    assert_eq!(std::fs::read_dir(listener_dir.path()).unwrap().count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fake_chatter_leaves_no_trace() {
    let listener_dir = tempfile::tempdir().unwrap();
    let lctx = listener_ctx("bob@x", LISTENER, listener_dir.path()).await;

    let (listener_stream, requester_stream) = tokio::io::duplex(64 * 1024);
    let authority_public = test_key(AUTHORITY).public();
    let (listener_result, fake_result) = tokio::join!(
        listener::handle_stream(&lctx, listener_stream, 1),
        requester::fake_exchange(&authority_public, requester_stream),
    );

    fake_result.expect("fake exchange failed");
    let outcome = listener_result.expect("listener side failed");
    assert!(outcome.fake);
    assert!(outcome.transcript.is_none());
    assert_eq!(std::fs::read_dir(listener_dir.path()).unwrap().count(), 0);
}

/// Drives the consumer side by hand up to the disclosure loop, then hands
/// control to `script`.
async fn scripted_consumer<S, F, Fut>(stream: S, script: F)
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnOnce(ScriptedLoop<S>) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);

    // Identity handshake.
    let _listener_card = wire::recv_envelope(&mut reader, wire::IDENTITY_TIMEOUT).await.unwrap();
    wire::send_envelope(&mut writer, &signed_card("carol@x", test_key(REQUESTER))).await.unwrap();

    // Datum request signed with the long-term key.
    let ephemeral = test_key(SCRIPTED_EPHEMERAL);
    let request = FirstMessage {
        datum: "Q3".into(),
        justification: "audit".into(),
        public_key: ephemeral.public(),
        kind: MessageType::Requester,
    };
    wire::send(&mut writer, &request, test_key(REQUESTER)).await.unwrap();

    // First response and its receipt.
    let (response_envelope, response): (Envelope, FirstMessage) =
        wire::recv(&mut reader, &test_key(LISTENER).public(), wire::FIRST_RESPONSE_TIMEOUT)
            .await
            .unwrap();
    let ack = Acknowledgement::new(&response_envelope.canonical_bytes().unwrap(), 0);
    wire::send(&mut writer, &ack, ephemeral).await.unwrap();

    script(ScriptedLoop { reader, writer, owner_key: response.public_key }).await;
}

struct ScriptedLoop<S: AsyncRead + AsyncWrite> {
    reader: BufReader<tokio::io::ReadHalf<S>>,
    writer: tokio::io::WriteHalf<S>,
    owner_key: p3::keys::PublicKey,
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn consumer_that_stops_acknowledging_gets_nothing() {
    let listener_dir = tempfile::tempdir().unwrap();
    let lctx = listener_ctx("alice@x", LISTENER, listener_dir.path()).await;

    let (listener_stream, consumer_stream) = tokio::io::duplex(64 * 1024);
    let consumer = scripted_consumer(consumer_stream, |mut s| async move {
        // Acknowledge nine decoys, then go silent while holding the
        // stream open.
        for id in 1u64..=9 {
            let (envelope, _): (Envelope, DecryptionData) =
                wire::recv(&mut s.reader, &s.owner_key, wire::DEFAULT_TIMEOUT).await.unwrap();
            let ack = Acknowledgement::new(&envelope.canonical_bytes().unwrap(), id);
            wire::send(&mut s.writer, &ack, test_key(SCRIPTED_EPHEMERAL)).await.unwrap();
        }
        tokio::time::sleep(wire::DEFAULT_TIMEOUT * 2).await;
    });

    let (listener_result, ()) =
        tokio::join!(listener::handle_stream(&lctx, listener_stream, 1), consumer);

    assert_matches!(listener_result, Err(ListenerError::Exchange(ExchangeError::TimedOut(_))));
    assert_eq!(std::fs::read_dir(listener_dir.path()).unwrap().count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn replayed_acknowledgement_aborts_the_exchange() {
    let listener_dir = tempfile::tempdir().unwrap();
    let lctx = listener_ctx("alice@x", LISTENER, listener_dir.path()).await;

    let (listener_stream, consumer_stream) = tokio::io::duplex(64 * 1024);
    let consumer = scripted_consumer(consumer_stream, |mut s| async move {
        let mut previous_ack: Option<Acknowledgement> = None;
        for id in 1u64..=4 {
            let (envelope, _): (Envelope, DecryptionData) =
                wire::recv(&mut s.reader, &s.owner_key, wire::DEFAULT_TIMEOUT).await.unwrap();
            let ack = Acknowledgement::new(&envelope.canonical_bytes().unwrap(), id);
            let replay = if id == 4 {
                // Resend the previous receipt instead of the fourth one.
                previous_ack.clone().unwrap()
            } else {
                ack.clone()
            };
            wire::send(&mut s.writer, &replay, test_key(SCRIPTED_EPHEMERAL)).await.unwrap();
            previous_ack = Some(ack);
        }
    });

    let (listener_result, ()) =
        tokio::join!(listener::handle_stream(&lctx, listener_stream, 1), consumer);

    assert_matches!(listener_result, Err(ListenerError::Exchange(ExchangeError::Protocol(_))));
    assert_eq!(std::fs::read_dir(listener_dir.path()).unwrap().count(), 0);
}
