//! Dispute-mode scenarios against real transcripts.

mod common;

use std::path::{Path, PathBuf};

use common::*;
use p3::verifier::{solve_dispute, Judgment};
use p3::{listener, requester, transcript};

/// Runs one complete exchange and returns the two transcript paths
/// (listener's, requester's).
async fn run_exchange(
    listener_ssoid: &str,
    listener_key: usize,
    listener_dir: &Path,
    requester_dir: &Path,
) -> (PathBuf, PathBuf) {
    let lctx = listener_ctx(listener_ssoid, listener_key, listener_dir).await;
    let rctx = requester_ctx(listener_ssoid, requester_dir);

    let (listener_stream, requester_stream) = tokio::io::duplex(64 * 1024);
    let (listener_result, requester_result) = tokio::join!(
        listener::handle_stream(&lctx, listener_stream, 1),
        requester::handle_stream(&rctx, requester_stream, false),
    );

    let listener_path = listener_result.unwrap().transcript.unwrap();
    let requester_path = match requester_result.unwrap() {
        requester::StreamOutcome::Completed(outcome) => outcome.transcript,
        other => panic!("unexpected outcome {other:?}"),
    };
    (listener_path, requester_path)
}

/// Copies a transcript into `dir` with the trailing envelope's content
/// truncated, keeping the filename (and with it the pseudonym check)
/// intact.
fn truncate_last_envelope(path: &Path, dir: &Path) -> PathBuf {
    let mut exchange = transcript::load(path).unwrap();
    let last = exchange.messages.last_mut().unwrap();
    last.content.truncate(last.content.len() / 2);

    let target = dir.join(path.file_name().unwrap());
    std::fs::write(&target, serde_json::to_vec(&exchange).unwrap()).unwrap();
    target
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tampered_requester_file_loses_the_dispute() {
    let listener_dir = tempfile::tempdir().unwrap();
    let requester_dir = tempfile::tempdir().unwrap();
    let tampered_dir = tempfile::tempdir().unwrap();

    let (listener_path, requester_path) =
        run_exchange("alice@x", LISTENER, listener_dir.path(), requester_dir.path()).await;
    let tampered = truncate_last_envelope(&requester_path, tampered_dir.path());

    let authority = test_key(AUTHORITY).public();

    // The holder of the intact file wins regardless of order; the exit
    // code names the first file's fate.
    let outcome = solve_dispute(&tampered, &listener_path, &authority);
    assert_eq!(outcome.judgment, Judgment::Success);
    let (first, second) = outcome.reports.unwrap();
    assert!(first.outcome.is_err());
    assert_eq!(second.outcome.unwrap(), "Requested datum: Q3");

    let outcome = solve_dispute(&listener_path, &tampered, &authority);
    assert_eq!(outcome.judgment, Judgment::Failure);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unrelated_transcripts_cannot_be_judged() {
    let dirs: Vec<_> = (0..4).map(|_| tempfile::tempdir().unwrap()).collect();

    let (first_listener, _) =
        run_exchange("alice@x", LISTENER, dirs[0].path(), dirs[1].path()).await;
    let (_, second_requester) =
        run_exchange("bob@x", OTHER_LISTENER, dirs[2].path(), dirs[3].path()).await;

    let authority = test_key(AUTHORITY).public();
    let outcome = solve_dispute(&first_listener, &second_requester, &authority);
    assert_eq!(outcome.judgment, Judgment::NotPossible);
    assert!(outcome.reports.is_none());
    assert!(outcome.summary.contains("pseudonyms"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_tampered_files_cannot_be_judged() {
    let listener_dir = tempfile::tempdir().unwrap();
    let requester_dir = tempfile::tempdir().unwrap();
    let tampered_a = tempfile::tempdir().unwrap();
    let tampered_b = tempfile::tempdir().unwrap();

    let (listener_path, requester_path) =
        run_exchange("alice@x", LISTENER, listener_dir.path(), requester_dir.path()).await;

    let bad_listener = truncate_last_envelope(&listener_path, tampered_a.path());
    let bad_requester = truncate_last_envelope(&requester_path, tampered_b.path());

    let outcome =
        solve_dispute(&bad_requester, &bad_listener, &test_key(AUTHORITY).public());
    assert_eq!(outcome.judgment, Judgment::NotPossible);
}
