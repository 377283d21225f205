//! The cover-traffic driver.
//!
//! While the real exchange hunts for its target, a handful of fake nodes
//! run decoy exchanges with whatever peers they can reach. On the wire a
//! decoy is indistinguishable from the real thing: same envelopes, same
//! signature algorithm, same round count distribution, same bundle sizes.
//! An observer of N concurrent connections cannot tell which one was
//! real.
//!
//! Coordination runs over three capacity-1 latches (`realDone`,
//! `fakeDone`, `exchangeFailed` in spirit): the real exchange's completion
//! is authoritative, fake nodes then start rolling an increasingly loaded
//! termination die so the traffic tail is bounded but not deterministic.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use crate::keys::PublicKey;
use crate::requester::{self, RealOutcome, RequesterContext, StreamOutcome};
use crate::{net, util};

/// How many fake nodes the requester spawns.
pub const FAKE_NODE_COUNT: usize = 8;

/// Completed fake exchanges required before `fakeDone` fires.
pub const MIN_FAKE_CONNECTIONS: u32 = 5;

/// Per-iteration ramp of the termination probability, in percentage
/// points.
pub const TERMINATION_STEP: u32 = 5;

/// Hard bound on the cover-traffic tail after the real exchange is done.
pub const FAKE_TAIL: Duration = Duration::from_secs(15);

/// One discovery window of the real-exchange search.
pub const MAX_SEARCH_TIME: Duration = Duration::from_secs(90);

/// How many search windows may be restarted before giving up.
pub const MAX_RETRIES: u32 = 20;

// How long a fake node waits on discovery before re-checking its
// termination die.
const FAKE_POLL: Duration = Duration::from_secs(1);

/// Shared state of all cover-traffic tasks.
pub struct CoverTraffic {
    found_real: AtomicBool,
    termination_chance: AtomicU32,
    fake_connections: AtomicU32,
    fake_done: mpsc::Sender<()>,
}

impl CoverTraffic {
    /// Creates the shared state and the `fakeDone` latch.
    pub fn new() -> (Arc<CoverTraffic>, mpsc::Receiver<()>) {
        let (fake_done, rx) = mpsc::channel(1);
        let state = CoverTraffic {
            found_real: AtomicBool::new(false),
            termination_chance: AtomicU32::new(0),
            fake_connections: AtomicU32::new(0),
            fake_done,
        };
        (Arc::new(state), rx)
    }

    /// Marks the real exchange as finished, arming the termination die.
    pub fn mark_real_done(&self) {
        self.found_real.store(true, Ordering::SeqCst);
    }

    /// Counts one completed fake exchange; fires `fakeDone` once enough
    /// have happened.
    pub fn record_fake_connection(&self) {
        let count = self.fake_connections.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= MIN_FAKE_CONNECTIONS {
            let _ = self.fake_done.try_send(());
        }
    }

    /// Total completed fake exchanges so far.
    pub fn fake_connections(&self) -> u32 {
        self.fake_connections.load(Ordering::SeqCst)
    }

    /// Rolls the termination die. Before the real exchange completes this
    /// is always `false`; afterwards the odds ramp by
    /// [`TERMINATION_STEP`] on every roll.
    pub fn should_terminate(&self) -> bool {
        if !self.found_real.load(Ordering::SeqCst) {
            return false;
        }
        let chance =
            (self.termination_chance.fetch_add(TERMINATION_STEP, Ordering::SeqCst) + TERMINATION_STEP).min(100);
        let die = util::random_range(0, 101) as u32;
        if die < chance {
            let _ = self.fake_done.try_send(());
            return true;
        }
        false
    }
}

/// Spawns the fake nodes on random free ports.
pub fn spawn_fake_nodes(authority_key: PublicKey, state: Arc<CoverTraffic>, port_in_use: u16) {
    let mut ports = vec![port_in_use];
    for _ in 0..FAKE_NODE_COUNT {
        let port = net::random_free_port(&ports);
        ports.push(port);
        tokio::spawn(run_fake_node(authority_key.clone(), Arc::clone(&state), port));
    }
}

/// One fake node: holds a port, browses for peers and runs decoy
/// exchanges until the termination die says stop.
async fn run_fake_node(authority_key: PublicKey, state: Arc<CoverTraffic>, port: u16) {
    // The bound port is this node's network identity; nothing is served
    // on it.
    let _socket = match tokio::net::TcpListener::bind(("0.0.0.0", port)).await {
        Ok(socket) => socket,
        Err(_) => return,
    };
    let mut peers = match net::browse() {
        Ok(peers) => peers,
        Err(_) => return,
    };

    loop {
        if state.should_terminate() {
            return;
        }

        let peer = match timeout(FAKE_POLL, peers.recv()).await {
            Ok(Some(peer)) => peer,
            Ok(None) => return,
            Err(_) => continue,
        };

        let stream = match TcpStream::connect(peer).await {
            Ok(stream) => stream,
            Err(_) => continue,
        };

        // Decoy failures stay quiet; surfacing them would say which
        // connections were not the real one.
        match requester::fake_exchange(&authority_key, stream).await {
            Ok(()) => state.record_fake_connection(),
            Err(err) => tracing::debug!(%err, "fake exchange ended early"),
        }
    }
}

/// The real-exchange search: browse, dial, route, retry.
///
/// Sends the outcome on the `realDone` latch exactly once; `None` means
/// the retry budget ran out.
pub async fn run_real_search(
    ctx: Arc<RequesterContext>,
    state: Option<Arc<CoverTraffic>>,
    real_done: mpsc::Sender<Option<RealOutcome>>,
) {
    let fake_enabled = state.is_some();
    if fake_enabled {
        // Start at a random moment so the real connection is not always
        // the first one an observer sees.
        sleep(Duration::from_secs(util::random_range(2, 6) as u64)).await;
    }

    let mut resets: u32 = 0;
    'search: loop {
        let mut peers = match net::browse() {
            Ok(peers) => peers,
            Err(err) => {
                tracing::error!(%err, "could not start peer discovery");
                let _ = real_done.try_send(None);
                return;
            }
        };
        let window = sleep(MAX_SEARCH_TIME);
        tokio::pin!(window);

        loop {
            let peer = tokio::select! {
                _ = &mut window => {
                    if give_up(&mut resets, &real_done, "window expired") {
                        return;
                    }
                    continue 'search;
                }
                peer = peers.recv() => match peer {
                    Some(peer) => peer,
                    None => {
                        if give_up(&mut resets, &real_done, "discovery closed") {
                            return;
                        }
                        continue 'search;
                    }
                },
            };

            let stream = match TcpStream::connect(peer).await {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::info!(%peer, %err, "connection failed");
                    continue;
                }
            };

            match requester::handle_stream(&ctx, stream, fake_enabled).await {
                Ok(StreamOutcome::Completed(outcome)) => {
                    if let Some(state) = &state {
                        state.mark_real_done();
                    }
                    let _ = real_done.try_send(Some(outcome));
                    return;
                }
                Ok(StreamOutcome::NotTarget { chattered }) => {
                    tracing::debug!(%peer, chattered, "peer was not the target");
                }
                Err(err) => {
                    tracing::error!(%err, "exchange failed, restarting the search");
                    if give_up(&mut resets, &real_done, "exchange failed") {
                        return;
                    }
                    if fake_enabled {
                        // Back off briefly instead of hammering the network.
                        sleep(Duration::from_secs(2)).await;
                    }
                    continue 'search;
                }
            }
        }
    }
}

fn give_up(
    resets: &mut u32,
    real_done: &mpsc::Sender<Option<RealOutcome>>,
    reason: &str,
) -> bool {
    *resets += 1;
    if *resets >= MAX_RETRIES {
        tracing::error!(retries = *resets, "did not find the peer: {reason}");
        let _ = real_done.try_send(None);
        return true;
    }
    tracing::info!(restart = *resets, "restarting the search: {reason}");
    false
}

/// Runs the whole requester side: real search plus cover traffic, bounded
/// by the [`FAKE_TAIL`] after the real exchange settles.
pub async fn run(ctx: RequesterContext, port: u16, enable_fake: bool) -> Option<RealOutcome> {
    let ctx = Arc::new(ctx);
    let (real_done_tx, mut real_done_rx) = mpsc::channel(1);

    let (state, mut fake_done_rx) = CoverTraffic::new();
    if enable_fake {
        spawn_fake_nodes(ctx.authority_key.clone(), Arc::clone(&state), port);
    }

    tokio::spawn(run_real_search(
        Arc::clone(&ctx),
        enable_fake.then(|| Arc::clone(&state)),
        real_done_tx,
    ));

    let outcome = real_done_rx.recv().await.flatten();
    state.mark_real_done();

    if enable_fake {
        tokio::select! {
            _ = fake_done_rx.recv() => {}
            _ = sleep(FAKE_TAIL) => {
                tracing::info!("fewer than {MIN_FAKE_CONNECTIONS} fake exchanges, stopping after the tail");
            }
        }
        tracing::info!(fakes = state.fake_connections(), "cover traffic finished");
    }

    outcome
}
