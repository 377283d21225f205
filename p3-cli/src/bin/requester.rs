use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use p3::requester::RequesterContext;
use p3::{chatter, transcript};

/// Request one datum as the consumer side of the exchange protocol.
#[derive(Parser)]
#[command(name = "p3-requester")]
struct Args {
    /// SSOID of the data owner to connect to.
    #[arg(long)]
    ssoid: String,

    /// Justification for the data access.
    #[arg(long, default_value = "Requesting data")]
    justification: String,

    /// Which datum to request.
    #[arg(long, default_value = "No datum given")]
    datum: String,

    /// Port reserved for this node.
    #[arg(long, default_value_t = 41000)]
    port: u16,

    /// Run indistinguishable cover traffic alongside the real exchange.
    #[arg(long = "fakeChatter", default_value_t = false, action = clap::ArgAction::Set)]
    fake_chatter: bool,

    /// Directory transcripts are written to.
    #[arg(long = "storageDir", default_value = transcript::DEFAULT_STORAGE_DIR)]
    storage_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    p3_cli::init_tracing();
    let args = Args::parse();

    let ssoid = args.ssoid.trim().to_string();
    if ssoid.is_empty() {
        bail!("no SSOID provided");
    }
    if args.port < 1024 {
        bail!("the port must be at least 1024");
    }
    if !args.fake_chatter {
        eprintln!("[!] Fake chatter has been disabled");
    }

    let boot = p3_cli::bootstrap().await.context("could not load this node's identity")?;

    let ctx = RequesterContext {
        private_key: Arc::new(boot.private_key),
        signed_card: boot.signed_card,
        authority_key: boot.authority_key,
        target_ssoid: ssoid,
        justification: args.justification.trim().to_string(),
        datum: args.datum.trim().to_string(),
        storage_dir: args.storage_dir,
    };

    match chatter::run(ctx, args.port, args.fake_chatter).await {
        Some(outcome) => {
            tracing::info!(transcript = %outcome.transcript.display(), "exchange stored");
            println!("{}", outcome.plaintext);
            Ok(ExitCode::SUCCESS)
        }
        None => {
            tracing::error!("the exchange did not complete");
            Ok(ExitCode::FAILURE)
        }
    }
}
