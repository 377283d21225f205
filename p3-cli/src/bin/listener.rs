use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use p3::audit::{AuditSinks, ChainExporter};
use p3::listener::{self, ListenerContext};
use p3::password::PasswordPool;
use p3::{identity, net, transcript};
use tokio::net::TcpListener;

/// Environment variable naming the EVM node's JSON-RPC endpoint.
const GETH_ADDRESS_ENV: &str = "GETH_ADDRESS";

/// Environment variable naming the EVM node's keystore directory.
const GETH_KEYSTORE_ENV: &str = "GETH_KEYSTORE_DIR";

/// Serve data as the owner side of the exchange protocol.
#[derive(Parser)]
#[command(name = "p3-listener")]
struct Args {
    /// Port to listen on.
    #[arg(long, default_value_t = 40000)]
    port: u16,

    /// Print the SSOID associated with this listener.
    #[arg(long = "whoAmI", default_value_t = true)]
    who_am_i: bool,

    /// Directory transcripts are written to.
    #[arg(long = "storageDir", default_value = transcript::DEFAULT_STORAGE_DIR)]
    storage_dir: PathBuf,

    /// Path of the relational audit sink.
    #[arg(long = "auditDb", default_value = "./database.db")]
    audit_db: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    p3_cli::init_tracing();
    let args = Args::parse();
    if args.port < 1024 {
        bail!("the port must be at least 1024");
    }

    let boot = p3_cli::bootstrap().await.context("could not load this node's identity")?;

    if args.who_am_i {
        let ssoid = identity::own_ssoid(
            Path::new(identity::IDENTITY_FILE),
            &boot.private_key,
            &boot.authority_key,
        )?;
        println!("I am: {ssoid}");
    }

    // One derivation happens now so the first exchange does not wait.
    let pool = PasswordPool::prime().await?;

    let chain = match std::env::var(GETH_ADDRESS_ENV) {
        Ok(endpoint) if !endpoint.trim().is_empty() => {
            let keystore = std::env::var(GETH_KEYSTORE_ENV).ok().map(PathBuf::from);
            Some(ChainExporter::new(endpoint, keystore))
        }
        _ => None,
    };
    let sinks = AuditSinks { sqlite_path: args.audit_db.clone(), chain };

    let ctx = Arc::new(ListenerContext {
        private_key: Arc::new(boot.private_key),
        signed_card: boot.signed_card,
        authority_key: boot.authority_key,
        pool,
        storage_dir: args.storage_dir,
        audit: Some(Arc::new(sinks)),
    });

    let socket = TcpListener::bind(("0.0.0.0", args.port))
        .await
        .with_context(|| format!("could not bind port {}", args.port))?;
    let instance = format!("p3-{}", &ctx.private_key.public().pseudonym()?[..12]);
    let _announcement = net::announce(&instance, args.port)?;
    tracing::info!(port = args.port, %instance, "listening");

    let connections = AtomicU64::new(0);
    loop {
        let (stream, peer) = match socket.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::warn!(%err, "accept failed");
                continue;
            }
        };
        let conn = connections.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(conn, %peer, "accepted a stream");

        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            if let Err(err) = listener::handle_stream(&ctx, stream, conn).await {
                // Aborts stay silent towards the peer.
                tracing::error!(conn, %err, "exchange aborted");
            }
        });
    }
}
