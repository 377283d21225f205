//! Shared bootstrap for the three P3 binaries.

use std::io::{BufRead, Write};
use std::path::Path;

use anyhow::Result;
use p3::authority::{self, Credentials};
use p3::keys::{PrivateKey, PublicKey};
use p3::wire::Envelope;
use p3::{identity, AuthorityError};
use tracing_subscriber::EnvFilter;

/// Node identity loaded at startup.
pub struct Bootstrap {
    /// The identity authority's public key.
    pub authority_key: PublicKey,
    /// The node's long-term private key.
    pub private_key: PrivateKey,
    /// The pre-signed own identity card, ready to send.
    pub signed_card: Envelope,
}

/// Initialises logging; `RUST_LOG` overrides the default level.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
}

/// Fetches the authority key and loads (or registers) this node's
/// identity from the conventional file locations.
pub async fn bootstrap() -> Result<Bootstrap> {
    let authority_key = authority::fetch_public_key().await?;
    let private_key = authority::setup(
        Path::new(identity::KEY_FILE),
        Path::new(identity::IDENTITY_FILE),
        prompt_credentials,
    )
    .await?;
    let signed_card = identity::load_signed_card(Path::new(identity::IDENTITY_FILE), &private_key)?;
    Ok(Bootstrap { authority_key, private_key, signed_card })
}

/// Interactive credential fallback: `[u]sername` or `[t]oken`.
pub fn prompt_credentials() -> Result<Credentials, AuthorityError> {
    let choice = prompt_line("Authenticate with [u]sername or [t]oken? ")?;
    match choice.trim() {
        "u" | "U" => {
            let email = prompt_line("Email: ")?;
            let password = rpassword::prompt_password("Password: ")?;
            Ok(Credentials::Login { email: email.trim().to_string(), password })
        }
        "t" | "T" => {
            let token = rpassword::prompt_password("Token: ")?;
            Ok(Credentials::Token(token))
        }
        other => Err(AuthorityError::BadCard(format!("unknown authentication choice '{other}'"))),
    }
}

fn prompt_line(prompt: &str) -> Result<String, AuthorityError> {
    print!("{prompt}");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(line)
}
