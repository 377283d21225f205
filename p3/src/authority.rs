//! Client for the identity authority ("Revolori").
//!
//! The authority is a black box with two endpoints: `GET /key/show`
//! serves its public key, `POST /key/sign` signs an identity card for a
//! public key, authenticated either with login credentials or a token
//! cookie. The signed response body is stored verbatim on disk; nothing
//! else about the authority is assumed.

use std::env;
use std::fs;
use std::path::Path;

use tokio::task;

use crate::errors::AuthorityError;
use crate::keys::{PrivateKey, PublicKey};

/// Environment variable naming the authority's base URL.
pub const ADDRESS_ENV: &str = "REVOLORI_ADDRESS";

/// Environment variable holding a signing token.
pub const TOKEN_ENV: &str = "REVOLORI_TOKEN";

/// Environment variable holding the login user name.
pub const USERNAME_ENV: &str = "REVOLORI_USERNAME";

/// Environment variable holding the login password.
pub const PASSWORD_ENV: &str = "REVOLORI_PASSWORD";

/// How a card-signing request authenticates itself.
#[derive(Clone)]
pub enum Credentials {
    /// A pre-issued token, sent as a cookie.
    Token(String),
    /// Interactive login credentials, sent in the body.
    Login {
        /// The account's email address.
        email: String,
        /// The account's password.
        password: String,
    },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Token(_) => f.write_str("Credentials::Token([redacted])"),
            Credentials::Login { email, .. } => {
                write!(f, "Credentials::Login({email}, [redacted])")
            }
        }
    }
}

/// Reads credentials from the environment, preferring a token.
pub fn credentials_from_env() -> Option<Credentials> {
    if let Ok(token) = env::var(TOKEN_ENV) {
        if !token.trim().is_empty() {
            return Some(Credentials::Token(token));
        }
    }
    match (env::var(USERNAME_ENV), env::var(PASSWORD_ENV)) {
        (Ok(email), Ok(password)) if !email.trim().is_empty() => {
            Some(Credentials::Login { email, password })
        }
        _ => None,
    }
}

fn base_address() -> Result<String, AuthorityError> {
    match env::var(ADDRESS_ENV) {
        Ok(address) if !address.trim().is_empty() => Ok(address.trim().trim_end_matches('/').to_string()),
        _ => Err(AuthorityError::NoAddress),
    }
}

/// Fetches the authority's public key from `GET /key/show`.
pub async fn fetch_public_key() -> Result<PublicKey, AuthorityError> {
    let url = format!("{}/key/show", base_address()?);
    let body = reqwest::get(&url).await?.error_for_status()?.bytes().await?;
    Ok(serde_json::from_slice(&body)?)
}

/// Loads the node's key material, registering with the authority when the
/// node runs for the first time.
///
/// `fallback` supplies credentials when the environment has none; it is
/// only invoked if registration is actually needed. Any failure along the
/// way removes both files so the next run starts clean.
pub async fn setup<F>(
    key_path: &Path,
    identity_path: &Path,
    fallback: F,
) -> Result<PrivateKey, AuthorityError>
where
    F: FnOnce() -> Result<Credentials, AuthorityError>,
{
    if key_path.exists() {
        tracing::info!(path = %key_path.display(), "loading the existing key file");
        let key = match PrivateKey::load(key_path) {
            Ok(key) => key,
            Err(err) => {
                clean_up(key_path, identity_path);
                return Err(err.into());
            }
        };
        if !identity_path.exists() {
            clean_up(key_path, identity_path);
            return Err(AuthorityError::BadCard(
                "a key exists but its identity card is missing".into(),
            ));
        }
        return Ok(key);
    }

    let result = register(key_path, identity_path, fallback).await;
    if result.is_err() {
        clean_up(key_path, identity_path);
    }
    result
}

async fn register<F>(
    key_path: &Path,
    identity_path: &Path,
    fallback: F,
) -> Result<PrivateKey, AuthorityError>
where
    F: FnOnce() -> Result<Credentials, AuthorityError>,
{
    tracing::info!("creating a new key and requesting an identity card");
    let key = task::spawn_blocking(PrivateKey::generate).await.expect("keygen task panicked")?;
    key.save(key_path)?;

    let credentials = match credentials_from_env() {
        Some(credentials) => credentials,
        None => fallback()?,
    };

    let url = format!("{}/key/sign", base_address()?);
    let client = reqwest::Client::new();
    let request = match &credentials {
        Credentials::Token(token) => client
            .post(&url)
            .header(reqwest::header::COOKIE, format!("token={token}"))
            .json(&serde_json::json!({ "publicKey": key.public() })),
        Credentials::Login { email, password } => client.post(&url).json(&serde_json::json!({
            "email": email,
            "password": password,
            "publicKey": key.public(),
        })),
    };

    let response = request.send().await?;
    let status = response.status();
    let body = response.bytes().await?;
    if !status.is_success() {
        return Err(AuthorityError::Rejected {
            status: status.as_u16(),
            body: String::from_utf8_lossy(&body).into_owned(),
        });
    }

    // The signed card is stored exactly as the authority sent it.
    fs::write(identity_path, &body)?;
    Ok(key)
}

fn clean_up(key_path: &Path, identity_path: &Path) {
    let _ = fs::remove_file(key_path);
    let _ = fs::remove_file(identity_path);
}
