//! Audit export: the usage-log payload and its two append-only sinks.
//!
//! Every real exchange leaves one relational row and one blockchain
//! transaction behind. Both carry the same payload: the two exchange
//! pseudonyms in the clear, and the justification and datum name
//! encrypted once for each party under that party's long-term key, so
//! only the two participants can read what was exchanged. Sink failures
//! never roll back a completed exchange.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task;
use tokio::time::sleep;

use crate::errors::AuditError;
use crate::keys::{PrivateKey, PublicKey};
use crate::util;

/// The SQLite table every row lands in.
pub const EXPORT_TABLE: &str = "exportTable";

/// Justification and datum name, readable only by one party.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UsageLogContent {
    /// OAEP ciphertext of the justification, hex.
    #[serde(rename = "explanation")]
    pub justification: String,
    /// OAEP ciphertext of the datum name, hex.
    pub datum: String,
    /// Unix seconds at export time.
    pub timestamp: i64,
}

/// The full audit payload, also used verbatim as the transaction input on
/// the chain sink.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockchainPayload {
    /// Ephemeral-key pseudonym of the data consumer.
    pub pseudonym_consumer: String,
    /// Ephemeral-key pseudonym of the data owner.
    pub pseudonym_owner: String,
    /// Log content encrypted for the consumer.
    pub encrypted_consumer: UsageLogContent,
    /// Log content encrypted for the owner.
    pub encrypted_owner: UsageLogContent,
}

/// What the listener knows about a finished exchange when exporting it.
#[derive(Clone, Debug)]
pub struct ExchangeRecord {
    /// Why the consumer asked.
    pub justification: String,
    /// What was asked for.
    pub datum: String,
    /// The consumer's per-exchange key (pseudonym source).
    pub consumer_ephemeral: PublicKey,
    /// The owner's per-exchange key (pseudonym source).
    pub owner_ephemeral: PublicKey,
    /// The consumer's long-term key (encryption target).
    pub consumer_identity: PublicKey,
    /// The owner's long-term key (encryption target).
    pub owner_identity: PublicKey,
}

/// Builds the payload: pseudonyms from the ephemeral keys, content
/// encrypted under each party's long-term key.
pub fn build_payload(record: &ExchangeRecord) -> Result<BlockchainPayload, AuditError> {
    let encrypt_for = |key: &PublicKey| -> Result<UsageLogContent, AuditError> {
        Ok(UsageLogContent {
            justification: key.oaep_encrypt(record.justification.as_bytes())?,
            datum: key.oaep_encrypt(record.datum.as_bytes())?,
            timestamp: Utc::now().timestamp(),
        })
    };

    Ok(BlockchainPayload {
        pseudonym_consumer: record.consumer_ephemeral.pseudonym()?,
        pseudonym_owner: record.owner_ephemeral.pseudonym()?,
        encrypted_consumer: encrypt_for(&record.consumer_identity)?,
        encrypted_owner: encrypt_for(&record.owner_identity)?,
    })
}

/// Decrypts one party's view of a stored log content. The query side of
/// the audit trail uses this; it is also what the tests round-trip.
pub fn decrypt_log_content(
    content: &UsageLogContent,
    key: &PrivateKey,
) -> Result<(String, String), AuditError> {
    let justification = key.oaep_decrypt(&content.justification)?;
    let datum = key.oaep_decrypt(&content.datum)?;
    Ok((
        String::from_utf8_lossy(&justification).into_owned(),
        String::from_utf8_lossy(&datum).into_owned(),
    ))
}

/// Appends one payload row to the relational sink, creating the table on
/// first use. Synchronous; call through `spawn_blocking` on async paths.
pub fn export_to_sqlite(db_path: &Path, payload: &BlockchainPayload) -> Result<(), AuditError> {
    let db = rusqlite::Connection::open(db_path)?;
    db.execute(
        "CREATE TABLE IF NOT EXISTS exportTable (
            PseudonymConsumer TEXT, PseudonymOwner TEXT,
            EncryptedConsumer TEXT, EncryptedOwner TEXT)",
        [],
    )?;
    db.execute(
        "INSERT INTO exportTable
            (PseudonymConsumer, PseudonymOwner, EncryptedConsumer, EncryptedOwner)
            VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![
            payload.pseudonym_consumer,
            payload.pseudonym_owner,
            serde_json::to_string(&payload.encrypted_consumer)?,
            serde_json::to_string(&payload.encrypted_owner)?,
        ],
    )?;
    Ok(())
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    params: serde_json::Value,
    jsonrpc: &'static str,
    method: &'a str,
    id: i64,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: serde_json::Value,
    #[serde(default)]
    error: Option<RpcErrorBody>,
    id: i64,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    message: String,
    code: i64,
}

/// The blockchain sink: an EVM-compatible node driven over JSON-RPC.
///
/// The whole export sequence mutates process-wide node state (accounts,
/// the miner, the keystore), so it runs under one global mutex and must
/// not race with itself.
pub struct ChainExporter {
    endpoint: String,
    client: reqwest::Client,
    lock: Mutex<()>,
    keystore_dir: Option<PathBuf>,
}

impl ChainExporter {
    /// Creates an exporter against `endpoint`. When `keystore_dir` is
    /// given, the throwaway account files are wiped after each export.
    pub fn new(endpoint: String, keystore_dir: Option<PathBuf>) -> ChainExporter {
        ChainExporter { endpoint, client: reqwest::Client::new(), lock: Mutex::new(()), keystore_dir }
    }

    /// Exports one payload: create and unlock a throwaway account, mine
    /// it some funds, send the payload as transaction input, mine the
    /// transaction in, then clean up.
    pub async fn export(&self, payload: &BlockchainPayload) -> Result<(), AuditError> {
        let _guard = self.lock.lock().await;

        let password = util::random_hex_string(64);
        let account = self
            .call("personal_newAccount", serde_json::json!([password]))
            .await?
            .as_str()
            .unwrap_or_default()
            .to_string();
        // Unlocking over RPC needs --allow-insecure-unlock on the node.
        self.call("personal_unlockAccount", serde_json::json!([account, password])).await?;

        // The throwaway account needs a mined balance before it may send.
        self.mine(&account, "eth_getBalance", serde_json::json!([account, "latest"]), |result| {
            result.as_str().is_some_and(|balance| balance != "0x0")
        })
        .await?;

        let input = format!("0x{}", hex::encode(serde_json::to_vec(payload)?));
        let transaction = serde_json::json!([{
            // From and to carry no meaning, the input field is the record.
            "from": account,
            "to": "0x0000000000000000000000000000000000000000",
            "input": input,
            "value": "0x1",
        }]);
        self.call("eth_sendTransaction", transaction).await?;

        self.mine(&account, "eth_pendingTransactions", serde_json::json!([]), |result| {
            result.as_array().is_some_and(|pending| pending.is_empty())
        })
        .await?;

        if let Some(dir) = &self.keystore_dir {
            wipe_keystore(dir)?;
        }
        Ok(())
    }

    /// Runs the miner until `done` holds for the polled method, bounded
    /// at one minute.
    async fn mine(
        &self,
        etherbase: &str,
        poll_method: &str,
        poll_params: serde_json::Value,
        done: impl Fn(&serde_json::Value) -> bool,
    ) -> Result<(), AuditError> {
        self.call("miner_setEtherbase", serde_json::json!([etherbase])).await?;
        self.call("miner_start", serde_json::json!([1])).await?;

        let poll = async {
            loop {
                let observed = self.call(poll_method, poll_params.clone()).await?;
                if done(&observed) {
                    return Ok::<(), AuditError>(());
                }
                sleep(Duration::from_millis(500)).await;
            }
        };
        let result = tokio::time::timeout(Duration::from_secs(60), poll).await;

        self.call("miner_stop", serde_json::json!([])).await?;
        match result {
            Ok(inner) => inner,
            Err(_) => Err(AuditError::Rpc { code: 0, message: "mining timed out".into() }),
        }
    }

    async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, AuditError> {
        let id = util::random_range(0, 2048) as i64;
        let request = RpcRequest { params, jsonrpc: "2.0", method, id };

        let response: RpcResponse =
            self.client.post(&self.endpoint).json(&request).send().await?.json().await?;

        if let Some(error) = response.error {
            return Err(AuditError::Rpc { code: error.code, message: error.message });
        }
        if response.id != id {
            return Err(AuditError::BadResponseId { got: response.id, expected: id });
        }
        if response.result.as_bool() == Some(false) {
            return Err(AuditError::Rpc { code: 0, message: format!("{method} returned false") });
        }
        Ok(response.result)
    }
}

fn wipe_keystore(dir: &Path) -> Result<(), AuditError> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            std::fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

/// The sinks a listener exports to after every real exchange.
pub struct AuditSinks {
    /// Path of the SQLite database file.
    pub sqlite_path: PathBuf,
    /// The chain exporter, when a node address is configured.
    pub chain: Option<ChainExporter>,
}

impl AuditSinks {
    /// Exports `record` to every configured sink, logging failures
    /// instead of propagating them.
    pub async fn export(&self, record: &ExchangeRecord, conn: u64) {
        let payload = match build_payload(record) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(conn, %err, "could not build the audit payload");
                return;
            }
        };

        let sqlite_path = self.sqlite_path.clone();
        let sqlite_payload = payload.clone();
        let result = task::spawn_blocking(move || export_to_sqlite(&sqlite_path, &sqlite_payload))
            .await
            .expect("sqlite export task panicked");
        match result {
            Ok(()) => tracing::info!(conn, "exchange exported to the relational sink"),
            Err(err) => tracing::error!(conn, %err, "relational export failed"),
        }

        if let Some(chain) = &self.chain {
            match chain.export(&payload).await {
                Ok(()) => tracing::info!(conn, "exchange exported to the chain sink"),
                Err(err) => tracing::error!(conn, %err, "chain export failed"),
            }
        }
    }
}
