use std::io;
use std::time::Duration;

use thiserror::Error;

/// An error returned when a cryptographic primitive was misused or failed.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// A key, salt, nonce or password did not have its mandated length.
    #[error("invalid {field} length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Which field failed the length check.
        field: &'static str,
        /// The mandated length in bytes.
        expected: usize,
        /// The length that was actually supplied.
        actual: usize,
    },

    /// AES-GCM rejected the ciphertext (wrong key, wrong nonce or tampering).
    #[error("ciphertext could not be opened")]
    Aead,

    /// The decrypted bytes were not valid UTF-8.
    #[error("decrypted content is not valid UTF-8")]
    NotUtf8,

    /// An RSA operation failed.
    #[error("RSA operation failed")]
    Rsa(#[from] rsa::Error),

    /// A PKCS#1 key could not be encoded or decoded.
    #[error("malformed PKCS#1 key")]
    Pkcs1(#[from] rsa::pkcs1::Error),

    /// A SubjectPublicKeyInfo document could not be encoded or decoded.
    #[error("malformed public key document")]
    Spki(#[from] rsa::pkcs8::spki::Error),

    /// A hex field could not be decoded.
    #[error("invalid hex encoding")]
    Hex(#[from] hex::FromHexError),

    /// A base64 field could not be decoded.
    #[error("invalid base64 encoding")]
    Base64(#[from] base64::DecodeError),

    /// A key file could not be read or written.
    #[error("key file IO failed")]
    Io(#[from] io::Error),
}

/// An error terminating a single protocol exchange.
///
/// Except for [`ExchangeError::TimedOut`] in the requester's disclosure loop,
/// every variant is fatal to the exchange: the state machines recover
/// nothing, log the failure and free the stream.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// The peer sent no data within the per-read deadline.
    #[error("took too long to receive data, waited {}ms", .0.as_millis())]
    TimedOut(Duration),

    /// An envelope signature did not verify under the expected key.
    #[error("signature verification failed")]
    Signature(#[source] rsa::Error),

    /// A message could not be parsed into the expected shape.
    #[error("malformed message")]
    Parse(#[from] serde_json::Error),

    /// A cryptographic step failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// The peer violated the protocol (bad ack id, stale timestamp, ...).
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The peer's identity could not be established or did not match.
    #[error("identity check failed: {0}")]
    Identity(String),

    /// The underlying stream failed or closed.
    #[error("transport failure")]
    Transport(#[source] io::Error),
}

impl ExchangeError {
    /// Whether this error is a read deadline expiry.
    ///
    /// The requester's disclosure loop treats a timeout as the normal
    /// end-of-sequence signal rather than a failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ExchangeError::TimedOut(_))
    }
}

/// An error returned when a transcript could not be written or read back.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The transcript would contain no messages.
    #[error("refusing to store an empty exchange")]
    Empty,

    /// The file holds fewer envelopes than any valid transcript.
    #[error("transcript holds too few messages ({0})")]
    TooFewMessages(usize),

    /// The pseudonym in the filename does not match the stored key.
    #[error("filename pseudonym does not match the stored key")]
    PseudonymMismatch,

    /// The transcript JSON could not be read or written.
    #[error("malformed transcript")]
    Json(#[from] serde_json::Error),

    /// A filesystem operation failed.
    #[error("transcript IO failed")]
    Io(#[from] io::Error),

    /// A key could not be encoded for storage.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// An error produced while judging stored transcripts.
#[derive(Debug, Error)]
pub enum VerifyError {
    /// The transcript file could not be loaded.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A transcript held an unexpected number of trailing envelopes.
    #[error("expected {expected} trailing messages, got {actual}")]
    TrailingCount {
        /// How many envelopes the verify path requires.
        expected: usize,
        /// How many were present.
        actual: usize,
    },

    /// A signature in the transcript did not verify.
    #[error("could not verify the signature of message {index}")]
    Signature {
        /// Index of the offending envelope within the verified slice.
        index: usize,
    },

    /// An envelope's content could not be parsed.
    #[error("malformed stored message")]
    Parse(#[from] serde_json::Error),

    /// The identity card at the head of the transcript is unusable.
    #[error("identity card rejected: {0}")]
    Card(String),

    /// The first message failed its content checks.
    #[error("first message rejected: {0}")]
    FirstMessage(String),

    /// The stored decryption bundle does not invert the stored ciphertext.
    #[error("could not decrypt the recorded ciphertext")]
    Decrypt(#[source] CryptoError),

    /// A stored key could not be re-encoded for comparison.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// The two files do not describe the same exchange.
    #[error("files do not belong together: {0}")]
    Unrelated(String),
}

/// An error talking to the identity authority or managing local identity
/// files.
#[derive(Debug, Error)]
pub enum AuthorityError {
    /// `REVOLORI_ADDRESS` is unset or empty.
    #[error("REVOLORI_ADDRESS is not set")]
    NoAddress,

    /// The authority rejected the request.
    #[error("authority answered {status}: {body}")]
    Rejected {
        /// HTTP status code of the response.
        status: u16,
        /// Response body, for the operator's log.
        body: String,
    },

    /// The HTTP round trip failed.
    #[error("could not reach the authority")]
    Http(#[from] reqwest::Error),

    /// A response or stored card could not be parsed.
    #[error("malformed authority payload")]
    Json(#[from] serde_json::Error),

    /// The stored identity card did not pass verification.
    #[error("stored identity card rejected: {0}")]
    BadCard(String),

    /// Key or card files could not be read or written.
    #[error("identity file IO failed")]
    Io(#[from] io::Error),

    /// Key material could not be generated or encoded.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// An error exporting an exchange to an audit sink.
///
/// Export failures are logged by the listener and never roll back the
/// completed exchange.
#[derive(Debug, Error)]
pub enum AuditError {
    /// The relational sink rejected the row.
    #[error("relational export failed")]
    Sql(#[from] rusqlite::Error),

    /// The blockchain node could not be reached.
    #[error("could not reach the chain node")]
    Http(#[from] reqwest::Error),

    /// The chain node answered with a JSON-RPC error object.
    #[error("chain node returned error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code.
        code: i64,
        /// JSON-RPC error message.
        message: String,
    },

    /// The chain node's response did not match the request.
    #[error("chain node response id {got} does not match request id {expected}")]
    BadResponseId {
        /// The id the node echoed back.
        got: i64,
        /// The id that was sent.
        expected: i64,
    },

    /// A payload field could not be encrypted or serialized.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Payload serialization failed.
    #[error("malformed audit payload")]
    Json(#[from] serde_json::Error),

    /// A keystore cleanup operation failed.
    #[error("keystore cleanup failed")]
    Io(#[from] io::Error),
}
