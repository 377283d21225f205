//! Protocol message payloads.
//!
//! These types are dumb containers plus their syntactic validity checks;
//! protocol logic lives in the listener and requester state machines. All
//! of them travel as the `content` of a signed envelope.

use chrono::Utc;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::{CryptoError, ExchangeError};
use crate::keys::PublicKey;
use crate::{aead, password};

/// Who sent a message and whether the exchange is real.
///
/// A tagged enum in code, a small signed integer on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageType {
    /// An identity card belonging to a real exchange.
    RealExchange,
    /// A first message sent by the data consumer.
    Requester,
    /// A first message sent by the data owner.
    Listener,
    /// Marker used by the verifier for unparseable transcripts.
    Failure,
    /// Any message belonging to cover traffic.
    FakeChatter,
}

impl From<MessageType> for i8 {
    fn from(kind: MessageType) -> i8 {
        match kind {
            MessageType::RealExchange => 2,
            MessageType::Requester => 1,
            MessageType::Listener => 0,
            MessageType::Failure => -1,
            MessageType::FakeChatter => -2,
        }
    }
}

impl TryFrom<i8> for MessageType {
    type Error = i8;

    fn try_from(raw: i8) -> Result<Self, i8> {
        match raw {
            2 => Ok(MessageType::RealExchange),
            1 => Ok(MessageType::Requester),
            0 => Ok(MessageType::Listener),
            -1 => Ok(MessageType::Failure),
            -2 => Ok(MessageType::FakeChatter),
            other => Err(other),
        }
    }
}

impl Serialize for MessageType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i8(i8::from(*self))
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = i8::deserialize(deserializer)?;
        MessageType::try_from(raw).map_err(|v| D::Error::custom(format!("unknown message type {v}")))
    }
}

/// The datum request and the datum response share this shape.
///
/// On the request, `datum` names what is wanted; on the response it holds
/// the hex AES-GCM ciphertext of the requested datum. `public_key` is the
/// sender's ephemeral key that signs everything that follows.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FirstMessage {
    /// Datum name (request) or hex ciphertext (response).
    pub datum: String,
    /// Why the consumer wants the datum; empty on responses.
    #[serde(default)]
    pub justification: String,
    /// The sender's ephemeral public key.
    pub public_key: PublicKey,
    /// Sender role tag.
    #[serde(rename = "type")]
    pub kind: MessageType,
}

impl FirstMessage {
    /// Checks the fields every first message must carry.
    pub fn check(&self) -> Result<(), ExchangeError> {
        if self.datum.is_empty() {
            return Err(ExchangeError::Protocol("first message carries an empty datum".into()));
        }
        match self.kind {
            MessageType::Requester | MessageType::Listener | MessageType::FakeChatter => Ok(()),
            other => {
                Err(ExchangeError::Protocol(format!("invalid first message type {:?}", other)))
            }
        }
    }

    /// [`FirstMessage::check`] plus the non-empty justification a real
    /// datum request must carry.
    pub fn check_with_justification(&self) -> Result<(), ExchangeError> {
        self.check()?;
        if self.justification.trim().is_empty() {
            return Err(ExchangeError::Protocol("missing justification".into()));
        }
        Ok(())
    }
}

/// A receipt for one received envelope.
///
/// `content` holds the canonical bytes of the acknowledged envelope; the
/// acknowledger does not re-sign those bytes, the ack itself travels
/// inside a signed envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Acknowledgement {
    /// Canonical serialization of the envelope being acknowledged.
    #[serde(with = "crate::util::base64_bytes")]
    pub content: Vec<u8>,
    /// Position in the exchange, starting at 0.
    pub id: u64,
    /// Unix seconds at the acknowledger.
    #[serde(rename = "time_stamp")]
    pub timestamp: i64,
}

impl Acknowledgement {
    /// Builds the receipt for `acknowledged`, stamped with the current time.
    pub fn new(acknowledged: &[u8], id: u64) -> Acknowledgement {
        Acknowledgement { content: acknowledged.to_vec(), id, timestamp: Utc::now().timestamp() }
    }

    /// Validates id, timestamp monotonicity and the echoed bytes.
    pub fn check(
        &self,
        expected_id: u64,
        last_timestamp: i64,
        expected_content: &[u8],
    ) -> Result<(), ExchangeError> {
        let now = Utc::now().timestamp();

        if self.id != expected_id {
            return Err(ExchangeError::Protocol(format!(
                "invalid ack id: got {}, expected {}",
                self.id, expected_id
            )));
        }
        if self.timestamp < last_timestamp {
            return Err(ExchangeError::Protocol(format!(
                "ack timestamp {} is older than the previous one {}",
                self.timestamp, last_timestamp
            )));
        }
        if self.timestamp > now {
            return Err(ExchangeError::Protocol(format!(
                "ack timestamp {} is in the future (now {})",
                self.timestamp, now
            )));
        }
        if self.content != expected_content {
            return Err(ExchangeError::Protocol("ack does not echo the sent message".into()));
        }
        Ok(())
    }
}

/// A decryption bundle: everything needed to invert the datum ciphertext.
///
/// Decoy bundles and the real one are indistinguishable by construction;
/// only the last bundle the listener signs actually derives the key that
/// the ciphertext was sealed with.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct DecryptionData {
    /// The 32-byte plain password.
    #[serde(with = "crate::util::base64_bytes")]
    pub plain_password: Vec<u8>,
    /// The 22-byte transported salt.
    #[serde(with = "crate::util::base64_bytes")]
    pub salt: Vec<u8>,
    /// The 12-byte AES-GCM nonce.
    #[serde(with = "crate::util::base64_bytes")]
    pub nonce: Vec<u8>,
}

impl DecryptionData {
    /// Rejects any bundle whose field lengths are off, even by one.
    pub fn check_lengths(&self) -> Result<(), CryptoError> {
        for (field, actual, expected) in [
            ("plain_password", self.plain_password.len(), password::PLAIN_LEN),
            ("salt", self.salt.len(), password::SALT_LEN),
            ("nonce", self.nonce.len(), aead::NONCE_LEN),
        ] {
            if actual != expected {
                return Err(CryptoError::InvalidLength { field, expected, actual });
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for DecryptionData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DecryptionData([redacted])")
    }
}
