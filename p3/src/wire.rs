//! Signed envelopes and their stream framing.
//!
//! A message on the wire is the canonical JSON of a signed envelope,
//! terminated by the closing brace of that JSON object; there is no other
//! framing. The reader consumes bytes up to and including the outer `}`,
//! first discarding a single leading line-feed left behind by the
//! transport. Every read is governed by a deadline.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::errors::ExchangeError;
use crate::keys::{PrivateKey, PublicKey};
use crate::messages::{FirstMessage, MessageType};

/// Default per-read deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Deadline for the identity-card exchange, which may wait on key loading
/// and signing at the peer.
pub const IDENTITY_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for the first response, which may wait on datum encryption at
/// the peer.
pub const FIRST_RESPONSE_TIMEOUT: Duration = Duration::from_secs(6);

// Envelopes hold at most a card or an ack of a first message, all far
// below this; anything larger is an attack or a framing bug.
const MAX_FRAME: usize = 1 << 20;

/// A signed message: canonical JSON payload bytes plus a PKCS#1 v1.5
/// SHA-256 signature over them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Canonical JSON of the payload.
    #[serde(with = "crate::util::base64_bytes")]
    pub content: Vec<u8>,
    /// Signature over `content`.
    #[serde(with = "crate::util::base64_bytes")]
    pub signature: Vec<u8>,
}

impl Envelope {
    /// Serializes `payload` and signs the bytes with `key`.
    pub fn seal<T: Serialize>(payload: &T, key: &PrivateKey) -> Result<Envelope, ExchangeError> {
        let content = serde_json::to_vec(payload)?;
        let signature = key.sign(&content)?;
        Ok(Envelope { content, signature })
    }

    /// Verifies the signature against `key`.
    pub fn verify(&self, key: &PublicKey) -> Result<(), ExchangeError> {
        key.verify(&self.content, &self.signature).map_err(ExchangeError::Signature)
    }

    /// Verifies the signature, then parses the content into `T`.
    pub fn open<T: DeserializeOwned>(&self, key: &PublicKey) -> Result<T, ExchangeError> {
        self.verify(key)?;
        self.open_unchecked()
    }

    /// Parses the content into `T` without checking the signature.
    pub fn open_unchecked<T: DeserializeOwned>(&self) -> Result<T, ExchangeError> {
        Ok(serde_json::from_slice(&self.content)?)
    }

    /// The canonical byte sequence acknowledgements echo back.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// The envelope variant used only for the identity exchange: a type tag
/// lets a fake exchange omit a real card.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaggedEnvelope {
    /// Authority-signed card JSON; empty for fake chatter.
    #[serde(with = "crate::util::base64_bytes")]
    pub content: Vec<u8>,
    /// Authority signature; empty for fake chatter.
    #[serde(with = "crate::util::base64_bytes")]
    pub signature: Vec<u8>,
    /// Whether this identity belongs to a real exchange.
    #[serde(rename = "type")]
    pub kind: MessageType,
}

/// Reads one framed JSON object within `deadline`.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    deadline: Duration,
) -> Result<Vec<u8>, ExchangeError> {
    let read = async {
        let mut buf = Vec::new();
        let mut first = true;
        loop {
            let byte = match reader.read_u8().await {
                Ok(byte) => byte,
                Err(err) => return Err(ExchangeError::Transport(err)),
            };
            if first && byte == b'\n' {
                // Stale framing artifact of the transport.
                first = false;
                continue;
            }
            first = false;
            buf.push(byte);
            if byte == b'}' {
                return Ok(buf);
            }
            if buf.len() > MAX_FRAME {
                return Err(ExchangeError::Protocol("frame exceeds maximum size".into()));
            }
        }
    };

    match timeout(deadline, read).await {
        Ok(result) => result,
        Err(_) => Err(ExchangeError::TimedOut(deadline)),
    }
}

/// Serializes and flushes one envelope, returning the bytes written so the
/// sender can match them against the peer's acknowledgement.
pub async fn send_envelope<W: AsyncWrite + Unpin>(
    writer: &mut W,
    envelope: &Envelope,
) -> Result<Vec<u8>, ExchangeError> {
    let bytes = envelope.canonical_bytes()?;
    writer.write_all(&bytes).await.map_err(ExchangeError::Transport)?;
    writer.flush().await.map_err(ExchangeError::Transport)?;
    Ok(bytes)
}

/// Seals `payload` with `key`, sends it, and returns the bytes written.
pub async fn send<T: Serialize, W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &T,
    key: &PrivateKey,
) -> Result<Vec<u8>, ExchangeError> {
    let envelope = Envelope::seal(payload, key)?;
    send_envelope(writer, &envelope).await
}

/// Reads one envelope within `deadline` without verifying anything.
pub async fn recv_envelope<R: AsyncRead + Unpin>(
    reader: &mut R,
    deadline: Duration,
) -> Result<Envelope, ExchangeError> {
    let frame = read_frame(reader, deadline).await?;
    Ok(serde_json::from_slice(&frame)?)
}

/// Reads one envelope, verifies its signature under `key` and parses the
/// content into `T`.
pub async fn recv<T: DeserializeOwned, R: AsyncRead + Unpin>(
    reader: &mut R,
    key: &PublicKey,
    deadline: Duration,
) -> Result<(Envelope, T), ExchangeError> {
    let envelope = recv_envelope(reader, deadline).await?;
    let payload = envelope.open(key)?;
    Ok((envelope, payload))
}

/// [`recv`] for the first incoming message. Passing `None` skips signature
/// verification: a fake peer's signature is over a throwaway key.
pub async fn recv_first_message<R: AsyncRead + Unpin>(
    reader: &mut R,
    verify_with: Option<&PublicKey>,
    deadline: Duration,
) -> Result<(Envelope, FirstMessage), ExchangeError> {
    let envelope = recv_envelope(reader, deadline).await?;
    let message = match verify_with {
        Some(key) => envelope.open(key)?,
        None => envelope.open_unchecked()?,
    };
    Ok((envelope, message))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::messages::Acknowledgement;
    use crate::test_helpers::test_key;

    #[tokio::test]
    async fn send_recv_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let key = test_key(0);

        let ack = Acknowledgement::new(b"previous envelope", 1);
        let sent = send(&mut a, &ack, key).await.unwrap();

        let (envelope, received): (Envelope, Acknowledgement) =
            recv(&mut b, &key.public(), DEFAULT_TIMEOUT).await.unwrap();
        assert_eq!(received, ack);
        assert_eq!(envelope.canonical_bytes().unwrap(), sent);
    }

    #[tokio::test]
    async fn leading_line_feed_is_discarded() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let key = test_key(0);

        a.write_all(b"\n").await.unwrap();
        send(&mut a, &Acknowledgement::new(b"x", 0), key).await.unwrap();

        let result: Result<(Envelope, Acknowledgement), _> =
            recv(&mut b, &key.public(), DEFAULT_TIMEOUT).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn wrong_key_is_a_signature_error() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        send(&mut a, &Acknowledgement::new(b"x", 0), test_key(0)).await.unwrap();

        let result: Result<(Envelope, Acknowledgement), _> =
            recv(&mut b, &test_key(1).public(), DEFAULT_TIMEOUT).await;
        assert_matches!(result, Err(ExchangeError::Signature(_)));
    }

    #[tokio::test]
    async fn garbage_is_a_parse_error() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        a.write_all(b"not json}").await.unwrap();

        let result = recv_envelope(&mut b, DEFAULT_TIMEOUT).await;
        assert_matches!(result, Err(ExchangeError::Parse(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out() {
        let (_a, mut b) = tokio::io::duplex(4096);
        let before = tokio::time::Instant::now();

        let result = read_frame(&mut b, DEFAULT_TIMEOUT).await;
        assert_matches!(result, Err(ExchangeError::TimedOut(_)));
        assert_eq!(before.elapsed(), DEFAULT_TIMEOUT);
    }

    #[tokio::test]
    async fn closed_stream_is_a_transport_error() {
        let (a, mut b) = tokio::io::duplex(4096);
        drop(a);

        let result = read_frame(&mut b, DEFAULT_TIMEOUT).await;
        assert_matches!(result, Err(ExchangeError::Transport(_)));
    }

    #[tokio::test]
    async fn fake_first_message_skips_verification() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let throwaway = test_key(1);
        let message = FirstMessage {
            datum: "abcd".into(),
            justification: "FakeChatter".into(),
            public_key: throwaway.public(),
            kind: MessageType::FakeChatter,
        };
        send(&mut a, &message, throwaway).await.unwrap();

        // No key given, so fake chatter skips the signature check.
        let (_, received) = recv_first_message(&mut b, None, DEFAULT_TIMEOUT).await.unwrap();
        assert_eq!(received, message);
    }
}
