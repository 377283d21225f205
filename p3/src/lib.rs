#![warn(missing_docs)]

//! Peer-to-peer inverse transparency exchange.
//!
//! A data consumer (requester) obtains a single datum from a data owner
//! (listener) while both sides accumulate mutually binding, non-repudiable
//! evidence that the exchange took place. The datum travels encrypted
//! under a key the owner only discloses gradually: after an identity
//! handshake, the owner streams a randomized number of decoy decryption
//! bundles, each of which the consumer must acknowledge with a signed
//! receipt, and signs the real bundle last. A consumer that stops
//! acknowledging never learns the key; an owner that never sends the real
//! bundle never obtains a receipt for it. The independent [`verifier`]
//! judges stored transcripts after the fact, including disputes where the
//! two parties disagree.
//!
//! Alongside the real exchange the requester can run cover traffic:
//! parallel decoy exchanges that are indistinguishable on the wire from
//! the real one (see [`chatter`]).

pub use crate::errors::{
    AuditError, AuthorityError, CryptoError, ExchangeError, StoreError, VerifyError,
};
pub use crate::identity::{IdentityCard, PeerIdentity};
pub use crate::keys::{PrivateKey, PublicKey};
pub use crate::messages::{Acknowledgement, DecryptionData, FirstMessage, MessageType};
pub use crate::wire::Envelope;

pub mod aead;
pub mod audit;
pub mod authority;
pub mod chatter;
pub mod errors;
pub mod identity;
pub mod keys;
pub mod listener;
pub mod messages;
pub mod net;
pub mod password;
pub mod requester;
pub mod requirement;
pub mod transcript;
pub mod util;
pub mod verifier;
pub mod wire;
