//! Protocol primitives for a dual-protocol Votifier receiver.
//!
//! This crate has no async runtime: codecs, key handling, the offline queue and
//! the host-facing traits live here, while sockets and timers belong to the
//! daemon.

pub mod error;
pub mod keys;
pub mod legacy;
pub mod peer;
pub mod queue;
pub mod sink;
pub mod token;
pub mod vote;

pub use error::{ErrorKind, VoteError};
pub use keys::{
    DEFAULT_KEY_BITS, DEFAULT_TOKEN_ID, InboundTokens, KeyLoad, KeyPair, PemKeyPair,
    RegenerationReason, StoredKeyMaterial, TokenKey, TokenLoad, load_inbound_tokens,
    load_or_generate_key_pair, new_token,
};
pub use peer::{PeerCredential, PeerTarget};
pub use queue::{OfflineQueue, Routing};
pub use sink::{DeliverySink, ReceiverContext, StaticContext};
pub use token::{Challenge, FRAME_MAGIC, Greeting, TokenResponse, TokenSession};
pub use vote::Vote;
