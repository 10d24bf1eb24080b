//! Vote receiver error taxonomy.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure classification used in logs, failure records and v2 error replies.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Malformed or undecryptable payload.
    Decode,
    /// Unknown token identity or signature mismatch.
    Auth,
    /// Challenge mismatch or reuse.
    Replay,
    /// Missing or invalid peer/key configuration.
    Config,
    /// Connect, read, write or timeout failure.
    Transport,
    /// Corrupt or unloadable key material.
    KeyMaterial,
}

impl ErrorKind {
    /// Stable name written to failure records.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Decode => "DecodeError",
            Self::Auth => "AuthError",
            Self::Replay => "ReplayError",
            Self::Config => "ConfigError",
            Self::Transport => "TransportError",
            Self::KeyMaterial => "KeyMaterialError",
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while decoding, authenticating or relaying a vote.
#[derive(Debug, Error)]
pub enum VoteError {
    /// Payload could not be decrypted or parsed.
    #[error("decode error: {0}")]
    Decode(String),
    /// Token identity unknown or signature invalid.
    #[error("authentication failed: {0}")]
    Auth(String),
    /// Echoed challenge does not match the one issued for this session.
    #[error("challenge mismatch or reuse")]
    Replay,
    /// Configuration is missing or invalid.
    #[error("configuration error: {0}")]
    Config(String),
    /// Socket-level failure.
    #[error("transport error: {0}")]
    Transport(String),
    /// Key material is corrupt or cannot be produced.
    #[error("key material error: {0}")]
    KeyMaterial(String),
}

impl VoteError {
    /// Returns the classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Decode(_) => ErrorKind::Decode,
            Self::Auth(_) => ErrorKind::Auth,
            Self::Replay => ErrorKind::Replay,
            Self::Config(_) => ErrorKind::Config,
            Self::Transport(_) => ErrorKind::Transport,
            Self::KeyMaterial(_) => ErrorKind::KeyMaterial,
        }
    }
}

impl From<std::io::Error> for VoteError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
