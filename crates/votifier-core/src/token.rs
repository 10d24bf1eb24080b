//! Token (v2) vote codec: challenge/response authenticated by HMAC-SHA256.
//!
//! ```text
//! server: VOTIFIER 2 <challenge>\n
//! client: 0x73 0x3A | u16 big-endian length | {"payload": "<json>", "signature": "<base64>"}
//! server: {"status":"ok"}\r\n  or  {"status":"error","cause":..,"error":..}\r\n
//! ```
//!
//! The inner payload is itself JSON carrying the vote fields and the echoed
//! challenge. The signature covers the exact payload string bytes.

use std::fmt::{Display, Formatter};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::VoteError;
use crate::keys::{InboundTokens, TokenKey};
use crate::vote::Vote;

/// Leading bytes of a v2 frame (`"s:"`).
pub const FRAME_MAGIC: [u8; 2] = [0x73, 0x3A];

/// Largest message that fits the `u16` length prefix.
pub const MAX_MESSAGE_LEN: usize = u16::MAX as usize;

/// First word of every server greeting.
pub const GREETING_PREFIX: &str = "VOTIFIER";

/// Version word announced by token-capable receivers.
pub const TOKEN_PROTOCOL_VERSION: &str = "2";

/// Server greeting line.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Greeting {
    /// Announced version.
    pub version: String,
    /// Challenge, present only on token-capable receivers.
    pub challenge: Option<String>,
}

impl Greeting {
    /// Greeting of a receiver that only speaks v1.
    #[must_use]
    pub fn legacy(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            challenge: None,
        }
    }

    /// Greeting carrying a v2 challenge.
    #[must_use]
    pub fn token(challenge: &Challenge) -> Self {
        Self {
            version: TOKEN_PROTOCOL_VERSION.to_owned(),
            challenge: Some(challenge.as_str().to_owned()),
        }
    }

    /// Wire form including the trailing newline.
    #[must_use]
    pub fn render(&self) -> String {
        match &self.challenge {
            Some(challenge) => format!("{GREETING_PREFIX} {} {challenge}\n", self.version),
            None => format!("{GREETING_PREFIX} {}\n", self.version),
        }
    }

    /// Parses a greeting line, with or without its line terminator.
    pub fn parse(line: &str) -> Result<Self, VoteError> {
        let mut words = line.split_whitespace();
        if words.next() != Some(GREETING_PREFIX) {
            return Err(VoteError::Transport(format!(
                "unexpected greeting `{}`",
                line.trim_end()
            )));
        }
        let version = words
            .next()
            .ok_or_else(|| VoteError::Transport("greeting without version".to_owned()))?
            .to_owned();
        let challenge = words.next().map(str::to_owned);
        Ok(Self { version, challenge })
    }
}

/// Single-use random value issued per v2 session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Challenge(String);

impl Challenge {
    /// 16 random bytes as 32 lower-case hex characters.
    #[must_use]
    pub fn generate() -> Self {
        let mut raw = [0_u8; 16];
        rand::rng().fill_bytes(&mut raw);
        Self(hex::encode(raw))
    }

    /// Challenge text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn matches(&self, echoed: &str) -> bool {
        bool::from(self.0.as_bytes().ct_eq(echoed.as_bytes()))
    }
}

impl From<&str> for Challenge {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl Display for Challenge {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outer JSON object of a v2 message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignedEnvelope {
    /// Inner JSON, signed verbatim.
    pub payload: String,
    /// Base64 HMAC-SHA256 of `payload`.
    pub signature: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VotePayload {
    service_name: String,
    username: String,
    #[serde(default)]
    address: String,
    timestamp: serde_json::Value,
    challenge: String,
}

/// Base64 HMAC-SHA256 of `payload` under `key`.
#[must_use]
pub fn sign(payload: &[u8], key: &TokenKey) -> String {
    STANDARD.encode(hmac_digest(payload, key))
}

fn hmac_digest(payload: &[u8], key: &TokenKey) -> [u8; 32] {
    // HMAC accepts keys of any length, so this cannot fail.
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(key.as_bytes()) else {
        return [0_u8; 32];
    };
    mac.update(payload);
    let digest = mac.finalize().into_bytes();
    let mut out = [0_u8; 32];
    out.copy_from_slice(&digest[..32]);
    out
}

fn signature_matches(payload: &[u8], signature: &str, key: &TokenKey) -> bool {
    let Ok(supplied) = STANDARD.decode(signature.trim()) else {
        return false;
    };
    let expected = hmac_digest(payload, key);
    bool::from(supplied.as_slice().ct_eq(&expected))
}

/// Builds the signed JSON message for `vote`, echoing `challenge`.
pub fn encode_message(vote: &Vote, challenge: &str, key: &TokenKey) -> Result<Vec<u8>, VoteError> {
    // Numbers only when the text is canonical; "0123" stays a string.
    let timestamp = match vote.timestamp().parse::<i64>() {
        Ok(n) if n.to_string() == vote.timestamp() => serde_json::Value::from(n),
        _ => serde_json::Value::String(vote.timestamp().to_owned()),
    };
    let payload = VotePayload {
        service_name: vote.service_name().to_owned(),
        username: vote.username().to_owned(),
        address: vote.address().to_owned(),
        timestamp,
        challenge: challenge.to_owned(),
    };
    let payload = serde_json::to_string(&payload)
        .map_err(|e| VoteError::Decode(format!("payload encoding: {e}")))?;
    let envelope = SignedEnvelope {
        signature: sign(payload.as_bytes(), key),
        payload,
    };
    serde_json::to_vec(&envelope).map_err(|e| VoteError::Decode(format!("envelope encoding: {e}")))
}

/// Prefixes `message` with the frame magic and its length.
pub fn frame(message: &[u8]) -> Result<Vec<u8>, VoteError> {
    let len = u16::try_from(message.len()).map_err(|_| {
        VoteError::Config(format!(
            "v2 message of {} bytes exceeds {MAX_MESSAGE_LEN}",
            message.len()
        ))
    })?;
    let mut out = Vec::with_capacity(message.len() + 4);
    out.extend_from_slice(&FRAME_MAGIC);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(message);
    Ok(out)
}

/// Server-side state of one v2 connection.
#[derive(Debug)]
pub struct TokenSession {
    challenge: Option<Challenge>,
}

impl TokenSession {
    /// Starts a session with a fresh random challenge.
    #[must_use]
    pub fn new() -> Self {
        Self::with_challenge(Challenge::generate())
    }

    /// Starts a session with a known challenge.
    #[must_use]
    pub fn with_challenge(challenge: Challenge) -> Self {
        Self {
            challenge: Some(challenge),
        }
    }

    /// Challenge still awaiting verification, if any.
    #[must_use]
    pub fn challenge(&self) -> Option<&Challenge> {
        self.challenge.as_ref()
    }

    /// Greeting announcing this session's challenge.
    #[must_use]
    pub fn greeting(&self) -> Option<Greeting> {
        self.challenge.as_ref().map(Greeting::token)
    }

    /// Authenticates one client message.
    ///
    /// Checks run in order: token identity, signature, challenge. The
    /// challenge is spent by this call whatever the outcome, so a second
    /// call always ends in [`VoteError::Replay`] once authentication passes.
    pub fn verify(&mut self, message: &[u8], tokens: &InboundTokens) -> Result<Vote, VoteError> {
        let issued = self.challenge.take();

        let envelope: SignedEnvelope = serde_json::from_slice(message)
            .map_err(|e| VoteError::Decode(format!("invalid v2 envelope: {e}")))?;
        let payload: VotePayload = serde_json::from_str(&envelope.payload)
            .map_err(|e| VoteError::Decode(format!("invalid v2 payload: {e}")))?;

        let (_, key) = tokens.resolve(&payload.service_name).ok_or_else(|| {
            VoteError::Auth(format!(
                "unknown token identity `{}` and no default token",
                payload.service_name
            ))
        })?;
        if !signature_matches(envelope.payload.as_bytes(), &envelope.signature, key) {
            return Err(VoteError::Auth("signature mismatch".to_owned()));
        }
        match issued {
            Some(challenge) if challenge.matches(&payload.challenge) => {}
            _ => return Err(VoteError::Replay),
        }

        let timestamp = match payload.timestamp {
            serde_json::Value::String(text) => text,
            serde_json::Value::Number(number) => number.to_string(),
            other => {
                return Err(VoteError::Decode(format!(
                    "unsupported timestamp value `{other}`"
                )));
            }
        };
        Vote::new(
            payload.service_name,
            payload.username,
            payload.address,
            timestamp,
        )
    }
}

impl Default for TokenSession {
    fn default() -> Self {
        Self::new()
    }
}

/// Server reply to a v2 message.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TokenResponse {
    /// Vote accepted.
    Ok,
    /// Vote rejected.
    Error {
        /// Error classification.
        cause: String,
        /// Human-readable reason.
        error: String,
    },
}

impl TokenResponse {
    /// Error reply describing `err`.
    #[must_use]
    pub fn from_error(err: &VoteError) -> Self {
        Self::Error {
            cause: err.kind().as_str().to_owned(),
            error: err.to_string(),
        }
    }

    /// Wire form including the trailing CRLF.
    #[must_use]
    pub fn to_line(&self) -> String {
        let json = match self {
            Self::Ok => r#"{"status":"ok"}"#.to_owned(),
            Self::Error { .. } => serde_json::to_string(self)
                .unwrap_or_else(|_| r#"{"status":"error"}"#.to_owned()),
        };
        format!("{json}\r\n")
    }

    /// Parses a reply line.
    pub fn parse(line: &str) -> Result<Self, VoteError> {
        serde_json::from_str(line.trim())
            .map_err(|e| VoteError::Transport(format!("invalid v2 response `{}`: {e}", line.trim())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(secret: &str) -> InboundTokens {
        let mut tokens = InboundTokens::default();
        tokens.insert("default", TokenKey::from_secret(secret));
        tokens
    }

    fn vote() -> Vote {
        Vote::new("TopList", "Alice", "1.2.3.4", "1700000000").expect("vote")
    }

    #[test]
    fn greeting_round_trip() {
        let challenge = Challenge::from("xyz");
        let line = Greeting::token(&challenge).render();
        assert_eq!(line, "VOTIFIER 2 xyz\n");
        let parsed = Greeting::parse(&line).expect("parse");
        assert_eq!(parsed.challenge.as_deref(), Some("xyz"));
        let legacy = Greeting::parse("VOTIFIER 2.7.3\n").expect("parse");
        assert_eq!(legacy.version, "2.7.3");
        assert!(legacy.challenge.is_none());
        assert!(Greeting::parse("HELLO 1\n").is_err());
    }

    #[test]
    fn accepted_once_then_replay() {
        let key = TokenKey::from_secret("abc123");
        let message = encode_message(&vote(), "xyz", &key).expect("encode");
        let mut session = TokenSession::with_challenge(Challenge::from("xyz"));
        let decoded = session.verify(&message, &tokens("abc123")).expect("accepted");
        assert_eq!(decoded, vote());
        assert!(session.challenge().is_none());
        let err = session
            .verify(&message, &tokens("abc123"))
            .expect_err("second submission");
        assert!(matches!(err, VoteError::Replay));
    }

    #[test]
    fn wrong_secret_is_auth_error() {
        let key = TokenKey::from_secret("not-the-secret");
        let message = encode_message(&vote(), "xyz", &key).expect("encode");
        let mut session = TokenSession::with_challenge(Challenge::from("xyz"));
        let err = session.verify(&message, &tokens("abc123")).expect_err("reject");
        assert!(matches!(err, VoteError::Auth(_)));
    }

    #[test]
    fn unknown_identity_is_auth_error() {
        let mut only_site = InboundTokens::default();
        only_site.insert("OtherSite", TokenKey::from_secret("abc123"));
        let message =
            encode_message(&vote(), "xyz", &TokenKey::from_secret("abc123")).expect("encode");
        let mut session = TokenSession::with_challenge(Challenge::from("xyz"));
        let err = session.verify(&message, &only_site).expect_err("reject");
        assert!(matches!(err, VoteError::Auth(_)));
    }

    #[test]
    fn wrong_challenge_is_replay_error() {
        let key = TokenKey::from_secret("abc123");
        let message = encode_message(&vote(), "stale", &key).expect("encode");
        let mut session = TokenSession::with_challenge(Challenge::from("xyz"));
        let err = session.verify(&message, &tokens("abc123")).expect_err("reject");
        assert!(matches!(err, VoteError::Replay));
    }

    #[test]
    fn tampered_payload_fails_signature() {
        let key = TokenKey::from_secret("abc123");
        let message = encode_message(&vote(), "xyz", &key).expect("encode");
        let mut envelope: SignedEnvelope = serde_json::from_slice(&message).expect("json");
        envelope.payload = envelope.payload.replace("Alice", "Mallory");
        let tampered = serde_json::to_vec(&envelope).expect("json");
        let mut session = TokenSession::with_challenge(Challenge::from("xyz"));
        assert!(matches!(
            session.verify(&tampered, &tokens("abc123")),
            Err(VoteError::Auth(_))
        ));
    }

    #[test]
    fn string_timestamps_survive() {
        let key = TokenKey::from_secret("abc123");
        let vote = Vote::new("TopList", "Alice", "", "2024-01-01T00:00:00Z").expect("vote");
        let message = encode_message(&vote, "xyz", &key).expect("encode");
        let mut session = TokenSession::with_challenge(Challenge::from("xyz"));
        let decoded = session.verify(&message, &tokens("abc123")).expect("accepted");
        assert_eq!(decoded.timestamp(), "2024-01-01T00:00:00Z");
    }

    #[test]
    fn non_canonical_numeric_timestamps_are_sent_verbatim() {
        let key = TokenKey::from_secret("abc123");
        for stamp in ["0123", "+5", "-0", "1700000000", "-42"] {
            let vote = Vote::new("TopList", "Alice", "", stamp).expect("vote");
            let message = encode_message(&vote, "xyz", &key).expect("encode");
            let mut session = TokenSession::with_challenge(Challenge::from("xyz"));
            let decoded = session.verify(&message, &tokens("abc123")).expect("accepted");
            assert_eq!(decoded.timestamp(), stamp);
        }

        let vote = Vote::new("TopList", "Alice", "", "1700000000").expect("vote");
        let message = encode_message(&vote, "xyz", &key).expect("encode");
        let envelope: serde_json::Value = serde_json::from_slice(&message).expect("envelope");
        let payload: serde_json::Value =
            serde_json::from_str(envelope["payload"].as_str().expect("payload")).expect("payload");
        assert_eq!(payload["timestamp"], serde_json::json!(1_700_000_000));
    }

    #[test]
    fn frame_prefixes_magic_and_length() {
        let framed = frame(b"{}").expect("frame");
        assert_eq!(framed, [0x73, 0x3A, 0x00, 0x02, b'{', b'}']);
        assert!(frame(&vec![b' '; MAX_MESSAGE_LEN + 1]).is_err());
    }

    #[test]
    fn responses_render_and_parse() {
        assert_eq!(TokenResponse::Ok.to_line(), "{\"status\":\"ok\"}\r\n");
        let err = TokenResponse::from_error(&VoteError::Replay);
        let parsed = TokenResponse::parse(&err.to_line()).expect("parse");
        assert_eq!(parsed, err);
        match parsed {
            TokenResponse::Error { cause, .. } => assert_eq!(cause, "ReplayError"),
            TokenResponse::Ok => panic!("wrong variant"),
        }
    }
}
