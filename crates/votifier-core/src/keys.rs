//! Receiver key pair, inbound tokens and peer credentials.
//!
//! Nothing in here touches the filesystem. Hosts read whatever they persisted,
//! hand it to [`load_or_generate_key_pair`] or [`load_inbound_tokens`], and
//! write back when the outcome says something was generated.

use std::collections::{BTreeMap, HashMap};
use std::fmt::{Debug, Formatter};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use rand::RngCore;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::rand_core::OsRng;
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::error::VoteError;

/// Modulus size used for freshly generated receiver keys.
pub const DEFAULT_KEY_BITS: usize = 2048;

/// Token identity used when a service has no dedicated token.
pub const DEFAULT_TOKEN_ID: &str = "default";

/// Receiver RSA identity.
#[derive(Clone)]
pub struct KeyPair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl KeyPair {
    /// Generates a new pair with a `bits`-sized modulus.
    pub fn generate(bits: usize) -> Result<Self, VoteError> {
        let private = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| VoteError::KeyMaterial(format!("rsa key generation failed: {e}")))?;
        let public = private.to_public_key();
        Ok(Self { private, public })
    }

    /// Parses a persisted pair and checks that both halves belong together.
    pub fn from_pem(private_pem: &str, public_pem: &str) -> Result<Self, VoteError> {
        let private = parse_private_key(private_pem)?;
        let public = parse_public_key(public_pem)?;
        if private.to_public_key() != public {
            return Err(VoteError::KeyMaterial(
                "public key does not match private key".to_owned(),
            ));
        }
        Ok(Self { private, public })
    }

    /// Private half, used to decrypt legacy votes.
    #[must_use]
    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private
    }

    /// Public half handed out to voting sites.
    #[must_use]
    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public
    }

    /// Byte length of one legacy ciphertext block.
    #[must_use]
    pub fn block_len(&self) -> usize {
        self.public.size()
    }

    /// Encodes both halves as PEM (PKCS#8 private, SPKI public).
    pub fn to_pem(&self) -> Result<PemKeyPair, VoteError> {
        let private_pem = self
            .private
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| VoteError::KeyMaterial(format!("private key encoding: {e}")))?;
        let public_pem = self
            .public
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| VoteError::KeyMaterial(format!("public key encoding: {e}")))?;
        Ok(PemKeyPair {
            private_pem: private_pem.to_string(),
            public_pem,
        })
    }

    /// Public key as one base64 line, the form voting sites ask for.
    pub fn public_key_single_line(&self) -> Result<String, VoteError> {
        let der = self
            .public
            .to_public_key_der()
            .map_err(|e| VoteError::KeyMaterial(format!("public key encoding: {e}")))?;
        Ok(STANDARD.encode(der.as_bytes()))
    }
}

impl Debug for KeyPair {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("bits", &(self.block_len() * 8))
            .finish_non_exhaustive()
    }
}

/// PEM text for a key pair, ready to be written by the host.
#[derive(Clone)]
pub struct PemKeyPair {
    /// PKCS#8 private key.
    pub private_pem: String,
    /// SPKI public key.
    pub public_pem: String,
}

/// Whatever the host found on disk.
#[derive(Clone, Debug, Default)]
pub struct StoredKeyMaterial {
    /// Private key text, if the file exists.
    pub private_pem: Option<String>,
    /// Public key text, if the file exists.
    pub public_pem: Option<String>,
}

/// Why a new pair had to be generated.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RegenerationReason {
    /// Nothing was persisted yet.
    Missing,
    /// Only one half was present.
    PartiallyMissing,
    /// Both halves present but unusable.
    Corrupt(String),
}

/// Outcome of [`load_or_generate_key_pair`].
#[derive(Debug)]
pub enum KeyLoad {
    /// Persisted pair parsed fine.
    Loaded(KeyPair),
    /// A fresh pair was generated and must be persisted by the host.
    Generated {
        /// The new pair.
        pair: KeyPair,
        /// What was wrong with the stored material.
        reason: RegenerationReason,
    },
}

impl KeyLoad {
    /// Returns the usable pair regardless of origin.
    #[must_use]
    pub fn pair(&self) -> &KeyPair {
        match self {
            Self::Loaded(pair) | Self::Generated { pair, .. } => pair,
        }
    }

    /// Consumes the outcome, returning the pair.
    #[must_use]
    pub fn into_pair(self) -> KeyPair {
        match self {
            Self::Loaded(pair) | Self::Generated { pair, .. } => pair,
        }
    }
}

/// Loads the receiver identity, generating a new one when the stored
/// material is missing, half missing or corrupt.
pub fn load_or_generate_key_pair(
    stored: StoredKeyMaterial,
    bits: usize,
) -> Result<KeyLoad, VoteError> {
    let reason = match (stored.private_pem, stored.public_pem) {
        (Some(private_pem), Some(public_pem)) => {
            match KeyPair::from_pem(&private_pem, &public_pem) {
                Ok(pair) => return Ok(KeyLoad::Loaded(pair)),
                Err(err) => RegenerationReason::Corrupt(err.to_string()),
            }
        }
        (None, None) => RegenerationReason::Missing,
        _ => RegenerationReason::PartiallyMissing,
    };
    let pair = KeyPair::generate(bits)?;
    Ok(KeyLoad::Generated { pair, reason })
}

/// Parses a private key in PKCS#8 or PKCS#1 PEM.
pub fn parse_private_key(material: &str) -> Result<RsaPrivateKey, VoteError> {
    let material = material.trim();
    RsaPrivateKey::from_pkcs8_pem(material)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(material))
        .map_err(|e| VoteError::KeyMaterial(format!("unreadable private key: {e}")))
}

/// Parses a public key given as PEM or as single-line base64 DER.
pub fn parse_public_key(material: &str) -> Result<RsaPublicKey, VoteError> {
    let material = material.trim();
    if material.is_empty() {
        return Err(VoteError::KeyMaterial("public key is empty".to_owned()));
    }
    if material.starts_with("-----BEGIN") {
        return RsaPublicKey::from_public_key_pem(material)
            .or_else(|_| RsaPublicKey::from_pkcs1_pem(material))
            .map_err(|e| VoteError::KeyMaterial(format!("unreadable public key: {e}")));
    }
    let compact: String = material.split_whitespace().collect();
    let der = STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| VoteError::KeyMaterial(format!("public key is not base64: {e}")))?;
    RsaPublicKey::from_public_key_der(&der)
        .or_else(|_| RsaPublicKey::from_pkcs1_der(&der))
        .map_err(|e| VoteError::KeyMaterial(format!("unreadable public key: {e}")))
}

/// Returns a fresh 64-bit random token as 16 lower-case hex characters.
#[must_use]
pub fn new_token() -> String {
    let mut raw = [0_u8; 8];
    rand::rng().fill_bytes(&mut raw);
    hex::encode(raw)
}

/// HMAC-SHA256 key derived from a configured token string.
#[derive(Clone, Eq, PartialEq)]
pub struct TokenKey(Vec<u8>);

impl TokenKey {
    /// Uses the UTF-8 bytes of `secret` as the key.
    #[must_use]
    pub fn from_secret(secret: &str) -> Self {
        Self(secret.as_bytes().to_vec())
    }

    /// Raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Debug for TokenKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("TokenKey(..)")
    }
}

/// Token identities accepted by the v2 codec.
#[derive(Clone, Debug, Default)]
pub struct InboundTokens {
    keys: HashMap<String, TokenKey>,
}

impl InboundTokens {
    /// Adds or replaces one identity.
    pub fn insert(&mut self, id: impl Into<String>, key: TokenKey) {
        self.keys.insert(id.into(), key);
    }

    /// Exact lookup.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&TokenKey> {
        self.keys.get(id)
    }

    /// Looks up `identity`, falling back to the `default` token.
    #[must_use]
    pub fn resolve(&self, identity: &str) -> Option<(&str, &TokenKey)> {
        self.keys
            .get_key_value(identity)
            .or_else(|| self.keys.get_key_value(DEFAULT_TOKEN_ID))
            .map(|(id, key)| (id.as_str(), key))
    }

    /// Number of identities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// True when no identity is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl FromIterator<(String, TokenKey)> for InboundTokens {
    fn from_iter<T: IntoIterator<Item = (String, TokenKey)>>(iter: T) -> Self {
        Self {
            keys: iter.into_iter().collect(),
        }
    }
}

/// Outcome of [`load_inbound_tokens`].
#[derive(Clone, Debug)]
pub struct TokenLoad {
    /// Usable token keys.
    pub tokens: InboundTokens,
    /// Secret of a synthesized `default` token the host should persist.
    pub generated_default: Option<String>,
}

/// Builds the inbound token map from configuration, synthesizing a `default`
/// token when none is configured.
#[must_use]
pub fn load_inbound_tokens(configured: &BTreeMap<String, String>) -> TokenLoad {
    if configured.is_empty() {
        let secret = new_token();
        let mut tokens = InboundTokens::default();
        tokens.insert(DEFAULT_TOKEN_ID, TokenKey::from_secret(&secret));
        return TokenLoad {
            tokens,
            generated_default: Some(secret),
        };
    }
    let tokens = configured
        .iter()
        .map(|(id, secret)| (id.clone(), TokenKey::from_secret(secret)))
        .collect();
    TokenLoad {
        tokens,
        generated_default: None,
    }
}
