//! Forwarding peer description and credential selection.

use rsa::RsaPublicKey;

use crate::error::VoteError;
use crate::keys::{TokenKey, parse_public_key};

/// One downstream receiver votes are relayed to.
#[derive(Clone, Debug)]
pub struct PeerTarget {
    /// Disabled peers are never dialed.
    pub enabled: bool,
    /// Host name or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Peer public key, PEM or single-line base64 DER.
    pub public_key_material: String,
    /// Shared secret for v2 forwarding.
    pub token: Option<TokenKey>,
    /// Selects the v2 codec instead of v1.
    pub use_token: bool,
}

/// Credential resolved for one send.
#[derive(Debug)]
pub enum PeerCredential<'a> {
    /// Encrypt with the peer's RSA key (v1).
    PublicKey(RsaPublicKey),
    /// Sign with the shared secret (v2).
    Token(&'a TokenKey),
}

impl PeerTarget {
    /// `host:port` as dialed.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Picks the credential selected by `use_token`.
    pub fn credential(&self) -> Result<PeerCredential<'_>, VoteError> {
        if self.use_token {
            return self
                .token
                .as_ref()
                .map(PeerCredential::Token)
                .ok_or_else(|| VoteError::Config(format!("peer {} has no token", self.address())));
        }
        if self.public_key_material.trim().is_empty() {
            return Err(VoteError::Config(format!(
                "peer {} has no public key",
                self.address()
            )));
        }
        Ok(PeerCredential::PublicKey(parse_public_key(
            &self.public_key_material,
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPair;

    fn target(use_token: bool) -> PeerTarget {
        PeerTarget {
            enabled: true,
            host: "127.0.0.1".to_owned(),
            port: 8193,
            public_key_material: String::new(),
            token: None,
            use_token,
        }
    }

    #[test]
    fn missing_credentials_are_config_errors() {
        assert!(matches!(target(true).credential(), Err(VoteError::Config(_))));
        assert!(matches!(target(false).credential(), Err(VoteError::Config(_))));
    }

    #[test]
    fn unreadable_public_key_is_a_key_material_error() {
        let mut peer = target(false);
        peer.public_key_material = "not a key at all".to_owned();
        assert!(matches!(peer.credential(), Err(VoteError::KeyMaterial(_))));
        peer.public_key_material =
            "-----BEGIN PUBLIC KEY-----\nAAAA\n-----END PUBLIC KEY-----".to_owned();
        assert!(matches!(peer.credential(), Err(VoteError::KeyMaterial(_))));
        assert_eq!(
            peer.credential().map(|_| ()).unwrap_err().kind(),
            crate::ErrorKind::KeyMaterial
        );
    }

    #[test]
    fn use_token_selects_the_secret() {
        let mut peer = target(true);
        peer.token = Some(TokenKey::from_secret("abc123"));
        peer.public_key_material = "ignored".to_owned();
        assert!(matches!(peer.credential(), Ok(PeerCredential::Token(_))));
    }

    #[test]
    fn public_key_is_parsed_from_single_line() {
        let pair = KeyPair::generate(1024).expect("keygen");
        let mut peer = target(false);
        peer.public_key_material = pair.public_key_single_line().expect("line");
        match peer.credential().expect("credential") {
            PeerCredential::PublicKey(key) => assert_eq!(&key, pair.public_key()),
            PeerCredential::Token(_) => panic!("wrong credential"),
        }
    }
}
