//! Legacy (v1) vote codec: one RSA PKCS#1 v1.5 block per vote.
//!
//! ```text
//! server: VOTIFIER <version>\n
//! client: <modulus-length ciphertext of "VOTE\n<service>\n<user>\n<address>\n<timestamp>\n">
//! ```
//!
//! There is no acknowledgement; the server closes after reading one block.

use rsa::rand_core::OsRng;
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};

use crate::error::VoteError;
use crate::vote::Vote;

/// First plaintext line of every legacy vote.
pub const VOTE_TAG: &str = "VOTE";

/// Encodes the newline-delimited plaintext record.
#[must_use]
pub fn encode_plaintext(vote: &Vote) -> Vec<u8> {
    format!(
        "{VOTE_TAG}\n{}\n{}\n{}\n{}\n",
        vote.service_name(),
        vote.username(),
        vote.address(),
        vote.timestamp()
    )
    .into_bytes()
}

/// Parses a decrypted plaintext record.
///
/// The final line may lack its terminator.
pub fn decode_plaintext(plaintext: &[u8]) -> Result<Vote, VoteError> {
    let text = std::str::from_utf8(plaintext)
        .map_err(|_| VoteError::Decode("legacy plaintext is not utf-8".to_owned()))?;
    let fields: Vec<&str> = text.split('\n').collect();
    if fields.len() < 5 {
        return Err(VoteError::Decode(format!(
            "legacy record has {} fields, expected at least 5",
            fields.len()
        )));
    }
    if fields[0] != VOTE_TAG {
        return Err(VoteError::Decode(format!(
            "legacy record tag `{}` is not `{VOTE_TAG}`",
            fields[0]
        )));
    }
    Vote::new(fields[1], fields[2], fields[3], fields[4])
}

/// Encrypts `vote` for a receiver holding the private half of `key`.
pub fn encrypt(vote: &Vote, key: &RsaPublicKey) -> Result<Vec<u8>, VoteError> {
    let plaintext = encode_plaintext(vote);
    // PKCS#1 v1.5 padding needs 11 bytes of the block.
    if plaintext.len() + 11 > key.size() {
        return Err(VoteError::Config(format!(
            "vote record of {} bytes does not fit a {}-byte block",
            plaintext.len(),
            key.size()
        )));
    }
    key.encrypt(&mut OsRng, Pkcs1v15Encrypt, &plaintext)
        .map_err(|e| VoteError::KeyMaterial(format!("rsa encryption failed: {e}")))
}

/// Decrypts one ciphertext block and parses the vote inside.
pub fn decrypt(block: &[u8], key: &RsaPrivateKey) -> Result<Vote, VoteError> {
    if block.len() != key.size() {
        return Err(VoteError::Decode(format!(
            "legacy block is {} bytes, expected {}",
            block.len(),
            key.size()
        )));
    }
    let plaintext = key
        .decrypt_blinded(&mut OsRng, Pkcs1v15Encrypt, block)
        .map_err(|e| VoteError::Decode(format!("rsa decryption failed: {e}")))?;
    decode_plaintext(&plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPair;

    #[test]
    fn plaintext_tolerates_missing_final_newline() {
        let vote = decode_plaintext(b"VOTE\nTopList\nAlice\n1.2.3.4\n1700000000")
            .expect("decode");
        assert_eq!(vote.timestamp(), "1700000000");
    }

    #[test]
    fn plaintext_rejects_short_or_mistagged_records() {
        assert!(matches!(
            decode_plaintext(b"VOTE\nTopList\nAlice\n"),
            Err(VoteError::Decode(_))
        ));
        assert!(matches!(
            decode_plaintext(b"VOTX\nTopList\nAlice\n1.2.3.4\n1\n"),
            Err(VoteError::Decode(_))
        ));
    }

    #[test]
    fn plaintext_layout_is_newline_terminated() {
        let vote = Vote::new("TopList", "Alice", "1.2.3.4", "1700000000").expect("vote");
        assert_eq!(
            encode_plaintext(&vote),
            b"VOTE\nTopList\nAlice\n1.2.3.4\n1700000000\n"
        );
    }

    #[test]
    fn wrong_block_size_is_decode_error() {
        let pair = KeyPair::generate(1024).expect("keygen");
        let err = decrypt(&[0_u8; 100], pair.private_key()).expect_err("must fail");
        assert!(matches!(err, VoteError::Decode(_)));
    }

    #[test]
    fn block_for_other_key_fails_to_decrypt() {
        let ours = KeyPair::generate(1024).expect("keygen");
        let theirs = KeyPair::generate(1024).expect("keygen");
        let vote = Vote::new("TopList", "Alice", "1.2.3.4", "1").expect("vote");
        let block = encrypt(&vote, theirs.public_key()).expect("encrypt");
        assert!(matches!(
            decrypt(&block, ours.private_key()),
            Err(VoteError::Decode(_))
        ));
    }
}
