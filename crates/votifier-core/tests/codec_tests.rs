use std::collections::BTreeMap;
use std::sync::Mutex;

use votifier_core::keys::{KeyPair, load_inbound_tokens};
use votifier_core::token::{self, Challenge, Greeting, TokenSession};
use votifier_core::{
    DEFAULT_KEY_BITS, DeliverySink, ErrorKind, OfflineQueue, TokenKey, Vote, VoteError, legacy,
};

fn alice() -> Vote {
    Vote::new("TopList", "Alice", "1.2.3.4", "1700000000").expect("vote")
}

#[test]
fn legacy_round_trip_with_default_key_size() {
    let pair = KeyPair::generate(DEFAULT_KEY_BITS).expect("keygen");
    assert_eq!(pair.block_len(), 256);

    let block = legacy::encrypt(&alice(), pair.public_key()).expect("encrypt");
    assert_eq!(block.len(), 256);

    let decoded = legacy::decrypt(&block, pair.private_key()).expect("decrypt");
    assert_eq!(decoded.service_name(), "TopList");
    assert_eq!(decoded.username(), "Alice");
    assert_eq!(decoded.address(), "1.2.3.4");
    assert_eq!(decoded.timestamp(), "1700000000");
}

#[test]
fn legacy_garbage_block_is_decode_error() {
    let pair = KeyPair::generate(1024).expect("keygen");
    let err = legacy::decrypt(&vec![0x42; pair.block_len()], pair.private_key())
        .expect_err("garbage");
    assert_eq!(err.kind(), ErrorKind::Decode);
}

#[test]
fn configured_default_token_accepts_once() {
    let mut configured = BTreeMap::new();
    configured.insert("default".to_owned(), "abc123".to_owned());
    let tokens = load_inbound_tokens(&configured).tokens;

    let mut session = TokenSession::with_challenge(Challenge::from("xyz"));
    let greeting = session.greeting().expect("challenge pending").render();
    let challenge = Greeting::parse(&greeting)
        .expect("greeting")
        .challenge
        .expect("v2 greeting");

    let message =
        token::encode_message(&alice(), &challenge, &TokenKey::from_secret("abc123"))
            .expect("encode");
    assert_eq!(session.verify(&message, &tokens).expect("accepted"), alice());

    let err = session.verify(&message, &tokens).expect_err("replayed");
    assert_eq!(err.kind(), ErrorKind::Replay);
}

#[test]
fn fresh_session_rejects_message_for_old_challenge() {
    let tokens = load_inbound_tokens(&BTreeMap::from([(
        "default".to_owned(),
        "abc123".to_owned(),
    )]))
    .tokens;
    let first = TokenSession::new();
    let old = first.challenge().expect("challenge").as_str().to_owned();
    let message =
        token::encode_message(&alice(), &old, &TokenKey::from_secret("abc123")).expect("encode");

    let mut second = TokenSession::new();
    assert_ne!(second.challenge().map(Challenge::as_str), Some(old.as_str()));
    assert!(matches!(
        second.verify(&message, &tokens),
        Err(VoteError::Replay)
    ));
}

#[test]
fn malformed_envelope_is_decode_error() {
    let tokens = load_inbound_tokens(&BTreeMap::new()).tokens;
    let mut session = TokenSession::new();
    let err = session.verify(b"{\"payload\":", &tokens).expect_err("bad json");
    assert_eq!(err.kind(), ErrorKind::Decode);
    assert!(session.challenge().is_none());
}

struct Collect(Mutex<Vec<String>>);

impl DeliverySink for Collect {
    fn on_vote_decoded(&self, vote: &Vote) {
        self.0
            .lock()
            .expect("lock")
            .push(vote.service_name().to_owned());
    }

    fn is_recipient_available(&self, _recipient: &str) -> bool {
        false
    }
}

#[test]
fn offline_votes_wait_for_flush() {
    let queue = OfflineQueue::new();
    let sink = Collect(Mutex::new(Vec::new()));
    for site in ["TopList", "OtherSite"] {
        let vote = Vote::new(site, "Alice", "", "1").expect("vote");
        queue.deliver_or_queue(vote, &sink);
    }
    assert!(sink.0.lock().expect("lock").is_empty());
    assert_eq!(queue.flush("Alice", &sink), 2);
    assert_eq!(*sink.0.lock().expect("lock"), ["TopList", "OtherSite"]);
}
