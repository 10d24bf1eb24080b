//! Daemon orchestration.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use votifier_core::{
    DEFAULT_KEY_BITS, DEFAULT_TOKEN_ID, DeliverySink, ErrorKind, PeerTarget, StaticContext, Vote,
    VoteError, load_inbound_tokens,
};

use crate::config::{ConfigError, ReceiverConfig};
use crate::failure_log::FailureLog;
use crate::forward::Forwarder;
use crate::keyfiles::KeyFiles;
use crate::receiver::{ReceiverHandle, ReceiverSettings, VoteReceiver};

/// App startup/runtime errors.
#[derive(Debug, Error)]
pub enum AppError {
    /// Config validation failure.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Config file could not be read or written.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Vote, key or codec failure.
    #[error(transparent)]
    Vote(#[from] VoteError),
    /// Runtime coordination failure.
    #[error("runtime error: {0}")]
    Runtime(String),
}

/// Sink used by the standalone daemon: every vote is logged, and failed votes
/// optionally land in `failed-votes.log`.
pub struct LoggingSink {
    failures: Option<Arc<FailureLog>>,
}

impl LoggingSink {
    /// Sink that appends failures to `failures` when given.
    #[must_use]
    pub fn new(failures: Option<FailureLog>) -> Self {
        Self {
            failures: failures.map(Arc::new),
        }
    }
}

impl DeliverySink for LoggingSink {
    fn on_vote_decoded(&self, vote: &Vote) {
        tracing::info!(
            service = vote.service_name(),
            username = vote.username(),
            address = vote.address(),
            timestamp = vote.timestamp(),
            "vote delivered"
        );
    }

    fn on_failed_vote(&self, source: SocketAddr, kind: ErrorKind, raw: &[u8]) {
        let Some(log) = self.failures.as_ref().map(Arc::clone) else {
            return;
        };
        let raw = raw.to_vec();
        tokio::spawn(async move {
            if let Err(err) = log.record(source, kind, raw).await {
                tracing::error!(path = %log.path().display(), %err, "could not write failure record");
            }
        });
    }
}

/// Loads keys and tokens, persists anything generated, and starts listening.
///
/// Generated tokens are written back to `config_path` when one is given.
pub async fn start_receiver(
    mut config: ReceiverConfig,
    config_path: Option<&Path>,
) -> Result<ReceiverHandle, AppError> {
    let key_pair = KeyFiles::new(config.rsa_dir(), DEFAULT_KEY_BITS)
        .load_or_generate()
        .await?;

    let mut changed = false;
    let token_load = load_inbound_tokens(&config.tokens);
    if let Some(secret) = token_load.generated_default {
        tracing::info!(token_id = DEFAULT_TOKEN_ID, "generated inbound token");
        config.tokens.insert(DEFAULT_TOKEN_ID.to_owned(), secret);
        changed = true;
    }
    for name in config.fill_missing_forward_tokens() {
        tracing::info!(peer = %name, "generated forwarding token");
        changed = true;
    }
    if changed && let Some(path) = config_path {
        config.save_toml_file(path)?;
    }

    let context = StaticContext {
        token_support: config.token_support,
        tokens: token_load.tokens,
        peers: config.peer_targets(),
        key_pair: Arc::new(key_pair),
    };
    for (name, peer) in context.peers.iter().filter(|(_, peer)| peer.enabled) {
        let codec = if peer.use_token { "v2" } else { "v1" };
        tracing::info!(
            peer = %name,
            address = %peer.address(),
            codec,
            "forwarding enabled"
        );
    }

    let failures = config
        .log_failed_votes
        .then(|| FailureLog::new(config.failed_votes_path()));
    let settings = ReceiverSettings {
        advertised_version: config.advertised_version.clone(),
        read_timeout: config.timeouts.read(),
        shutdown_grace: config.timeouts.shutdown_grace(),
        waiting_delay: std::time::Duration::from_secs(config.waiting_delay_secs),
        auto_clear_interval: (config.auto_clear_delay_secs > 0)
            .then(|| std::time::Duration::from_secs(config.auto_clear_delay_secs)),
        log_failed_votes: config.log_failed_votes,
    };
    VoteReceiver::new(
        Arc::new(context),
        Arc::new(LoggingSink::new(failures)),
        Forwarder::new(config.timeouts.forward()),
        settings,
    )
    .start(&config.bind_address())
    .await
}

/// Runs the receiver until interrupted.
pub async fn run_receiver(config: ReceiverConfig, config_path: &Path) -> Result<(), AppError> {
    let handle = start_receiver(config, Some(config_path)).await?;
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| AppError::Runtime(format!("ctrl-c handler: {e}")))?;
    handle.shutdown().await;
    Ok(())
}

/// Receiver public key as one base64 line, generating the pair if needed.
pub async fn public_key_line(config: &ReceiverConfig) -> Result<String, AppError> {
    let pair = KeyFiles::new(config.rsa_dir(), DEFAULT_KEY_BITS)
        .load_or_generate()
        .await?;
    Ok(pair.public_key_single_line()?)
}

/// Sends one vote to `target`, the way forwarding would.
pub async fn send_once(
    target: &PeerTarget,
    vote: &Vote,
    timeout: std::time::Duration,
) -> Result<(), AppError> {
    Forwarder::new(timeout).send(vote, target).await?;
    Ok(())
}
