//! Forwarding engine: relays a decoded vote to every enabled peer.
//!
//! Each peer gets its own short-lived connection and task. A failure at one
//! peer is reported and otherwise ignored; nothing is retried.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use votifier_core::token::{self, Greeting, TokenResponse};
use votifier_core::{PeerCredential, PeerTarget, Vote, VoteError, legacy};

/// Outcome of one relay attempt.
#[derive(Debug)]
pub struct ForwardReport {
    /// Configured peer name.
    pub peer: String,
    /// Dialed `host:port`.
    pub address: String,
    /// What happened.
    pub result: Result<(), VoteError>,
}

/// Client side of both codecs with a per-send deadline.
#[derive(Clone, Debug)]
pub struct Forwarder {
    timeout: Duration,
}

impl Forwarder {
    /// Forwarder whose sends give up after `timeout` (connect plus I/O).
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Sends `vote` to every enabled peer concurrently and collects one
    /// report per dialed peer. Disabled peers produce no report.
    pub async fn forward(&self, vote: &Vote, peers: Vec<(String, PeerTarget)>) -> Vec<ForwardReport> {
        let mut sends = JoinSet::new();
        for (name, peer) in peers {
            if !peer.enabled {
                tracing::trace!(peer = %name, "skipping disabled peer");
                continue;
            }
            let forwarder = self.clone();
            let vote = vote.clone();
            sends.spawn(async move {
                let result = forwarder.send(&vote, &peer).await;
                ForwardReport {
                    peer: name,
                    address: peer.address(),
                    result,
                }
            });
        }

        let mut reports = Vec::with_capacity(sends.len());
        while let Some(joined) = sends.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(err) => tracing::error!(%err, "forward task failed"),
            }
        }
        reports
    }

    /// Sends `vote` to one peer using the credential `use_token` selects.
    pub async fn send(&self, vote: &Vote, peer: &PeerTarget) -> Result<(), VoteError> {
        let credential = peer.credential()?;
        match tokio::time::timeout(self.timeout, send_with(vote, peer, credential)).await {
            Ok(result) => result,
            Err(_) => Err(VoteError::Transport(format!(
                "{} did not complete within {:?}",
                peer.address(),
                self.timeout
            ))),
        }
    }
}

async fn send_with(
    vote: &Vote,
    peer: &PeerTarget,
    credential: PeerCredential<'_>,
) -> Result<(), VoteError> {
    let stream = TcpStream::connect(peer.address())
        .await
        .map_err(|e| VoteError::Transport(format!("connect {}: {e}", peer.address())))?;
    let mut stream = BufReader::new(stream);

    let mut line = String::new();
    if stream.read_line(&mut line).await? == 0 {
        return Err(VoteError::Transport(format!(
            "{} closed before greeting",
            peer.address()
        )));
    }
    let greeting = Greeting::parse(&line)?;
    tracing::debug!(peer = %peer.address(), version = %greeting.version, "peer greeted");

    match credential {
        PeerCredential::PublicKey(key) => {
            let block = legacy::encrypt(vote, &key)?;
            stream.get_mut().write_all(&block).await?;
            stream.get_mut().shutdown().await?;
            Ok(())
        }
        PeerCredential::Token(key) => {
            let challenge = greeting.challenge.ok_or_else(|| {
                VoteError::Transport(format!(
                    "{} sent no challenge; token support is off there",
                    peer.address()
                ))
            })?;
            let message = token::encode_message(vote, &challenge, key)?;
            stream.get_mut().write_all(&token::frame(&message)?).await?;
            stream.get_mut().flush().await?;

            line.clear();
            if stream.read_line(&mut line).await? == 0 {
                return Err(VoteError::Transport(format!(
                    "{} closed without a response",
                    peer.address()
                )));
            }
            match TokenResponse::parse(&line)? {
                TokenResponse::Ok => Ok(()),
                TokenResponse::Error { cause, error } => Err(VoteError::Transport(format!(
                    "{} rejected vote ({cause}): {error}",
                    peer.address()
                ))),
            }
        }
    }
}
