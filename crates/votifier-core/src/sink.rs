//! Capability traits implemented by the host.
//!
//! [`DeliverySink`] receives decoded votes and diagnostics.
//! [`ReceiverContext`] supplies the configuration the receiver reads on every
//! connection, so a host may swap tokens or peers without restarting.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::ErrorKind;
use crate::keys::{InboundTokens, KeyPair};
use crate::peer::PeerTarget;
use crate::vote::Vote;

/// Where decoded votes and receiver diagnostics go.
pub trait DeliverySink: Send + Sync {
    /// A vote ready for local consumers.
    fn on_vote_decoded(&self, vote: &Vote);

    /// Informational message.
    fn log_info(&self, message: &str) {
        tracing::info!("{message}");
    }

    /// Recoverable problem.
    fn log_warning(&self, message: &str) {
        tracing::warn!("{message}");
    }

    /// Failure an administrator should look at.
    fn log_severe(&self, message: &str) {
        tracing::error!("{message}");
    }

    /// Raw record of a vote that could not be decoded or authenticated.
    fn on_failed_vote(&self, _source: SocketAddr, _kind: ErrorKind, _raw: &[u8]) {}

    /// Whether `recipient` can take a vote right now; otherwise it is queued.
    fn is_recipient_available(&self, _recipient: &str) -> bool {
        true
    }
}

/// Configuration the receiver consults per connection.
pub trait ReceiverContext: Send + Sync {
    /// Whether v2 greetings are sent and v2 frames accepted.
    fn is_token_support_enabled(&self) -> bool;

    /// Inbound token identities.
    fn inbound_tokens(&self) -> InboundTokens;

    /// Names of all configured forwarding peers.
    fn peer_names(&self) -> Vec<String>;

    /// One forwarding peer.
    fn peer(&self, name: &str) -> Option<PeerTarget>;

    /// The receiver's own RSA identity.
    fn own_key_pair(&self) -> Arc<KeyPair>;

    /// Snapshot of every configured peer, enabled or not.
    fn peers(&self) -> Vec<(String, PeerTarget)> {
        self.peer_names()
            .into_iter()
            .filter_map(|name| self.peer(&name).map(|peer| (name, peer)))
            .collect()
    }
}

/// Fixed context built once from loaded configuration.
#[derive(Clone, Debug)]
pub struct StaticContext {
    /// Token support switch.
    pub token_support: bool,
    /// Inbound tokens.
    pub tokens: InboundTokens,
    /// Forwarding peers in configuration order.
    pub peers: Vec<(String, PeerTarget)>,
    /// Receiver identity.
    pub key_pair: Arc<KeyPair>,
}

impl ReceiverContext for StaticContext {
    fn is_token_support_enabled(&self) -> bool {
        self.token_support
    }

    fn inbound_tokens(&self) -> InboundTokens {
        self.tokens.clone()
    }

    fn peer_names(&self) -> Vec<String> {
        self.peers.iter().map(|(name, _)| name.clone()).collect()
    }

    fn peer(&self, name: &str) -> Option<PeerTarget> {
        self.peers
            .iter()
            .find(|(candidate, _)| candidate == name)
            .map(|(_, peer)| peer.clone())
    }

    fn own_key_pair(&self) -> Arc<KeyPair> {
        Arc::clone(&self.key_pair)
    }

    fn peers(&self) -> Vec<(String, PeerTarget)> {
        self.peers.clone()
    }
}
