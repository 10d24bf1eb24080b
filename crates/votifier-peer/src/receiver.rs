//! Connection dispatcher: accepts vote connections and runs one session each.
//!
//! A session walks `Accepted -> Greeted -> AwaitingV1Block | AwaitingV2Message
//! -> Decoded | Failed -> Closed`. At most one vote is decoded per connection.
//! With token support on, the first two bytes after the greeting decide the
//! codec: the v2 frame magic selects v2, anything else starts a v1 block.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use votifier_core::token::{Greeting, TokenResponse, TokenSession};
use votifier_core::{
    DeliverySink, FRAME_MAGIC, KeyPair, OfflineQueue, ReceiverContext, Routing, Vote, VoteError,
    legacy,
};

use crate::app::AppError;
use crate::forward::Forwarder;

/// Pause after a failed `accept`, e.g. when out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Receiver tuning that does not change per connection.
#[derive(Clone, Debug)]
pub struct ReceiverSettings {
    /// Version word of the v1 greeting.
    pub advertised_version: String,
    /// Budget for greeting plus read on each connection.
    pub read_timeout: Duration,
    /// How long shutdown waits for in-flight connections.
    pub shutdown_grace: Duration,
    /// Delay between a recipient coming online and its flush; zero flushes at once.
    pub waiting_delay: Duration,
    /// Period of the offline-queue clear; `None` disables it.
    pub auto_clear_interval: Option<Duration>,
    /// Report failed votes to [`DeliverySink::on_failed_vote`].
    pub log_failed_votes: bool,
}

impl Default for ReceiverSettings {
    fn default() -> Self {
        Self {
            advertised_version: "1".to_owned(),
            read_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(5),
            waiting_delay: Duration::ZERO,
            auto_clear_interval: Some(Duration::from_secs(7200)),
            log_failed_votes: false,
        }
    }
}

/// Per-connection progress.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    /// Socket accepted, nothing sent yet.
    Accepted,
    /// Greeting written.
    Greeted,
    /// Reading a v1 ciphertext block.
    AwaitingV1Block,
    /// Reading a v2 frame.
    AwaitingV2Message,
    /// A vote was produced.
    Decoded,
    /// Decoding or authentication failed.
    Failed,
    /// Socket released.
    Closed,
}

struct Connection {
    source: SocketAddr,
    state: ConnectionState,
    raw: Vec<u8>,
}

impl Connection {
    fn new(source: SocketAddr) -> Self {
        Self {
            source,
            state: ConnectionState::Accepted,
            raw: Vec::new(),
        }
    }

    fn advance(&mut self, next: ConnectionState) {
        tracing::trace!(source = %self.source, from = ?self.state, to = ?next, "connection state");
        self.state = next;
    }
}

/// What [`ReceiverHandle::recipient_available`] did.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FlushOutcome {
    /// Nothing was waiting.
    Idle,
    /// This many votes were delivered immediately.
    Delivered(usize),
    /// A flush will run after the configured delay.
    Scheduled,
}

struct Shared {
    context: Arc<dyn ReceiverContext>,
    sink: Arc<dyn DeliverySink>,
    queue: Arc<OfflineQueue>,
    forwarder: Forwarder,
    settings: ReceiverSettings,
}

/// Vote receiver ready to be started.
pub struct VoteReceiver {
    shared: Arc<Shared>,
}

impl VoteReceiver {
    /// Wires a receiver from its collaborators.
    pub fn new(
        context: Arc<dyn ReceiverContext>,
        sink: Arc<dyn DeliverySink>,
        forwarder: Forwarder,
        settings: ReceiverSettings,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                context,
                sink,
                queue: Arc::new(OfflineQueue::new()),
                forwarder,
                settings,
            }),
        }
    }

    /// Binds `bind` and starts accepting.
    pub async fn start(self, bind: &str) -> Result<ReceiverHandle, AppError> {
        let listener = TcpListener::bind(bind).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut tasks = vec![tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.shared),
            shutdown_rx.clone(),
        ))];
        if let Some(period) = self.shared.settings.auto_clear_interval
            && !period.is_zero()
        {
            tasks.push(tokio::spawn(auto_clear_loop(
                Arc::clone(&self.shared),
                period,
                shutdown_rx,
            )));
        }

        tracing::info!(
            %local_addr,
            token_support = self.shared.context.is_token_support_enabled(),
            "vote receiver listening"
        );
        Ok(ReceiverHandle {
            local_addr,
            shared: self.shared,
            shutdown_tx,
            tasks: Mutex::new(Some(tasks)),
        })
    }
}

/// Running receiver.
pub struct ReceiverHandle {
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Option<Vec<JoinHandle<()>>>>,
}

impl ReceiverHandle {
    /// Address actually bound.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Offline queue shared with the host.
    #[must_use]
    pub fn queue(&self) -> Arc<OfflineQueue> {
        Arc::clone(&self.shared.queue)
    }

    /// Signals that `recipient` came online: flushes its queued votes now,
    /// or after the waiting delay with whatever is queued by then.
    pub fn recipient_available(&self, recipient: &str) -> FlushOutcome {
        let shared = &self.shared;
        if shared.queue.pending(recipient) == 0 {
            return FlushOutcome::Idle;
        }
        let delay = shared.settings.waiting_delay;
        if delay.is_zero() {
            return FlushOutcome::Delivered(shared.queue.flush(recipient, shared.sink.as_ref()));
        }

        let shared = Arc::clone(shared);
        let recipient = recipient.to_owned();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(delay) => {
                    let delivered = shared.queue.flush(&recipient, shared.sink.as_ref());
                    tracing::debug!(%recipient, delivered, "delayed flush");
                }
                _ = shutdown.changed() => {}
            }
        });
        FlushOutcome::Scheduled
    }

    /// Stops accepting, waits out the grace period for in-flight connections
    /// and aborts the rest. Later calls return immediately.
    pub async fn shutdown(&self) {
        let Some(tasks) = self.tasks.lock().ok().and_then(|mut guard| guard.take()) else {
            return;
        };
        let _ = self.shutdown_tx.send(true);
        for task in tasks {
            if let Err(err) = task.await
                && !err.is_cancelled()
            {
                tracing::error!(%err, "receiver task failed");
            }
        }
        tracing::info!(local_addr = %self.local_addr, "vote receiver stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, source)) => {
                    let shared = Arc::clone(&shared);
                    connections.spawn(async move { shared.handle_connection(stream, source).await });
                }
                Err(err) => accept_failed(&err).await,
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(err) = joined {
                    tracing::error!(%err, "connection task failed");
                }
            }
        }
    }
    drop(listener);

    let grace = shared.settings.shutdown_grace;
    let drained = tokio::time::timeout(grace, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        tracing::warn!(remaining = connections.len(), "aborting in-flight connections");
        connections.abort_all();
        while connections.join_next().await.is_some() {}
    }
}

async fn accept_failed(err: &std::io::Error) {
    tracing::warn!(%err, "accept failed");
    tokio::time::sleep(ACCEPT_BACKOFF).await;
}

async fn auto_clear_loop(shared: Arc<Shared>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let dropped = shared.queue.clear_all();
                if dropped > 0 {
                    shared
                        .sink
                        .log_info(&format!("cleared {dropped} queued votes from the waiting list"));
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

impl Shared {
    async fn handle_connection(&self, mut stream: TcpStream, source: SocketAddr) {
        let mut conn = Connection::new(source);
        let served = tokio::time::timeout(
            self.settings.read_timeout,
            self.serve(&mut conn, &mut stream),
        )
        .await;
        let outcome = match served {
            Ok(outcome) => outcome,
            Err(_) => Err(VoteError::Transport(format!(
                "timed out in state {:?}",
                conn.state
            ))),
        };

        match outcome {
            Ok(vote) => {
                conn.advance(ConnectionState::Decoded);
                self.accept_vote(vote, source);
            }
            Err(err) => {
                let failed_in = conn.state;
                conn.advance(ConnectionState::Failed);
                self.sink.log_warning(&format!(
                    "rejected vote connection from {source} ({failed_in:?}): {err}"
                ));
                if self.settings.log_failed_votes {
                    self.sink.on_failed_vote(source, err.kind(), &conn.raw);
                }
            }
        }
        let _ = stream.shutdown().await;
        conn.advance(ConnectionState::Closed);
    }

    async fn serve(&self, conn: &mut Connection, stream: &mut TcpStream) -> Result<Vote, VoteError> {
        let key_pair = self.context.own_key_pair();
        let mut session = self
            .context
            .is_token_support_enabled()
            .then(TokenSession::new);
        let greeting = session
            .as_ref()
            .and_then(TokenSession::greeting)
            .unwrap_or_else(|| Greeting::legacy(self.settings.advertised_version.as_str()));
        stream.write_all(greeting.render().as_bytes()).await?;
        conn.advance(ConnectionState::Greeted);

        let got = fill(stream, &mut conn.raw, FRAME_MAGIC.len()).await?;
        if got == 0 {
            return Err(VoteError::Transport("closed before sending a vote".to_owned()));
        }

        if let Some(session) = session.as_mut()
            && conn.raw == FRAME_MAGIC
        {
            conn.advance(ConnectionState::AwaitingV2Message);
            return self.read_v2(conn, stream, session).await;
        }

        conn.advance(ConnectionState::AwaitingV1Block);
        if got == FRAME_MAGIC.len() {
            fill(stream, &mut conn.raw, key_pair.block_len()).await?;
        }
        decrypt_blocking(conn.raw.clone(), key_pair).await
    }

    async fn read_v2(
        &self,
        conn: &mut Connection,
        stream: &mut TcpStream,
        session: &mut TokenSession,
    ) -> Result<Vote, VoteError> {
        const HEADER: usize = FRAME_MAGIC.len() + 2;
        fill(stream, &mut conn.raw, HEADER).await?;
        let [_, _, hi, lo] = conn.raw[..] else {
            return Err(VoteError::Transport("closed inside the frame header".to_owned()));
        };
        let end = HEADER + usize::from(u16::from_be_bytes([hi, lo]));
        if fill(stream, &mut conn.raw, end).await? < end - HEADER {
            return Err(VoteError::Transport(format!(
                "closed after {} of {} message bytes",
                conn.raw.len() - HEADER,
                end - HEADER
            )));
        }

        let outcome = session.verify(&conn.raw[HEADER..], &self.context.inbound_tokens());
        let response = match &outcome {
            Ok(_) => TokenResponse::Ok,
            Err(err) => TokenResponse::from_error(err),
        };
        if let Err(err) = stream.write_all(response.to_line().as_bytes()).await {
            tracing::debug!(source = %conn.source, %err, "could not send v2 response");
        }
        outcome
    }

    fn accept_vote(&self, vote: Vote, source: SocketAddr) {
        self.sink
            .log_info(&format!("received {vote} from {source}"));
        if let Routing::Queued = self.queue.deliver_or_queue(vote.clone(), self.sink.as_ref()) {
            tracing::debug!(
                username = vote.username(),
                pending = self.queue.pending(vote.username()),
                "recipient offline, vote added to the waiting list"
            );
        }

        let peers = self.context.peers();
        if peers.iter().all(|(_, peer)| !peer.enabled) {
            return;
        }
        let forwarder = self.forwarder.clone();
        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move {
            for report in forwarder.forward(&vote, peers).await {
                match report.result {
                    Ok(()) => sink.log_info(&format!(
                        "forwarded vote for {} to {} ({})",
                        vote.username(),
                        report.peer,
                        report.address
                    )),
                    Err(err) => sink.log_warning(&format!(
                        "forwarding to {} ({}) failed: {err}",
                        report.peer, report.address
                    )),
                }
            }
        });
    }
}

/// Appends to `raw` until it holds `until` bytes or the peer closes.
///
/// Bytes land in `raw` as they arrive, so a caller that is cancelled mid-read
/// still sees everything received so far. Returns the number appended.
async fn fill<R: AsyncRead + Unpin>(
    reader: &mut R,
    raw: &mut Vec<u8>,
    until: usize,
) -> Result<usize, VoteError> {
    let start = raw.len();
    let mut chunk = [0_u8; 512];
    while raw.len() < until {
        let want = chunk.len().min(until - raw.len());
        let n = reader.read(&mut chunk[..want]).await?;
        if n == 0 {
            break;
        }
        raw.extend_from_slice(&chunk[..n]);
    }
    Ok(raw.len() - start)
}

async fn decrypt_blocking(block: Vec<u8>, key_pair: Arc<KeyPair>) -> Result<Vote, VoteError> {
    tokio::task::spawn_blocking(move || legacy::decrypt(&block, key_pair.private_key()))
        .await
        .map_err(|e| VoteError::Transport(format!("decrypt task join error: {e}")))?
}
