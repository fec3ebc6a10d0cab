//! Connection manager for the signaling hub.
//!
//! [`ConnectionManager`] is a thin handle that talks to a background
//! connection loop over an unbounded command channel. The loop owns the
//! [`Connector`], the active [`Transport`], the session token, and the
//! bounded outbound buffer. Decoded inbound frames are delivered in arrival
//! order on the receiver returned from [`ConnectionManager::new`].
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──ok──▶ Connected
//!      ▲                        │ err              │ network loss
//!      │                        ▼                  ▼
//!      └────disconnect──── Failed ◀──exhausted── Reconnecting ──ok──▶ Connected
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! let (manager, mut inbound) = ConnectionManager::new(connector, &HubConfig::new("me"));
//! manager.connect(session_token).await?;
//! manager.send(ClientMessage::Ping).await?;
//! while let Some(message) = inbound.recv().await {
//!     // route message
//! }
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::config::HubConfig;
use crate::error::{HubError, Result};
use crate::lock::lock;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::transport::{Connector, Transport};

/// Keepalive period used when pings are disabled; the tick branch is never
/// polled in that case.
const IDLE_HEARTBEAT: Duration = Duration::from_secs(3600);

// ── State ───────────────────────────────────────────────────────────

/// Lifecycle state of the signaling connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    /// Whether inbound events may flow in this state.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Connected | Self::Reconnecting)
    }

    /// Whether `send` is accepted (immediately or into the bounded buffer).
    pub fn accepts_sends(&self) -> bool {
        !matches!(self, Self::Disconnected | Self::Failed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

// ── Outbound seam ───────────────────────────────────────────────────

/// Fire-and-forget outbound path used by the call state machine and the
/// presence tracker.
///
/// Implemented by [`ConnectionManager`]; tests substitute a recording fake.
pub trait SignalSink: Send + Sync {
    /// Hand `message` to the connection without waiting for the write.
    ///
    /// # Errors
    ///
    /// [`HubError::NotConnected`] when the connection is disconnected or has
    /// failed, [`HubError::QueueFull`] when the reconnect buffer is full.
    fn enqueue(&self, message: ClientMessage) -> Result<()>;
}

// ── Commands ────────────────────────────────────────────────────────

enum Command {
    Connect {
        token: String,
        ack: oneshot::Sender<Result<()>>,
    },
    Retry {
        ack: oneshot::Sender<Result<()>>,
    },
    Send {
        message: ClientMessage,
        ack: Option<oneshot::Sender<Result<()>>>,
    },
    RefreshToken {
        token: String,
    },
    Disconnect {
        ack: oneshot::Sender<()>,
    },
}

/// One outbound frame waiting for a live transport.
struct Outbound {
    message: ClientMessage,
    ack: Option<oneshot::Sender<Result<()>>>,
}

impl Outbound {
    fn resolve(self, result: Result<()>) {
        match self.ack {
            Some(ack) => {
                let _ = ack.send(result);
            }
            None => {
                if let Err(e) = result {
                    debug!(kind = self.message.kind(), error = %e, "dropped queued frame");
                }
            }
        }
    }
}

/// Bounded FIFO of frames sent while no transport is up.
struct Outbox {
    queue: VecDeque<Outbound>,
    capacity: usize,
    /// Mirrors `queue.len()` for the handle's fail-fast check.
    len: Arc<AtomicUsize>,
}

impl Outbox {
    fn new(capacity: usize, len: Arc<AtomicUsize>) -> Self {
        Self {
            queue: VecDeque::new(),
            capacity: capacity.max(1),
            len,
        }
    }

    fn push(&mut self, item: Outbound) {
        if self.queue.len() >= self.capacity {
            warn!(
                kind = item.message.kind(),
                capacity = self.capacity,
                "outbound queue full, rejecting frame"
            );
            item.resolve(Err(HubError::QueueFull));
            return;
        }
        self.queue.push_back(item);
        self.sync_len();
    }

    /// Put a frame whose write failed back at the head of the line.
    fn requeue(&mut self, item: Outbound) {
        if self.queue.len() >= self.capacity {
            item.resolve(Err(HubError::QueueFull));
            return;
        }
        self.queue.push_front(item);
        self.sync_len();
    }

    fn pop(&mut self) -> Option<Outbound> {
        let item = self.queue.pop_front();
        self.sync_len();
        item
    }

    fn fail_all(&mut self) {
        for item in self.queue.drain(..) {
            item.resolve(Err(HubError::NotConnected));
        }
        self.sync_len();
    }

    fn sync_len(&self) {
        self.len.store(self.queue.len(), Ordering::Release);
    }
}

// ── Handle ──────────────────────────────────────────────────────────

/// Owned handle to the signaling connection.
///
/// Construct one at session start with [`ConnectionManager::new`] and tear it
/// down at logout with [`shutdown`](Self::shutdown). Dropping the handle
/// aborts the background loop.
pub struct ConnectionManager {
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    queued: Arc<AtomicUsize>,
    queue_capacity: usize,
    task: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    shutdown_timeout: Duration,
}

impl ConnectionManager {
    /// Spawn the connection loop in the `Disconnected` state.
    ///
    /// Returns the handle and the receiver of decoded inbound messages.
    /// Must be called from within a tokio runtime.
    #[must_use = "the inbound receiver must be consumed to receive server messages"]
    pub fn new(
        connector: impl Connector,
        config: &HubConfig,
    ) -> (Self, mpsc::Receiver<ServerMessage>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<Command>();
        let (inbound_tx, inbound_rx) =
            mpsc::channel::<ServerMessage>(config.inbound_channel_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let queue_capacity = config.outbound_queue_capacity.max(1);
        let queued = Arc::new(AtomicUsize::new(0));

        let connection_loop = ConnectionLoop {
            connector: Box::new(connector),
            connect_timeout: config.connect_timeout,
            heartbeat: config.heartbeat_interval.filter(|period| !period.is_zero()),
            backoff: Backoff::new(config.reconnect.clone()),
            cmd_rx,
            shutdown_rx,
            state_tx,
            inbound_tx,
            token: None,
            outbox: Outbox::new(queue_capacity, Arc::clone(&queued)),
            waiters: Vec::new(),
        };
        let task = tokio::spawn(connection_loop.run());

        let manager = Self {
            cmd_tx,
            state_rx,
            queued,
            queue_capacity,
            task: Mutex::new(Some(task)),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_timeout: config.shutdown_timeout,
        };
        (manager, inbound_rx)
    }

    /// Open the connection with `token`.
    ///
    /// Resolves once connected. A failed dial moves the connection to
    /// [`ConnectionState::Failed`] and returns the dial error; automatic
    /// reconnection only kicks in after a session has been established.
    ///
    /// # Errors
    ///
    /// The connector's error, [`HubError::Timeout`] if the dial exceeds
    /// `connect_timeout`, or [`HubError::NotConnected`] if the manager was
    /// shut down.
    pub async fn connect(&self, token: impl Into<String>) -> Result<()> {
        let (ack, rx) = oneshot::channel();
        self.command(Command::Connect {
            token: token.into(),
            ack,
        })?;
        rx.await.map_err(|_| HubError::NotConnected)?
    }

    /// Manually retry after [`ConnectionState::Failed`] using the last token.
    /// While reconnecting, skips the remaining backoff delay.
    ///
    /// # Errors
    ///
    /// Same as [`connect`](Self::connect); [`HubError::InvalidArgument`] if no
    /// token was ever supplied.
    pub async fn retry(&self) -> Result<()> {
        let (ack, rx) = oneshot::channel();
        self.command(Command::Retry { ack })?;
        rx.await.map_err(|_| HubError::NotConnected)?
    }

    /// Close the connection and cancel any pending reconnect. Buffered frames
    /// fail with [`HubError::NotConnected`].
    pub async fn disconnect(&self) {
        let (ack, rx) = oneshot::channel();
        if self.command(Command::Disconnect { ack }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Send `message` and wait until it is written to the transport.
    ///
    /// While connecting or reconnecting the frame is buffered and the future
    /// resolves when the buffer is flushed.
    ///
    /// # Errors
    ///
    /// [`HubError::NotConnected`] when disconnected or failed (checked before
    /// anything is queued), [`HubError::QueueFull`] when the reconnect buffer
    /// is full, or a serialization error.
    pub async fn send(&self, message: ClientMessage) -> Result<()> {
        self.admit()?;
        let (ack, rx) = oneshot::channel();
        self.command(Command::Send {
            message,
            ack: Some(ack),
        })?;
        rx.await.map_err(|_| HubError::NotConnected)?
    }

    /// Queue `message` without waiting for the write.
    ///
    /// # Errors
    ///
    /// Same fail-fast checks as [`send`](Self::send).
    pub fn enqueue(&self, message: ClientMessage) -> Result<()> {
        self.admit()?;
        self.command(Command::Send { message, ack: None })
    }

    /// Swap the session token.
    ///
    /// Re-authenticates in place when the transport supports it; otherwise the
    /// transport is replaced without touching subscriptions or buffered sends.
    ///
    /// # Errors
    ///
    /// [`HubError::NotConnected`] if the manager was shut down.
    pub fn refresh_token(&self, token: impl Into<String>) -> Result<()> {
        self.command(Command::RefreshToken {
            token: token.into(),
        })
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Frames currently buffered while waiting for a transport.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    /// A receiver that observes every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Stop the connection loop, closing the transport.
    ///
    /// The loop is given `shutdown_timeout` to close gracefully and is aborted
    /// afterwards. Safe to call more than once.
    pub async fn shutdown(&self) {
        debug!("ConnectionManager: shutdown requested");

        if let Some(tx) = lock(&self.shutdown_tx).take() {
            let _ = tx.send(());
        }

        let task = lock(&self.task).take();
        if let Some(mut task) = task {
            match tokio::time::timeout(self.shutdown_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!("connection loop terminated with join error: {join_err}");
                }
                Err(_) => {
                    warn!("connection loop did not exit within timeout; aborting task");
                    task.abort();
                    if let Err(join_err) = task.await {
                        debug!("connection loop aborted: {join_err}");
                    }
                }
            }
        }
    }

    /// Abort the connection loop without a graceful close.
    pub(crate) fn abort(&self) {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
    }

    fn admit(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Disconnected | ConnectionState::Failed => {
                Err(HubError::NotConnected)
            }
            ConnectionState::Connecting | ConnectionState::Reconnecting
                if self.queued.load(Ordering::Acquire) >= self.queue_capacity =>
            {
                Err(HubError::QueueFull)
            }
            _ => Ok(()),
        }
    }

    fn command(&self, cmd: Command) -> Result<()> {
        self.cmd_tx.send(cmd).map_err(|_| HubError::NotConnected)
    }
}

impl SignalSink for ConnectionManager {
    fn enqueue(&self, message: ClientMessage) -> Result<()> {
        ConnectionManager::enqueue(self, message)
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("queued", &self.queued.load(Ordering::Relaxed))
            .field("has_task", &lock(&self.task).is_some())
            .finish()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        // No executor is available to drive a graceful close from `Drop`.
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
    }
}

// ── Connection loop ─────────────────────────────────────────────────

enum Next {
    Idle,
    Session(Box<dyn Transport>),
    Reconnect { immediate: bool },
    Exit,
}

enum Dial {
    Connected(Box<dyn Transport>),
    Failed(HubError),
    Cancelled(oneshot::Sender<()>),
    Exit,
}

enum Wait {
    Elapsed,
    Cancelled(oneshot::Sender<()>),
    Exit,
}

struct ConnectionLoop {
    connector: Box<dyn Connector>,
    connect_timeout: Duration,
    heartbeat: Option<Duration>,
    backoff: Backoff,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    shutdown_rx: oneshot::Receiver<()>,
    state_tx: watch::Sender<ConnectionState>,
    inbound_tx: mpsc::Sender<ServerMessage>,
    token: Option<String>,
    outbox: Outbox,
    /// `connect`/`retry` callers waiting for the next successful dial.
    waiters: Vec<oneshot::Sender<Result<()>>>,
}

impl ConnectionLoop {
    async fn run(mut self) {
        debug!("connection loop started");

        let mut next = Next::Idle;
        loop {
            next = match next {
                Next::Idle => self.idle().await,
                Next::Session(transport) => self.session(transport).await,
                Next::Reconnect { immediate } => self.reconnect(immediate).await,
                Next::Exit => break,
            };
        }

        self.outbox.fail_all();
        self.fail_waiters(&HubError::NotConnected);
        transition(&self.state_tx, ConnectionState::Disconnected);
        debug!("connection loop exited");
    }

    /// Disconnected or Failed: wait for someone to ask for a connection.
    async fn idle(&mut self) -> Next {
        loop {
            let cmd = tokio::select! {
                _ = &mut self.shutdown_rx => return Next::Exit,
                cmd = self.cmd_rx.recv() => cmd,
            };
            let Some(cmd) = cmd else {
                return Next::Exit;
            };
            match cmd {
                Command::Connect { token, ack } => {
                    self.token = Some(token);
                    self.waiters.push(ack);
                    return self.first_dial().await;
                }
                Command::Retry { ack } => {
                    if self.token.is_none() {
                        let _ = ack.send(Err(HubError::InvalidArgument(
                            "no session token to retry with".into(),
                        )));
                        continue;
                    }
                    self.waiters.push(ack);
                    return self.first_dial().await;
                }
                Command::Send { message, ack } => {
                    Outbound { message, ack }.resolve(Err(HubError::NotConnected));
                }
                Command::RefreshToken { token } => {
                    self.token = Some(token);
                }
                Command::Disconnect { ack } => {
                    transition(&self.state_tx, ConnectionState::Disconnected);
                    let _ = ack.send(());
                }
            }
        }
    }

    async fn first_dial(&mut self) -> Next {
        transition(&self.state_tx, ConnectionState::Connecting);
        match self.dial().await {
            Dial::Connected(transport) => Next::Session(transport),
            Dial::Failed(e) => {
                warn!(error = %e, "connect failed");
                transition(&self.state_tx, ConnectionState::Failed);
                self.outbox.fail_all();
                self.fail_waiters(&e);
                Next::Idle
            }
            Dial::Cancelled(ack) => {
                self.go_disconnected(ack);
                Next::Idle
            }
            Dial::Exit => Next::Exit,
        }
    }

    /// One dial attempt bounded by `connect_timeout`. Commands arriving
    /// meanwhile are buffered.
    async fn dial(&mut self) -> Dial {
        let Some(token) = self.token.clone() else {
            return Dial::Failed(HubError::InvalidArgument("no session token".into()));
        };
        let connect = tokio::time::timeout(self.connect_timeout, self.connector.connect(&token));
        tokio::pin!(connect);

        loop {
            tokio::select! {
                result = &mut connect => {
                    return match result {
                        Ok(Ok(transport)) => Dial::Connected(transport),
                        Ok(Err(e)) => Dial::Failed(e),
                        Err(_) => Dial::Failed(HubError::Timeout),
                    };
                }
                _ = &mut self.shutdown_rx => return Dial::Exit,
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        return Dial::Exit;
                    };
                    if let Some(ack) =
                        hold(cmd, &mut self.outbox, &mut self.waiters, &mut self.token)
                    {
                        return Dial::Cancelled(ack);
                    }
                }
            }
        }
    }

    /// Connected: pump frames both ways until the transport goes away.
    async fn session(&mut self, mut transport: Box<dyn Transport>) -> Next {
        self.backoff.reset();
        transition(&self.state_tx, ConnectionState::Connected);
        for ack in self.waiters.drain(..) {
            let _ = ack.send(Ok(()));
        }

        while let Some(item) = self.outbox.pop() {
            match write_frame(transport.as_mut(), &item.message).await {
                Ok(()) => item.resolve(Ok(())),
                Err(e @ HubError::Serialization(_)) => item.resolve(Err(e)),
                Err(e) => {
                    warn!(error = %e, "flush failed, reconnecting");
                    self.outbox.requeue(item);
                    let _ = transport.close().await;
                    return Next::Reconnect { immediate: false };
                }
            }
        }

        let period = self.heartbeat.unwrap_or(IDLE_HEARTBEAT);
        let pings = self.heartbeat.is_some();
        let mut heartbeat =
            tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = &mut self.shutdown_rx => {
                    debug!("shutdown signal received");
                    let _ = transport.close().await;
                    return Next::Exit;
                }

                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        debug!("command channel closed, shutting down connection loop");
                        let _ = transport.close().await;
                        return Next::Exit;
                    };
                    match cmd {
                        Command::Send { message, ack } => {
                            let item = Outbound { message, ack };
                            match write_frame(transport.as_mut(), &item.message).await {
                                Ok(()) => item.resolve(Ok(())),
                                Err(e @ HubError::Serialization(_)) => {
                                    error!("failed to serialize ClientMessage: {e}");
                                    item.resolve(Err(e));
                                }
                                Err(e) => {
                                    warn!(error = %e, "transport send failed, reconnecting");
                                    self.outbox.requeue(item);
                                    let _ = transport.close().await;
                                    return Next::Reconnect { immediate: false };
                                }
                            }
                        }
                        Command::RefreshToken { token } => {
                            self.token = Some(token.clone());
                            if transport.supports_live_reauth() {
                                debug!("re-authenticating in place");
                                let frame = ClientMessage::RefreshToken { token };
                                if let Err(e) = write_frame(transport.as_mut(), &frame).await {
                                    warn!(error = %e, "token refresh send failed, reconnecting");
                                    let _ = transport.close().await;
                                    return Next::Reconnect { immediate: true };
                                }
                            } else {
                                info!("transport cannot re-authenticate in place; redialing");
                                let _ = transport.close().await;
                                return Next::Reconnect { immediate: true };
                            }
                        }
                        Command::Connect { token, ack } => {
                            self.token = Some(token);
                            let _ = ack.send(Ok(()));
                        }
                        Command::Retry { ack } => {
                            let _ = ack.send(Ok(()));
                        }
                        Command::Disconnect { ack } => {
                            let _ = transport.close().await;
                            self.go_disconnected(ack);
                            return Next::Idle;
                        }
                    }
                }

                incoming = transport.recv() => {
                    match incoming {
                        Some(Ok(text)) => forward(&self.inbound_tx, &text).await,
                        Some(Err(e)) => {
                            warn!(error = %e, "transport receive error, reconnecting");
                            return Next::Reconnect { immediate: false };
                        }
                        None => {
                            info!("transport closed by server, reconnecting");
                            return Next::Reconnect { immediate: false };
                        }
                    }
                }

                _ = heartbeat.tick(), if pings => {
                    if let Err(e) = write_frame(transport.as_mut(), &ClientMessage::Ping).await {
                        warn!(error = %e, "heartbeat failed, reconnecting");
                        let _ = transport.close().await;
                        return Next::Reconnect { immediate: false };
                    }
                }
            }
        }
    }

    /// Reconnecting: redial with backoff until connected, cancelled, or out
    /// of attempts.
    async fn reconnect(&mut self, immediate: bool) -> Next {
        transition(&self.state_tx, ConnectionState::Reconnecting);
        let mut skip_delay = immediate;

        loop {
            if !skip_delay {
                let Some(delay) = self.backoff.next_delay() else {
                    warn!(
                        attempts = self.backoff.attempts(),
                        "reconnect attempts exhausted"
                    );
                    transition(&self.state_tx, ConnectionState::Failed);
                    self.outbox.fail_all();
                    self.fail_waiters(&HubError::Connection(
                        "reconnect attempts exhausted".into(),
                    ));
                    return Next::Idle;
                };
                debug!(?delay, attempt = self.backoff.attempts(), "waiting to reconnect");
                match self.wait(delay).await {
                    Wait::Elapsed => {}
                    Wait::Cancelled(ack) => {
                        self.go_disconnected(ack);
                        return Next::Idle;
                    }
                    Wait::Exit => return Next::Exit,
                }
            }
            skip_delay = false;

            match self.dial().await {
                Dial::Connected(transport) => {
                    info!("reconnected");
                    return Next::Session(transport);
                }
                Dial::Failed(e) if !e.is_transient() => {
                    warn!(error = %e, "reconnect rejected, giving up");
                    transition(&self.state_tx, ConnectionState::Failed);
                    self.outbox.fail_all();
                    self.fail_waiters(&e);
                    return Next::Idle;
                }
                Dial::Failed(e) => {
                    warn!(error = %e, attempt = self.backoff.attempts(), "reconnect attempt failed");
                }
                Dial::Cancelled(ack) => {
                    self.go_disconnected(ack);
                    return Next::Idle;
                }
                Dial::Exit => return Next::Exit,
            }
        }
    }

    /// Sleep out a backoff delay while still serving commands. A manual retry
    /// cuts the delay short.
    async fn wait(&mut self, delay: Duration) -> Wait {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return Wait::Elapsed,
                _ = &mut self.shutdown_rx => return Wait::Exit,
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        None => return Wait::Exit,
                        Some(Command::Retry { ack }) => {
                            self.waiters.push(ack);
                            return Wait::Elapsed;
                        }
                        Some(cmd) => {
                            if let Some(ack) =
                                hold(cmd, &mut self.outbox, &mut self.waiters, &mut self.token)
                            {
                                return Wait::Cancelled(ack);
                            }
                        }
                    }
                }
            }
        }
    }

    fn go_disconnected(&mut self, ack: oneshot::Sender<()>) {
        transition(&self.state_tx, ConnectionState::Disconnected);
        self.outbox.fail_all();
        self.fail_waiters(&HubError::NotConnected);
        let _ = ack.send(());
    }

    fn fail_waiters(&mut self, cause: &HubError) {
        for ack in self.waiters.drain(..) {
            let _ = ack.send(Err(replicate(cause)));
        }
    }
}

/// Decode one inbound frame and hand it to the hub. Malformed frames are
/// logged and dropped.
async fn forward(inbound_tx: &mpsc::Sender<ServerMessage>, text: &str) {
    match decode_frame(text) {
        Ok(message) => {
            if inbound_tx.send(message).await.is_err() {
                debug!("inbound receiver dropped");
            }
        }
        Err(e) => warn!(error = %e, "dropping inbound frame"),
    }
}

fn decode_frame(text: &str) -> Result<ServerMessage> {
    serde_json::from_str(text).map_err(|e| HubError::Protocol(format!("{e}; raw: {text}")))
}

/// Buffer a command that arrives while no transport is up. Returns the ack of
/// a `Disconnect` so the caller can unwind.
fn hold(
    cmd: Command,
    outbox: &mut Outbox,
    waiters: &mut Vec<oneshot::Sender<Result<()>>>,
    token: &mut Option<String>,
) -> Option<oneshot::Sender<()>> {
    match cmd {
        Command::Send { message, ack } => outbox.push(Outbound { message, ack }),
        Command::RefreshToken { token: fresh } => *token = Some(fresh),
        Command::Connect { token: fresh, ack } => {
            *token = Some(fresh);
            waiters.push(ack);
        }
        Command::Retry { ack } => waiters.push(ack),
        Command::Disconnect { ack } => return Some(ack),
    }
    None
}

fn transition(state_tx: &watch::Sender<ConnectionState>, next: ConnectionState) {
    let previous = state_tx.send_replace(next);
    if previous != next {
        info!(from = %previous, to = %next, "connection state changed");
    }
}

async fn write_frame(transport: &mut dyn Transport, message: &ClientMessage) -> Result<()> {
    let json = serde_json::to_string(message)?;
    debug!(kind = message.kind(), "sending frame");
    transport.send(json).await
}

/// `HubError` is not `Clone`; rebuild an equivalent error for each waiter.
fn replicate(cause: &HubError) -> HubError {
    match cause {
        HubError::Timeout => HubError::Timeout,
        HubError::NotConnected => HubError::NotConnected,
        HubError::AuthRejected(m) => HubError::AuthRejected(m.clone()),
        HubError::InvalidArgument(m) => HubError::InvalidArgument(m.clone()),
        HubError::Connection(m) => HubError::Connection(m.clone()),
        other => HubError::Connection(other.to_string()),
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    fn outbox(capacity: usize) -> (Outbox, Arc<AtomicUsize>) {
        let len = Arc::new(AtomicUsize::new(0));
        (Outbox::new(capacity, Arc::clone(&len)), len)
    }

    fn queued(message: ClientMessage) -> (Outbound, oneshot::Receiver<Result<()>>) {
        let (ack, rx) = oneshot::channel();
        (
            Outbound {
                message,
                ack: Some(ack),
            },
            rx,
        )
    }

    #[test]
    fn outbox_is_fifo_and_tracks_length() {
        let (mut outbox, len) = outbox(4);
        outbox.push(queued(ClientMessage::Ping).0);
        outbox.push(
            queued(ClientMessage::CallEnd {
                call_id: "c1".into(),
            })
            .0,
        );
        assert_eq!(len.load(Ordering::Acquire), 2);

        assert_eq!(outbox.pop().unwrap().message, ClientMessage::Ping);
        assert_eq!(len.load(Ordering::Acquire), 1);
        assert!(matches!(
            outbox.pop().unwrap().message,
            ClientMessage::CallEnd { .. }
        ));
        assert!(outbox.pop().is_none());
    }

    #[tokio::test]
    async fn outbox_rejects_when_full() {
        let (mut outbox, _len) = outbox(1);
        let (first, _first_rx) = queued(ClientMessage::Ping);
        let (second, second_rx) = queued(ClientMessage::Ping);
        outbox.push(first);
        outbox.push(second);

        let result = second_rx.await.unwrap();
        assert!(matches!(result, Err(HubError::QueueFull)));
    }

    #[tokio::test]
    async fn requeue_goes_to_the_front() {
        let (mut outbox, _len) = outbox(4);
        outbox.push(queued(ClientMessage::Ping).0);
        let (retry, _rx) = queued(ClientMessage::CallEnd {
            call_id: "c9".into(),
        });
        outbox.requeue(retry);
        assert!(matches!(
            outbox.pop().unwrap().message,
            ClientMessage::CallEnd { .. }
        ));
    }

    #[tokio::test]
    async fn fail_all_resolves_every_waiter_with_not_connected() {
        let (mut outbox, len) = outbox(4);
        let (a, a_rx) = queued(ClientMessage::Ping);
        let (b, b_rx) = queued(ClientMessage::Ping);
        outbox.push(a);
        outbox.push(b);
        outbox.fail_all();

        assert!(matches!(a_rx.await.unwrap(), Err(HubError::NotConnected)));
        assert!(matches!(b_rx.await.unwrap(), Err(HubError::NotConnected)));
        assert_eq!(len.load(Ordering::Acquire), 0);
    }

    #[test]
    fn hold_returns_disconnect_ack() {
        let (mut outbox, _len) = outbox(4);
        let mut waiters = Vec::new();
        let mut token = None;

        let (ack, _rx) = oneshot::channel();
        assert!(hold(
            Command::RefreshToken {
                token: "fresh".into()
            },
            &mut outbox,
            &mut waiters,
            &mut token
        )
        .is_none());
        assert_eq!(token.as_deref(), Some("fresh"));
        assert!(hold(Command::Disconnect { ack }, &mut outbox, &mut waiters, &mut token).is_some());
    }

    #[test]
    fn state_predicates() {
        assert!(ConnectionState::Connected.is_live());
        assert!(ConnectionState::Reconnecting.is_live());
        assert!(!ConnectionState::Failed.is_live());
        assert!(ConnectionState::Connecting.accepts_sends());
        assert!(!ConnectionState::Disconnected.accepts_sends());
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
    }

    #[test]
    fn replicate_preserves_timeout_and_auth() {
        assert!(matches!(replicate(&HubError::Timeout), HubError::Timeout));
        assert!(matches!(
            replicate(&HubError::AuthRejected("expired".into())),
            HubError::AuthRejected(m) if m == "expired"
        ));
        assert!(matches!(
            replicate(&HubError::TransportClosed),
            HubError::Connection(_)
        ));
    }

    #[test]
    fn malformed_frames_decode_to_protocol_errors() {
        let err = decode_frame(r#"{"type":"Teleport"}"#).unwrap_err();
        let HubError::Protocol(detail) = err else {
            panic!("expected a protocol error, got {err:?}");
        };
        assert!(detail.contains("Teleport"));
        assert_eq!(decode_frame(r#"{"type":"Pong"}"#).unwrap(), ServerMessage::Pong);
    }

    #[tokio::test]
    async fn forward_passes_good_frames_and_drops_bad_ones() {
        let (tx, mut rx) = mpsc::channel(4);
        forward(&tx, "garbage").await;
        forward(&tx, r#"{"type":"TokenRefreshed"}"#).await;
        drop(tx);
        assert_eq!(rx.recv().await, Some(ServerMessage::TokenRefreshed));
        assert_eq!(rx.recv().await, None);
    }
}
