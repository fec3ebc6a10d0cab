//! The assembled client.
//!
//! [`Hub::start`] wires a [`ConnectionManager`] to the presence tracker, the
//! call state machine, and the message bridge, then spawns the single task
//! that routes inbound server messages to them in arrival order.
//!
//! # Example
//!
//! ```rust,ignore
//! let hub = Hub::start(connector, store, HubConfig::new("alice"));
//! let _calls = hub.on(EventKind::IncomingCall, |event| {
//!     if let HubEvent::IncomingCall(session) = event {
//!         println!("{} is calling", session.peer_user_id);
//!     }
//! });
//! hub.connect(session_token).await?;
//! let session = hub.calls().place_call("bob")?;
//! ```

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::call::CallMachine;
use crate::config::HubConfig;
use crate::connection::{ConnectionManager, ConnectionState, SignalSink};
use crate::dispatcher::{EventDispatcher, Subscription};
use crate::error::Result;
use crate::event::{EventKind, HubEvent};
use crate::lock::lock;
use crate::messages::{ConversationStore, MessageBridge};
use crate::presence::PresenceTracker;
use crate::protocol::ServerMessage;
use crate::transport::Connector;

/// Handle to a running signaling hub.
pub struct Hub {
    connection: Arc<ConnectionManager>,
    dispatcher: EventDispatcher,
    presence: PresenceTracker,
    calls: CallMachine,
    messages: MessageBridge,
    router: Mutex<Option<JoinHandle<()>>>,
    shutdown_timeout: Duration,
}

impl Hub {
    /// Build every component and spawn the routing task. The connection
    /// starts `Disconnected`; call [`connect`](Self::connect) next.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        connector: impl Connector,
        store: impl ConversationStore + 'static,
        config: HubConfig,
    ) -> Self {
        let (connection, inbound) = ConnectionManager::new(connector, &config);
        let connection = Arc::new(connection);
        let sink: Arc<dyn SignalSink> = Arc::clone(&connection) as Arc<dyn SignalSink>;

        let dispatcher = EventDispatcher::new();
        let presence = PresenceTracker::new(Arc::clone(&sink), dispatcher.clone(), &config);
        let calls = CallMachine::new(sink, dispatcher.clone(), &config);
        let messages = MessageBridge::new(Arc::new(store), dispatcher.clone(), &config);

        let router = Router {
            dispatcher: dispatcher.clone(),
            presence: presence.clone(),
            calls: calls.clone(),
            messages: messages.clone(),
            state_rx: connection.subscribe_state(),
            last_state: ConnectionState::Disconnected,
        };
        let task = tokio::spawn(router.run(inbound));

        info!(user = %config.local_user_id, "hub started");
        Self {
            connection,
            dispatcher,
            presence,
            calls,
            messages,
            router: Mutex::new(Some(task)),
            shutdown_timeout: config.shutdown_timeout,
        }
    }

    /// Open the signaling connection. See [`ConnectionManager::connect`].
    ///
    /// # Errors
    ///
    /// The dial error; the connection is left in `Failed`.
    pub async fn connect(&self, token: impl Into<String>) -> Result<()> {
        self.connection.connect(token).await
    }

    /// Retry after the connection failed. See [`ConnectionManager::retry`].
    ///
    /// # Errors
    ///
    /// The dial error.
    pub async fn retry(&self) -> Result<()> {
        self.connection.retry().await
    }

    /// Close the signaling connection.
    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    /// Swap the session token. See [`ConnectionManager::refresh_token`].
    ///
    /// # Errors
    ///
    /// [`HubError::NotConnected`](crate::error::HubError::NotConnected) after
    /// shutdown.
    pub fn refresh_token(&self, token: impl Into<String>) -> Result<()> {
        self.connection.refresh_token(token)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Subscribe `handler` to events of `kind`.
    #[must_use = "dropping the subscription immediately unsubscribes the handler"]
    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&HubEvent) + Send + Sync + 'static,
    {
        self.dispatcher.on(kind, handler)
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn events(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn calls(&self) -> &CallMachine {
        &self.calls
    }

    pub fn messages(&self) -> &MessageBridge {
        &self.messages
    }

    /// Stop the connection and the routing task. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.connection.shutdown().await;

        // The router exits once the connection loop drops its state sender.
        let task = lock(&self.router).take();
        if let Some(mut task) = task {
            if tokio::time::timeout(self.shutdown_timeout, &mut task)
                .await
                .is_err()
            {
                warn!("router did not exit within timeout; aborting task");
                task.abort();
            }
        }
        info!("hub shut down");
    }
}

impl fmt::Debug for Hub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hub")
            .field("connection", &self.connection)
            .field("calls", &self.calls)
            .field("presence", &self.presence)
            .field("messages", &self.messages)
            .finish()
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.router).take() {
            task.abort();
        }
        // Component clones held elsewhere keep the manager alive; stop its loop anyway.
        self.connection.abort();
    }
}

// ── Routing ─────────────────────────────────────────────────────────

/// The single processing sequence for inbound messages.
struct Router {
    dispatcher: EventDispatcher,
    presence: PresenceTracker,
    calls: CallMachine,
    messages: MessageBridge,
    state_rx: watch::Receiver<ConnectionState>,
    last_state: ConnectionState,
}

impl Router {
    async fn run(mut self, mut inbound: mpsc::Receiver<ServerMessage>) {
        debug!("router started");
        loop {
            tokio::select! {
                // State first, so frames are never routed against a stale state.
                biased;

                changed = self.state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *self.state_rx.borrow_and_update();
                    self.on_state(state);
                }

                message = inbound.recv() => {
                    let Some(message) = message else {
                        break;
                    };
                    self.route(message);
                }
            }
        }

        self.on_state(ConnectionState::Disconnected);
        debug!("router exited");
    }

    fn on_state(&mut self, state: ConnectionState) {
        if state == self.last_state {
            return;
        }
        self.last_state = state;

        if !state.accepts_sends() {
            self.calls.signaling_lost();
            self.presence.abandon_queries();
        }
        self.dispatcher
            .emit(&HubEvent::ConnectionStateChanged(state));
    }

    fn route(&self, message: ServerMessage) {
        if !self.last_state.is_live() {
            debug!(state = %self.last_state, "dropping inbound message while offline");
            return;
        }

        match message {
            ServerMessage::IncomingCall(data) => self.calls.handle_incoming(data),
            ServerMessage::CallAccepted(data) => self.calls.handle_accepted(data),
            ServerMessage::CallDeclined(data) => self.calls.handle_declined(data),
            ServerMessage::CallFailed(data) => self.calls.handle_failed(data),
            ServerMessage::CallEnded(data) => self.calls.handle_ended(data),
            ServerMessage::MediaStateUpdate(update) => self.calls.handle_media_update(update),
            ServerMessage::UserStatusChanged(entry) => self.presence.handle_status(entry),
            ServerMessage::PresenceSnapshot(snapshot) => self.presence.handle_snapshot(snapshot),
            ServerMessage::NewMessage(data) => self.messages.handle_new_message(data),
            ServerMessage::TokenRefreshed => debug!("session token refreshed in place"),
            ServerMessage::Pong => debug!("pong"),
            ServerMessage::AuthenticationError { message } => {
                warn!(%message, "server rejected session token");
                self.dispatcher
                    .emit(&HubEvent::AuthenticationFailed { message });
            }
            ServerMessage::Error { message } => {
                warn!(%message, "server error");
                self.dispatcher.emit(&HubEvent::ServerError { message });
            }
        }
    }
}
