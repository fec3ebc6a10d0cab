#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared test utilities for the hub client integration tests.
//!
//! Provides a scriptable [`FakeConnector`] whose dials hand out in-process
//! [`ChannelTransport`]s. Each accepted dial returns a [`ServerEnd`] the test
//! uses to push server frames and read what the client sent.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use signal_hub_client::dispatcher::{EventDispatcher, Subscription};
use signal_hub_client::protocol::{ChatMessage, ClientMessage, ServerMessage};
use signal_hub_client::{Connector, ConversationStore, HubError, HubEvent, Transport};
use tokio::sync::mpsc;

// ── Tracing ─────────────────────────────────────────────────────────

/// Install a test subscriber honouring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ── ChannelTransport ────────────────────────────────────────────────

/// Client half of an in-process connection.
pub struct ChannelTransport {
    to_server: mpsc::UnboundedSender<String>,
    from_server: mpsc::UnboundedReceiver<String>,
    closed: Arc<AtomicBool>,
    live_reauth: bool,
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&mut self, message: String) -> Result<(), HubError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(HubError::TransportClosed);
        }
        self.to_server
            .send(message)
            .map_err(|e| HubError::TransportSend(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, HubError>> {
        self.from_server.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), HubError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn supports_live_reauth(&self) -> bool {
        self.live_reauth
    }
}

/// Server half of an in-process connection.
pub struct ServerEnd {
    frames: mpsc::UnboundedReceiver<String>,
    tx: Option<mpsc::UnboundedSender<String>>,
    closed: Arc<AtomicBool>,
}

impl ServerEnd {
    /// Deliver a server message to the client.
    pub fn push(&self, message: &ServerMessage) {
        self.push_raw(&serde_json::to_string(message).unwrap());
    }

    /// Deliver a raw text frame to the client.
    pub fn push_raw(&self, text: &str) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(text.to_owned());
        }
    }

    /// Next frame the client sent, decoded. Panics after five (virtual)
    /// seconds of silence.
    pub async fn next_frame(&mut self) -> ClientMessage {
        let text = tokio::time::timeout(Duration::from_secs(5), self.frames.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("client side dropped");
        serde_json::from_str(&text).unwrap()
    }

    /// Frames already sent by the client, without waiting.
    pub fn drain(&mut self) -> Vec<ClientMessage> {
        let mut frames = Vec::new();
        while let Ok(text) = self.frames.try_recv() {
            frames.push(serde_json::from_str(&text).unwrap());
        }
        frames
    }

    /// Simulate network loss: the client's `recv` yields `None`.
    pub fn drop_connection(&mut self) {
        self.tx = None;
    }

    /// Whether the client closed its half.
    pub fn client_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn channel_pair(live_reauth: bool) -> (ChannelTransport, ServerEnd) {
    let (client_tx, server_rx) = mpsc::unbounded_channel();
    let (server_tx, client_rx) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));
    let transport = ChannelTransport {
        to_server: client_tx,
        from_server: client_rx,
        closed: Arc::clone(&closed),
        live_reauth,
    };
    let server = ServerEnd {
        frames: server_rx,
        tx: Some(server_tx),
        closed,
    };
    (transport, server)
}

// ── FakeConnector ───────────────────────────────────────────────────

enum ScriptedDial {
    Accept(ChannelTransport),
    Reject(HubError),
}

type Script = Arc<StdMutex<VecDeque<ScriptedDial>>>;

/// A connector that answers dials from a script. Unscripted dials fail with
/// a transient connection error.
pub struct FakeConnector {
    script: Script,
    tokens: Arc<StdMutex<Vec<String>>>,
}

/// Test-side handle that scripts the dials of a [`FakeConnector`].
#[derive(Clone)]
pub struct DialScript {
    script: Script,
    tokens: Arc<StdMutex<Vec<String>>>,
}

pub fn fake_connector() -> (FakeConnector, DialScript) {
    let script: Script = Arc::new(StdMutex::new(VecDeque::new()));
    let tokens = Arc::new(StdMutex::new(Vec::new()));
    (
        FakeConnector {
            script: Arc::clone(&script),
            tokens: Arc::clone(&tokens),
        },
        DialScript { script, tokens },
    )
}

impl DialScript {
    /// The next dial succeeds; the returned end drives that connection.
    pub fn accept(&self) -> ServerEnd {
        self.accept_with_reauth(false)
    }

    pub fn accept_with_reauth(&self, live_reauth: bool) -> ServerEnd {
        let (transport, server) = channel_pair(live_reauth);
        self.script
            .lock()
            .unwrap()
            .push_back(ScriptedDial::Accept(transport));
        server
    }

    /// The next dial fails with `error`.
    pub fn reject(&self, error: HubError) {
        self.script
            .lock()
            .unwrap()
            .push_back(ScriptedDial::Reject(error));
    }

    /// Tokens presented so far, one per dial.
    pub fn tokens(&self) -> Vec<String> {
        self.tokens.lock().unwrap().clone()
    }

    pub fn dials(&self) -> usize {
        self.tokens.lock().unwrap().len()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&mut self, token: &str) -> Result<Box<dyn Transport>, HubError> {
        self.tokens.lock().unwrap().push(token.to_owned());
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(ScriptedDial::Accept(transport)) => Ok(Box::new(transport)),
            Some(ScriptedDial::Reject(error)) => Err(error),
            None => Err(HubError::Connection("no server scripted".into())),
        }
    }
}

// ── Read-model and events ───────────────────────────────────────────

/// A conversation store that records every call.
#[derive(Clone, Default)]
pub struct RecordingStore {
    pub calls: Arc<StdMutex<Vec<String>>>,
}

impl ConversationStore for RecordingStore {
    fn invalidate_messages(&self, conversation_id: &str) {
        self.calls
            .lock()
            .unwrap()
            .push(format!("invalidate:{conversation_id}"));
    }

    fn refresh_summary(&self, conversation_id: &str, latest: &ChatMessage) {
        self.calls
            .lock()
            .unwrap()
            .push(format!("summary:{conversation_id}:{}", latest.id));
    }
}

/// Every event seen by an `on_any` subscription.
pub struct EventLog {
    events: Arc<StdMutex<Vec<HubEvent>>>,
    _subscription: Subscription,
}

impl EventLog {
    pub fn attach(dispatcher: &EventDispatcher) -> Self {
        let events = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let subscription = dispatcher.on_any(move |event| sink.lock().unwrap().push(event.clone()));
        Self {
            events,
            _subscription: subscription,
        }
    }

    pub fn snapshot(&self) -> Vec<HubEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn contains(&self, predicate: impl Fn(&HubEvent) -> bool) -> bool {
        self.events.lock().unwrap().iter().any(predicate)
    }
}

/// Poll `condition` until it holds, letting background tasks and (paused)
/// time make progress. Panics after ten virtual seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
