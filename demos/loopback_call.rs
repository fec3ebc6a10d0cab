//! # Loopback Call Example
//!
//! Runs a complete [`Hub`] against an in-process loopback "server" and walks
//! through one outgoing call: ring, answer, a presence push, hang-up.
//!
//! The same [`Connector`]/[`Transport`] pair is how you plug the hub into any
//! I/O layer other than the bundled WebSocket transport, and how you test UI
//! logic without a real server.
//!
//! ## Running
//!
//! ```sh
//! RUST_LOG=signal_hub_client=debug cargo run --example loopback_call
//! ```

use async_trait::async_trait;
use signal_hub_client::protocol::{
    CallAcceptedData, ChatMessage, ClientMessage, PresenceEntry, ServerMessage,
};
use signal_hub_client::{
    CallState, Connector, ConversationStore, Hub, HubConfig, HubError, HubEvent, Transport,
};
use tokio::sync::mpsc;

// ─────────────────────────────────────────────────────────────────────
// Step 1: A channel-backed transport and the connector that hands it out
// ─────────────────────────────────────────────────────────────────────

struct LoopbackTransport {
    tx: mpsc::UnboundedSender<String>,
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&mut self, message: String) -> Result<(), HubError> {
        self.tx
            .send(message)
            .map_err(|e| HubError::TransportSend(e.to_string()))
    }

    /// Cancel-safe because `UnboundedReceiver::recv` is.
    async fn recv(&mut self) -> Option<Result<String, HubError>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), HubError> {
        Ok(())
    }
}

/// Hands out a single transport; later dials fail as if the server were gone.
struct LoopbackConnector {
    transport: Option<LoopbackTransport>,
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&mut self, token: &str) -> Result<Box<dyn Transport>, HubError> {
        tracing::info!(token, "loopback dial");
        match self.transport.take() {
            Some(transport) => Ok(Box::new(transport)),
            None => Err(HubError::Connection("loopback already used".into())),
        }
    }
}

/// The "server side": read what the client sent, push what the hub would.
struct LoopbackServer {
    rx: mpsc::UnboundedReceiver<String>,
    tx: mpsc::UnboundedSender<String>,
}

impl LoopbackServer {
    async fn next(&mut self) -> Result<ClientMessage, Box<dyn std::error::Error>> {
        let text = self.rx.recv().await.ok_or("client went away")?;
        Ok(serde_json::from_str(&text)?)
    }

    fn push(&self, message: &ServerMessage) -> Result<(), Box<dyn std::error::Error>> {
        self.tx.send(serde_json::to_string(message)?)?;
        Ok(())
    }
}

fn loopback() -> (LoopbackConnector, LoopbackServer) {
    let (client_tx, server_rx) = mpsc::unbounded_channel();
    let (server_tx, client_rx) = mpsc::unbounded_channel();
    let connector = LoopbackConnector {
        transport: Some(LoopbackTransport {
            tx: client_tx,
            rx: client_rx,
        }),
    };
    let server = LoopbackServer {
        rx: server_rx,
        tx: server_tx,
    };
    (connector, server)
}

// ─────────────────────────────────────────────────────────────────────
// Step 2: A read-model that just logs what it is asked to do
// ─────────────────────────────────────────────────────────────────────

struct LoggingStore;

impl ConversationStore for LoggingStore {
    fn invalidate_messages(&self, conversation_id: &str) {
        tracing::info!(conversation_id, "store: invalidate messages");
    }

    fn refresh_summary(&self, conversation_id: &str, latest: &ChatMessage) {
        tracing::info!(conversation_id, message = %latest.id, "store: refresh summary");
    }
}

// ─────────────────────────────────────────────────────────────────────
// Step 3: Drive a call end to end
// ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let (connector, mut server) = loopback();
    let hub = Hub::start(connector, LoggingStore, HubConfig::new("alice"));

    // Funnel events into a channel so main can await the ones it cares about.
    let (event_tx, mut events) = mpsc::unbounded_channel();
    let _all = hub.events().on_any(move |event| {
        tracing::info!(kind = ?event.kind(), "event");
        let _ = event_tx.send(event.clone());
    });

    hub.connect("demo-token").await?;

    // ── Outgoing call ───────────────────────────────────────────────
    let session = hub.calls().place_call("bob")?;
    let ClientMessage::CallInitiate { call_id, .. } = server.next().await? else {
        return Err("expected call-initiate".into());
    };
    tracing::info!(%call_id, "server: ringing bob");

    server.push(&ServerMessage::CallAccepted(CallAcceptedData {
        call_id: call_id.clone(),
        session_description: None,
    }))?;
    server.push(&ServerMessage::UserStatusChanged(PresenceEntry {
        user_id: "bob".into(),
        is_online: true,
        last_active_at: chrono::Utc::now(),
    }))?;

    while let Some(event) = events.recv().await {
        if let HubEvent::CallStateChanged(Some(call)) = &event {
            if call.state == CallState::Active {
                tracing::info!(call_id = %call.call_id, "call connected");
                break;
            }
        }
    }

    // ── Hang up ─────────────────────────────────────────────────────
    hub.calls().toggle_media(signal_hub_client::MediaKind::Video, true)?;
    hub.calls().hang_up()?;
    while let Ok(frame) = server.next().await {
        tracing::info!(kind = frame.kind(), "server received");
        if matches!(frame, ClientMessage::CallEnd { .. }) {
            break;
        }
    }
    hub.calls().acknowledge()?;

    tracing::info!(
        online = ?hub.presence().online_users(),
        call = %session.call_id,
        "done"
    );
    hub.shutdown().await;
    Ok(())
}
