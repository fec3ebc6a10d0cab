//! # Signal Hub Client
//!
//! Transport-agnostic real-time layer for a chat and calling client.
//!
//! One persistent, authenticated signaling connection carries three concerns:
//! user presence, call setup and teardown, and new-message notification. The
//! crate turns that noisy event stream into consistent local state and typed
//! events for the UI.
//!
//! ## Components
//!
//! - [`ConnectionManager`]: connect, reconnect with backoff, token refresh,
//!   buffered sends.
//! - [`EventDispatcher`]: typed publish/subscribe with RAII subscriptions.
//! - [`PresenceTracker`]: newer-wins presence cache with batch queries.
//! - [`CallMachine`]: the single-call state machine with ring timeouts.
//! - [`MessageBridge`]: new-message routing into the chat read-model.
//! - [`Hub`]: all of the above wired together.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use signal_hub_client::{EventKind, Hub, HubConfig, HubEvent, WebSocketConnector};
//!
//! let hub = Hub::start(
//!     WebSocketConnector::new("wss://hub.example.com/signal"),
//!     my_store,
//!     HubConfig::new("alice"),
//! );
//! let _ringing = hub.on(EventKind::IncomingCall, |event| {
//!     if let HubEvent::IncomingCall(call) = event {
//!         println!("{} is calling", call.peer_user_id);
//!     }
//! });
//! hub.connect(session_token).await?;
//! hub.calls().place_call("bob")?;
//! ```

pub mod backoff;
pub mod call;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod hub;
mod lock;
pub mod messages;
pub mod presence;
pub mod protocol;
pub mod reason;
pub mod transport;
pub mod transports;

// Re-export primary types for ergonomic imports.
pub use backoff::ReconnectPolicy;
pub use call::{CallDirection, CallMachine, CallSession, CallState};
pub use config::HubConfig;
pub use connection::{ConnectionManager, ConnectionState, SignalSink};
pub use dispatcher::{EventDispatcher, Subscription, SubscriptionId};
pub use error::{HubError, Result};
pub use event::{EventKind, HubEvent};
pub use hub::Hub;
pub use messages::{ConversationStore, MessageBridge};
pub use presence::PresenceTracker;
pub use protocol::{ClientMessage, MediaKind, MediaState, PresenceEntry, ServerMessage};
pub use reason::CallReason;
pub use transport::{Connector, Transport};

#[cfg(feature = "transport-websocket")]
pub use transports::{WebSocketConnector, WebSocketTransport};
