//! Transport abstraction for the signaling hub.
//!
//! The [`Transport`] trait defines a bidirectional text message channel between
//! the client and the hub. Every frame is one complete JSON document, so
//! implementations handle message framing internally (WebSocket frames,
//! length-prefixed TCP, an in-process channel in tests, ...).
//!
//! Because the connection manager reconnects on its own, it cannot be handed a
//! single pre-connected transport. Instead it owns a [`Connector`], a factory
//! that opens a fresh authenticated [`Transport`] for a given session token.
//!
//! # Implementing a Custom Transport
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use signal_hub_client::error::HubError;
//! use signal_hub_client::transport::{Connector, Transport};
//!
//! struct MyTransport { /* ... */ }
//!
//! #[async_trait]
//! impl Transport for MyTransport {
//!     async fn send(&mut self, message: String) -> Result<(), HubError> {
//!         // Send the JSON text frame
//!         todo!()
//!     }
//!
//!     async fn recv(&mut self) -> Option<Result<String, HubError>> {
//!         // Receive the next JSON text frame; None on clean close
//!         todo!()
//!     }
//!
//!     async fn close(&mut self) -> Result<(), HubError> {
//!         todo!()
//!     }
//! }
//!
//! struct MyConnector;
//!
//! #[async_trait]
//! impl Connector for MyConnector {
//!     async fn connect(&mut self, token: &str) -> Result<Box<dyn Transport>, HubError> {
//!         // Dial the hub, presenting `token`
//!         todo!()
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::error::HubError;

/// A bidirectional text message transport.
///
/// # Object Safety
///
/// This trait is object-safe; the connection manager stores the active
/// transport as `Box<dyn Transport>`.
///
/// # Cancel Safety
///
/// The [`recv`](Transport::recv) method **MUST** be cancel-safe because it is used
/// inside `tokio::select!`. If `recv` is cancelled before completion, calling it
/// again must not lose data. Channel-based implementations (e.g., wrapping
/// `mpsc::Receiver`) are naturally cancel-safe.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Send one JSON text frame to the server.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::TransportSend`] if the frame could not be sent.
    async fn send(&mut self, message: String) -> Result<(), HubError>;

    /// Receive the next JSON text frame from the server.
    ///
    /// Returns:
    /// - `Some(Ok(text))`: a complete frame was received
    /// - `Some(Err(e))`: a transport error occurred
    /// - `None`: the connection was closed cleanly by the server
    async fn recv(&mut self) -> Option<Result<String, HubError>>;

    /// Close the transport connection gracefully.
    ///
    /// # Errors
    ///
    /// Returns an error if the graceful shutdown fails. Implementations should
    /// still release resources even if the close handshake fails.
    async fn close(&mut self) -> Result<(), HubError>;

    /// Whether the server accepts a `refresh-token` frame on this connection.
    ///
    /// When `false`, a token refresh closes this transport and dials a new one
    /// with the fresh token.
    fn supports_live_reauth(&self) -> bool {
        false
    }
}

/// Opens authenticated transports to the hub.
#[async_trait]
pub trait Connector: Send + 'static {
    /// Dial the hub and authenticate with `token`.
    ///
    /// # Errors
    ///
    /// [`HubError::AuthRejected`] when the server refuses the token, any
    /// other transient error when the server cannot be reached.
    async fn connect(&mut self, token: &str) -> Result<Box<dyn Transport>, HubError>;
}
