//! Transport implementations for the signaling hub.
//!
//! Concrete [`Connector`](crate::transport::Connector) and
//! [`Transport`](crate::transport::Transport) implementations live behind
//! feature gates:
//!
//! | Feature                | Connector              | Transport              |
//! |------------------------|------------------------|------------------------|
//! | `transport-websocket`  | [`WebSocketConnector`] | [`WebSocketTransport`] |

#[cfg(feature = "transport-websocket")]
pub mod websocket;

#[cfg(feature = "transport-websocket")]
pub use websocket::{WebSocketConnector, WebSocketTransport};
