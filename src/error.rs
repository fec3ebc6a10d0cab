//! Error types for the signaling hub client.

use thiserror::Error;

/// Errors that can occur when using the hub client.
#[derive(Debug, Error)]
pub enum HubError {
    /// Failed to send a frame through the transport.
    #[error("transport send error: {0}")]
    TransportSend(String),

    /// Failed to receive a frame from the transport.
    #[error("transport receive error: {0}")]
    TransportReceive(String),

    /// The transport connection was closed unexpectedly.
    #[error("transport connection closed")]
    TransportClosed,

    /// The signaling server could not be reached.
    #[error("connection error: {0}")]
    Connection(String),

    /// The server rejected the session token.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// Failed to serialize or deserialize a protocol message.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An inbound frame was well-formed JSON but made no sense in context.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Attempted an operation that requires an active connection, but the
    /// connection is disconnected or has failed.
    #[error("not connected to server")]
    NotConnected,

    /// The outbound buffer used while reconnecting is full.
    #[error("outbound queue is full")]
    QueueFull,

    /// The operation is not valid for the current call or presence state.
    /// Nothing was sent over the wire.
    #[error("cannot {operation} while {state}")]
    StateConflict {
        /// The rejected operation, e.g. `"accept"`.
        operation: &'static str,
        /// Human-readable description of the state that blocked it.
        state: String,
    },

    /// A caller-supplied argument was rejected before anything was sent.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HubError {
    /// Returns `true` for errors the connection manager recovers from by
    /// reconnecting with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TransportSend(_)
                | Self::TransportReceive(_)
                | Self::TransportClosed
                | Self::Connection(_)
                | Self::Timeout
                | Self::Io(_)
        )
    }
}

/// A specialized [`Result`] type for hub client operations.
pub type Result<T> = std::result::Result<T, HubError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn state_conflict_message_names_operation_and_state() {
        let err = HubError::StateConflict {
            operation: "accept",
            state: "idle".into(),
        };
        assert_eq!(err.to_string(), "cannot accept while idle");
        assert!(!err.is_transient());
    }

    #[test]
    fn transport_errors_are_transient() {
        assert!(HubError::TransportClosed.is_transient());
        assert!(HubError::Connection("refused".into()).is_transient());
        assert!(!HubError::NotConnected.is_transient());
        assert!(!HubError::QueueFull.is_transient());
        assert!(!HubError::AuthRejected("expired".into()).is_transient());
    }
}
