//! Configuration for the hub client.
//!
//! # Example
//!
//! ```
//! use signal_hub_client::config::HubConfig;
//! use std::time::Duration;
//!
//! let config = HubConfig::new("user-42")
//!     .with_ring_timeout(Duration::from_secs(45))
//!     .with_outbound_queue_capacity(128);
//! assert_eq!(config.local_user_id, "user-42");
//! assert_eq!(config.ring_timeout, Duration::from_secs(45));
//! ```

use std::time::Duration;

use crate::backoff::ReconnectPolicy;
use crate::protocol::{MediaState, UserId};

/// Default time an unanswered call may ring.
const DEFAULT_RING_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on a single transport dial.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on a presence batch query round-trip.
const DEFAULT_PRESENCE_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default capacity of the outbound buffer used while reconnecting.
const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 64;

/// Default capacity of the decoded inbound message channel.
const DEFAULT_INBOUND_CHANNEL_CAPACITY: usize = 256;

/// Default timeout for the graceful shutdown.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Default keepalive interval.
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

/// Configuration shared by the connection manager and the hub components.
///
/// The only required field is the local user id; everything else has
/// defaults suited to an interactive chat/call client.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// The signed-in user. Used to reject self-calls and to skip unread
    /// counting for our own messages.
    pub local_user_id: UserId,
    /// How long an outgoing or incoming call may ring before it is forced to
    /// a terminal state. Defaults to **30 seconds**.
    pub ring_timeout: Duration,
    /// Bound on one transport dial. Defaults to **10 seconds**.
    pub connect_timeout: Duration,
    /// Bound on a presence batch query. Defaults to **10 seconds**.
    pub presence_query_timeout: Duration,
    /// Reconnection backoff policy.
    pub reconnect: ReconnectPolicy,
    /// Capacity of the outbound buffer while connecting or reconnecting.
    ///
    /// Defaults to **64**. Values below 1 are clamped to 1.
    pub outbound_queue_capacity: usize,
    /// Capacity of the decoded inbound message channel.
    ///
    /// When the hub falls behind, the connection loop waits for room instead
    /// of dropping frames. Defaults to **256**. Values below 1 are clamped
    /// to 1.
    pub inbound_channel_capacity: usize,
    /// Keepalive interval while connected. `None` or a zero period disables
    /// pings.
    /// Defaults to **25 seconds**.
    pub heartbeat_interval: Option<Duration>,
    /// Timeout for the graceful shutdown of the background connection task.
    ///
    /// Defaults to **1 second**. A zero timeout aborts the task immediately.
    pub shutdown_timeout: Duration,
    /// Media used by `place_call` when the caller does not choose.
    pub default_media: MediaState,
}

impl HubConfig {
    /// Create a configuration for `local_user_id` with default values.
    pub fn new(local_user_id: impl Into<UserId>) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            ring_timeout: DEFAULT_RING_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            presence_query_timeout: DEFAULT_PRESENCE_QUERY_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
            outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
            inbound_channel_capacity: DEFAULT_INBOUND_CHANNEL_CAPACITY,
            heartbeat_interval: Some(DEFAULT_HEARTBEAT_INTERVAL),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            default_media: MediaState::audio_only(),
        }
    }

    /// Set the ring timeout.
    #[must_use]
    pub fn with_ring_timeout(mut self, timeout: Duration) -> Self {
        self.ring_timeout = timeout;
        self
    }

    /// Set the per-dial connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the presence query timeout.
    #[must_use]
    pub fn with_presence_query_timeout(mut self, timeout: Duration) -> Self {
        self.presence_query_timeout = timeout;
        self
    }

    /// Replace the reconnection policy.
    #[must_use]
    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Set the outbound queue capacity. Values below 1 are clamped to 1.
    #[must_use]
    pub fn with_outbound_queue_capacity(mut self, capacity: usize) -> Self {
        self.outbound_queue_capacity = capacity.max(1);
        self
    }

    /// Set the inbound channel capacity. Values below 1 are clamped to 1.
    #[must_use]
    pub fn with_inbound_channel_capacity(mut self, capacity: usize) -> Self {
        self.inbound_channel_capacity = capacity.max(1);
        self
    }

    /// Set or disable the keepalive interval.
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Option<Duration>) -> Self {
        self.heartbeat_interval = interval.filter(|d| !d.is_zero());
        self
    }

    /// Set the graceful shutdown timeout.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set the media `place_call` starts with.
    #[must_use]
    pub fn with_default_media(mut self, media: MediaState) -> Self {
        self.default_media = media;
        self
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = HubConfig::new("me");
        assert_eq!(config.local_user_id, "me");
        assert_eq!(config.ring_timeout, Duration::from_secs(30));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.outbound_queue_capacity, 64);
        assert_eq!(config.inbound_channel_capacity, 256);
        assert_eq!(config.heartbeat_interval, Some(Duration::from_secs(25)));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(1));
        assert_eq!(config.default_media, MediaState::audio_only());
    }

    #[test]
    fn capacities_are_clamped_to_one() {
        let config = HubConfig::new("me")
            .with_outbound_queue_capacity(0)
            .with_inbound_channel_capacity(0);
        assert_eq!(config.outbound_queue_capacity, 1);
        assert_eq!(config.inbound_channel_capacity, 1);
    }

    #[test]
    fn zero_heartbeat_disables_pings() {
        let config = HubConfig::new("me").with_heartbeat_interval(Some(Duration::ZERO));
        assert!(config.heartbeat_interval.is_none());
    }
}
