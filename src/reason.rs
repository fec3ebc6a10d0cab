//! Reason codes carried by call-terminating signals.
//!
//! These codes travel on the wire as `snake_case` strings (e.g. `"busy"`).
//! Unrecognized strings from a newer server decode as [`CallReason::Unknown`]
//! so a single unexpected value never poisons the whole frame.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a call was declined, failed, or ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallReason {
    // Callee decisions
    Declined,
    Busy,
    Missed,

    // Local or remote hang-up
    HangUp,
    RemoteHangUp,
    Cancelled,

    // Failures
    Timeout,
    PeerUnavailable,
    SignalingUnavailable,
    MediaError,

    /// Any reason string this client does not recognize.
    #[serde(other)]
    Unknown,
}

impl CallReason {
    /// Returns a human-readable description suitable for a call toast.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Declined => "The call was declined.",
            Self::Busy => "The other person is already on a call.",
            Self::Missed => "The call was not answered.",
            Self::HangUp => "You ended the call.",
            Self::RemoteHangUp => "The other person ended the call.",
            Self::Cancelled => "The call was cancelled before it was answered.",
            Self::Timeout => "Nobody answered before the ring timeout expired.",
            Self::PeerUnavailable => "The other person is offline or cannot be reached.",
            Self::SignalingUnavailable => {
                "The signaling connection is unavailable. Check your network and try again."
            }
            Self::MediaError => "The call failed because audio or video could not be set up.",
            Self::Unknown => "The call ended for an unknown reason.",
        }
    }

    /// Returns `true` if the reason describes a failure rather than a
    /// deliberate decision by one of the participants.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::Timeout
                | Self::PeerUnavailable
                | Self::SignalingUnavailable
                | Self::MediaError
                | Self::Busy
                | Self::Unknown
        )
    }
}

impl fmt::Display for CallReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn busy_serializes_as_lowercase_string() {
        assert_eq!(serde_json::to_string(&CallReason::Busy).unwrap(), "\"busy\"");
        assert_eq!(
            serde_json::to_string(&CallReason::RemoteHangUp).unwrap(),
            "\"remote_hang_up\""
        );
    }

    #[test]
    fn unrecognized_reason_decodes_as_unknown() {
        let reason: CallReason = serde_json::from_str("\"carrier_pigeon_lost\"").unwrap();
        assert_eq!(reason, CallReason::Unknown);
    }

    #[test]
    fn decisions_are_not_failures() {
        assert!(!CallReason::Declined.is_failure());
        assert!(!CallReason::HangUp.is_failure());
        assert!(CallReason::Timeout.is_failure());
    }
}
