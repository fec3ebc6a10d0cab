//! Wire protocol types for the signaling hub.
//!
//! Frames are JSON text messages, adjacently tagged as
//! `{"type": "<Variant>", "data": {…}}`. Field names are `camelCase` on the
//! wire. Outbound tags are kebab-case (`call-initiate`), inbound tags are the
//! server's PascalCase names (`IncomingCall`).
//!
//! Media negotiation parameters (SDP offers/answers and the like) are opaque
//! to this crate and pass through as raw JSON in `session_description`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::reason::CallReason;

// ── Type aliases ────────────────────────────────────────────────────

/// Identifier of a user account.
pub type UserId = String;

/// Identifier of a single call attempt.
pub type CallId = String;

/// Identifier of a chat conversation.
pub type ConversationId = String;

/// Correlation id for a presence batch query.
pub type RequestId = Uuid;

// ── Shared structs ──────────────────────────────────────────────────

/// Which half of the media state a toggle applies to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Microphone/camera state of one call participant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MediaState {
    pub audio_enabled: bool,
    pub video_enabled: bool,
}

impl MediaState {
    /// Audio on, camera off.
    pub const fn audio_only() -> Self {
        Self {
            audio_enabled: true,
            video_enabled: false,
        }
    }

    /// Audio and camera on.
    pub const fn audio_video() -> Self {
        Self {
            audio_enabled: true,
            video_enabled: true,
        }
    }

    /// Return a copy with one media kind switched.
    #[must_use]
    pub fn with(mut self, kind: MediaKind, enabled: bool) -> Self {
        match kind {
            MediaKind::Audio => self.audio_enabled = enabled,
            MediaKind::Video => self.video_enabled = enabled,
        }
        self
    }
}

impl Default for MediaState {
    fn default() -> Self {
        Self::audio_only()
    }
}

/// Online/offline status of one user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub user_id: UserId,
    pub is_online: bool,
    pub last_active_at: DateTime<Utc>,
}

/// A chat message as announced by the hub. The body is kept opaque; the
/// chat read-model owns its interpretation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
}

// ── Inbound payload structs ─────────────────────────────────────────

/// Payload of the `IncomingCall` server message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IncomingCallData {
    pub call_id: CallId,
    pub from_user_id: UserId,
    /// Media the caller starts with.
    #[serde(default)]
    pub media: MediaState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_description: Option<serde_json::Value>,
}

/// Payload of the `CallAccepted` server message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CallAcceptedData {
    pub call_id: CallId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_description: Option<serde_json::Value>,
}

/// Payload of the `CallDeclined` server message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CallDeclinedData {
    pub call_id: CallId,
    pub reason: CallReason,
}

/// Payload of the `CallFailed` server message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CallFailedData {
    pub call_id: CallId,
    pub reason: CallReason,
}

/// Payload of the `CallEnded` server message (the peer hung up).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CallEndedData {
    pub call_id: CallId,
}

/// Payload of the `MediaStateUpdate` server message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MediaStateUpdate {
    pub call_id: CallId,
    pub audio_enabled: bool,
    pub video_enabled: bool,
}

impl MediaStateUpdate {
    pub fn media(&self) -> MediaState {
        MediaState {
            audio_enabled: self.audio_enabled,
            video_enabled: self.video_enabled,
        }
    }
}

/// Payload of the `PresenceSnapshot` server message, the answer to a
/// `presence-query`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceSnapshot {
    pub request_id: RequestId,
    #[serde(default)]
    pub entries: Vec<PresenceEntry>,
}

/// Payload of the `NewMessage` server message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewMessageData {
    pub conversation_id: ConversationId,
    pub message: ChatMessage,
}

// ── Messages ────────────────────────────────────────────────────────

/// Frames sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    /// Ring a peer.
    CallInitiate {
        call_id: CallId,
        peer_user_id: UserId,
        audio_enabled: bool,
        video_enabled: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_description: Option<serde_json::Value>,
    },
    /// Answer an incoming call.
    CallAccepted {
        call_id: CallId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_description: Option<serde_json::Value>,
    },
    /// Refuse an incoming call (also used for automatic busy/missed replies).
    CallDeclined { call_id: CallId, reason: CallReason },
    /// Report a failed call to the peer.
    CallFailed { call_id: CallId, reason: CallReason },
    /// Hang up.
    CallEnd { call_id: CallId },
    /// Local microphone/camera changed.
    MediaState {
        call_id: CallId,
        audio_enabled: bool,
        video_enabled: bool,
    },
    /// Ask for the presence of a batch of users.
    PresenceQuery {
        request_id: RequestId,
        user_ids: Vec<UserId>,
    },
    /// Swap the session token on a live connection.
    RefreshToken { token: String },
    /// Heartbeat to keep the connection alive.
    Ping,
}

impl ClientMessage {
    /// Short wire name, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CallInitiate { .. } => "call-initiate",
            Self::CallAccepted { .. } => "call-accepted",
            Self::CallDeclined { .. } => "call-declined",
            Self::CallFailed { .. } => "call-failed",
            Self::CallEnd { .. } => "call-end",
            Self::MediaState { .. } => "media-state",
            Self::PresenceQuery { .. } => "presence-query",
            Self::RefreshToken { .. } => "refresh-token",
            Self::Ping => "ping",
        }
    }
}

/// Frames sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum ServerMessage {
    /// Someone is calling us.
    IncomingCall(IncomingCallData),
    /// The callee answered our call.
    CallAccepted(CallAcceptedData),
    /// The callee refused our call.
    CallDeclined(CallDeclinedData),
    /// The call failed (includes the server's synthetic busy on a race).
    CallFailed(CallFailedData),
    /// The peer hung up.
    CallEnded(CallEndedData),
    /// The peer toggled microphone or camera.
    MediaStateUpdate(MediaStateUpdate),
    /// A user's presence changed.
    UserStatusChanged(PresenceEntry),
    /// Answer to a `presence-query`.
    PresenceSnapshot(PresenceSnapshot),
    /// A message arrived in a conversation.
    NewMessage(NewMessageData),
    /// The live token swap succeeded.
    TokenRefreshed,
    /// The server rejected the session token.
    AuthenticationError { message: String },
    /// Heartbeat reply.
    Pong,
    /// Generic server-side error.
    Error { message: String },
}

impl ServerMessage {
    /// Call id carried by call-related frames.
    pub fn call_id(&self) -> Option<&str> {
        match self {
            Self::IncomingCall(d) => Some(&d.call_id),
            Self::CallAccepted(d) => Some(&d.call_id),
            Self::CallDeclined(d) => Some(&d.call_id),
            Self::CallFailed(d) => Some(&d.call_id),
            Self::CallEnded(d) => Some(&d.call_id),
            Self::MediaStateUpdate(d) => Some(&d.call_id),
            _ => None,
        }
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
    use serde_json::json;

    #[test]
    fn call_initiate_uses_kebab_tag_and_camel_fields() {
        let msg = ClientMessage::CallInitiate {
            call_id: "c1".into(),
            peer_user_id: "u2".into(),
            audio_enabled: true,
            video_enabled: false,
            session_description: None,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "call-initiate",
                "data": {
                    "callId": "c1",
                    "peerUserId": "u2",
                    "audioEnabled": true,
                    "videoEnabled": false
                }
            })
        );
    }

    #[test]
    fn ping_has_no_data() {
        let value = serde_json::to_value(ClientMessage::Ping).unwrap();
        assert_eq!(value, json!({ "type": "ping" }));
    }

    #[test]
    fn busy_decline_matches_wire_shape() {
        let msg = ClientMessage::CallDeclined {
            call_id: "c2".into(),
            reason: CallReason::Busy,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({ "type": "call-declined", "data": { "callId": "c2", "reason": "busy" } })
        );
    }

    #[test]
    fn incoming_call_decodes_with_defaults() {
        let raw = r#"{"type":"IncomingCall","data":{"callId":"c1","fromUserId":"u1"}}"#;
        let msg: ServerMessage = serde_json::from_str(raw).unwrap();
        match msg {
            ServerMessage::IncomingCall(data) => {
                assert_eq!(data.call_id, "c1");
                assert_eq!(data.from_user_id, "u1");
                assert_eq!(data.media, MediaState::audio_only());
                assert!(data.session_description.is_none());
            }
            other => panic!("expected IncomingCall, got {other:?}"),
        }
    }

    #[test]
    fn user_status_changed_parses_rfc3339_timestamp() {
        let raw = r#"{"type":"UserStatusChanged","data":{"userId":"u9","isOnline":true,"lastActiveAt":"2026-03-01T10:00:00Z"}}"#;
        let msg: ServerMessage = serde_json::from_str(raw).unwrap();
        let ServerMessage::UserStatusChanged(entry) = msg else {
            panic!("expected UserStatusChanged");
        };
        assert_eq!(entry.user_id, "u9");
        assert!(entry.is_online);
        assert_eq!(entry.last_active_at.to_rfc3339(), "2026-03-01T10:00:00+00:00");
    }

    #[test]
    fn unit_server_messages_decode_without_data() {
        let msg: ServerMessage = serde_json::from_str(r#"{"type":"Pong"}"#).unwrap();
        assert_eq!(msg, ServerMessage::Pong);
    }

    #[test]
    fn unknown_server_message_type_is_rejected() {
        let result = serde_json::from_str::<ServerMessage>(r#"{"type":"Teleport","data":{}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn call_id_is_exposed_for_call_frames_only() {
        let msg = ServerMessage::CallEnded(CallEndedData {
            call_id: "c7".into(),
        });
        assert_eq!(msg.call_id(), Some("c7"));
        assert_eq!(ServerMessage::Pong.call_id(), None);
    }

    #[test]
    fn media_state_with_toggles_one_kind() {
        let media = MediaState::audio_video().with(MediaKind::Video, false);
        assert_eq!(media, MediaState::audio_only());
    }
}
