//! Typed events delivered to UI subscribers through the
//! [`EventDispatcher`](crate::dispatcher::EventDispatcher).

use crate::call::CallSession;
use crate::connection::ConnectionState;
use crate::protocol::{ConversationId, NewMessageData, PresenceEntry};

/// Discriminant of a [`HubEvent`], used as the subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ConnectionStateChanged,
    IncomingCall,
    CallStateChanged,
    PresenceChanged,
    NewMessage,
    UnreadChanged,
    AuthenticationFailed,
    ServerError,
}

/// Everything the hub tells its consumers about.
#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    /// The signaling connection moved to a new state.
    ConnectionStateChanged(ConnectionState),

    /// A new call is ringing and needs an accept/decline decision.
    /// Always preceded by a `CallStateChanged` for the same session.
    IncomingCall(CallSession),

    /// The active call session changed state, media, or was cleared.
    /// `None` means the slot returned to idle.
    CallStateChanged(Option<CallSession>),

    /// A user's presence entry was replaced by a newer one.
    PresenceChanged(PresenceEntry),

    /// A message arrived for a conversation the user is viewing or has
    /// loaded; the read-model has already been invalidated.
    NewMessage(NewMessageData),

    /// The unread counter of a conversation changed.
    UnreadChanged {
        conversation_id: ConversationId,
        unread: u32,
    },

    /// The server rejected the session token on a live connection.
    AuthenticationFailed { message: String },

    /// The server reported an error that is not tied to a call.
    ServerError { message: String },
}

impl HubEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ConnectionStateChanged(_) => EventKind::ConnectionStateChanged,
            Self::IncomingCall(_) => EventKind::IncomingCall,
            Self::CallStateChanged(_) => EventKind::CallStateChanged,
            Self::PresenceChanged(_) => EventKind::PresenceChanged,
            Self::NewMessage(_) => EventKind::NewMessage,
            Self::UnreadChanged { .. } => EventKind::UnreadChanged,
            Self::AuthenticationFailed { .. } => EventKind::AuthenticationFailed,
            Self::ServerError { .. } => EventKind::ServerError,
        }
    }
}
