//! Call signaling state machine.
//!
//! [`CallMachine`] owns the single call slot of the client. Local actions
//! (`place_call`, `accept`, `hang_up`, ...) and inbound call frames are both
//! funneled through it, so the UI only ever sees one authoritative
//! [`CallSession`].
//!
//! ```text
//! Idle ─place_call─▶ Ringing ─CallAccepted─▶ Active ─hang_up/CallEnded─▶ Ended
//! Idle ─IncomingCall─▶ IncomingRinging ─accept─▶ Active
//!                              └─decline/ring timeout─▶ Ended
//! any non-terminal ─CallFailed/timeout/signaling lost─▶ Failed
//! Ended/Failed ─acknowledge─▶ Idle
//! ```
//!
//! Every transition emits [`HubEvent::CallStateChanged`] after the internal
//! lock is released, so handlers may call straight back into the machine.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::HubConfig;
use crate::connection::SignalSink;
use crate::dispatcher::EventDispatcher;
use crate::error::{HubError, Result};
use crate::event::HubEvent;
use crate::lock::lock;
use crate::protocol::{
    CallAcceptedData, CallDeclinedData, CallEndedData, CallFailedData, CallId, ClientMessage,
    IncomingCallData, MediaKind, MediaState, MediaStateUpdate, UserId,
};
use crate::reason::CallReason;

// ── Session types ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// Lifecycle state of a [`CallSession`]. `Idle` is the absence of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallState {
    /// We placed the call and the peer has not answered yet.
    Ringing,
    /// The peer is calling us and we have not answered yet.
    IncomingRinging,
    Active,
    Ended(CallReason),
    Failed(CallReason),
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended(_) | Self::Failed(_))
    }

    pub fn is_ringing(&self) -> bool {
        matches!(self, Self::Ringing | Self::IncomingRinging)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ringing => f.write_str("ringing"),
            Self::IncomingRinging => f.write_str("incoming ringing"),
            Self::Active => f.write_str("active"),
            Self::Ended(reason) => write!(f, "ended ({reason})"),
            Self::Failed(reason) => write!(f, "failed ({reason})"),
        }
    }
}

/// Snapshot of the current call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSession {
    pub call_id: CallId,
    pub direction: CallDirection,
    pub peer_user_id: UserId,
    pub state: CallState,
    pub local_media: MediaState,
    pub remote_media: MediaState,
    pub started_at: DateTime<Utc>,
    /// When the call became active.
    pub answered_at: Option<DateTime<Utc>>,
    /// The peer's opaque media negotiation payload, if it sent one.
    pub remote_description: Option<serde_json::Value>,
}

// ── Machine ─────────────────────────────────────────────────────────

struct Slot {
    session: CallSession,
    ring_timer: Option<AbortHandle>,
}

impl Slot {
    fn cancel_ring_timer(&mut self) {
        if let Some(timer) = self.ring_timer.take() {
            timer.abort();
        }
    }

    /// Move to `state`, cancelling the ring timer once the call stops ringing.
    fn set_state(&mut self, state: CallState) {
        if !state.is_ringing() {
            self.cancel_ring_timer();
        }
        if state == CallState::Active && self.session.answered_at.is_none() {
            self.session.answered_at = Some(Utc::now());
        }
        debug!(call_id = %self.session.call_id, from = %self.session.state, to = %state, "call transition");
        self.session.state = state;
    }
}

/// What to do once the slot lock is released.
#[derive(Default)]
struct Effects {
    frame: Option<ClientMessage>,
    events: Vec<HubEvent>,
}

impl Effects {
    fn changed(session: &CallSession) -> Self {
        Self {
            frame: None,
            events: vec![HubEvent::CallStateChanged(Some(session.clone()))],
        }
    }

    fn with_frame(mut self, frame: ClientMessage) -> Self {
        self.frame = Some(frame);
        self
    }
}

struct Inner {
    slot: Mutex<Option<Slot>>,
    sink: Arc<dyn SignalSink>,
    dispatcher: EventDispatcher,
    local_user_id: UserId,
    ring_timeout: Duration,
    default_media: MediaState,
}

/// The single-slot call state machine.
///
/// Cloning is cheap; clones share the slot.
#[derive(Clone)]
pub struct CallMachine {
    inner: Arc<Inner>,
}

impl CallMachine {
    pub fn new(sink: Arc<dyn SignalSink>, dispatcher: EventDispatcher, config: &HubConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(None),
                sink,
                dispatcher,
                local_user_id: config.local_user_id.clone(),
                ring_timeout: config.ring_timeout,
                default_media: config.default_media,
            }),
        }
    }

    /// Snapshot of the current session, `None` when idle.
    pub fn current(&self) -> Option<CallSession> {
        lock(&self.inner.slot).as_ref().map(|s| s.session.clone())
    }

    // ── Local actions ───────────────────────────────────────────────

    /// Ring `peer_user_id` with the configured default media.
    ///
    /// # Errors
    ///
    /// See [`place_call_with`](Self::place_call_with).
    pub fn place_call(&self, peer_user_id: impl Into<UserId>) -> Result<CallSession> {
        self.place_call_with(peer_user_id, self.inner.default_media, None)
    }

    /// Ring `peer_user_id` with `media`, attaching an optional offer payload.
    ///
    /// # Errors
    ///
    /// - [`HubError::InvalidArgument`] for an empty peer id or a self-call.
    /// - [`HubError::StateConflict`] when a call already occupies the slot.
    /// - The send error when `call-initiate` cannot be handed to the
    ///   connection; the session is then left in
    ///   `Failed(SignalingUnavailable)`.
    pub fn place_call_with(
        &self,
        peer_user_id: impl Into<UserId>,
        media: MediaState,
        offer: Option<serde_json::Value>,
    ) -> Result<CallSession> {
        let peer_user_id = peer_user_id.into();
        if peer_user_id.is_empty() {
            return Err(HubError::InvalidArgument("peer user id is empty".into()));
        }
        if peer_user_id == self.inner.local_user_id {
            return Err(HubError::InvalidArgument("cannot call yourself".into()));
        }

        let session = {
            let mut slot = lock(&self.inner.slot);
            if let Some(existing) = slot.as_ref() {
                return Err(conflict("place a call", Some(existing)));
            }
            let session = CallSession {
                call_id: Uuid::new_v4().to_string(),
                direction: CallDirection::Outgoing,
                peer_user_id,
                state: CallState::Ringing,
                local_media: media,
                remote_media: MediaState::default(),
                started_at: Utc::now(),
                answered_at: None,
                remote_description: None,
            };
            *slot = Some(Slot {
                ring_timer: self.arm_ring_timer(&session.call_id),
                session: session.clone(),
            });
            session
        };
        info!(call_id = %session.call_id, peer = %session.peer_user_id, "placing call");

        let initiate = ClientMessage::CallInitiate {
            call_id: session.call_id.clone(),
            peer_user_id: session.peer_user_id.clone(),
            audio_enabled: media.audio_enabled,
            video_enabled: media.video_enabled,
            session_description: offer,
        };
        if let Err(e) = self.inner.sink.enqueue(initiate) {
            warn!(call_id = %session.call_id, error = %e, "call-initiate could not be sent");
            self.emit(vec![HubEvent::CallStateChanged(Some(session.clone()))]);
            let failed = self.update(&session.call_id, |slot| {
                (!slot.session.state.is_terminal()).then(|| {
                    slot.set_state(CallState::Failed(CallReason::SignalingUnavailable));
                    Effects::changed(&slot.session)
                })
            });
            self.apply_best_effort(failed);
            return Err(e);
        }

        self.emit(vec![HubEvent::CallStateChanged(Some(session.clone()))]);
        Ok(session)
    }

    /// Answer the ringing incoming call.
    ///
    /// # Errors
    ///
    /// [`HubError::StateConflict`] unless a call is incoming and ringing, or
    /// the send error if `call-accepted` cannot be handed to the connection
    /// (the call then fails with `SignalingUnavailable`).
    pub fn accept(&self) -> Result<CallSession> {
        self.accept_with(None)
    }

    /// Answer the ringing incoming call with an answer payload.
    ///
    /// # Errors
    ///
    /// Same as [`accept`](Self::accept).
    pub fn accept_with(&self, answer: Option<serde_json::Value>) -> Result<CallSession> {
        let (session, effects) = self.local("accept", |slot| {
            if slot.session.state != CallState::IncomingRinging {
                return None;
            }
            slot.set_state(CallState::Active);
            let frame = ClientMessage::CallAccepted {
                call_id: slot.session.call_id.clone(),
                session_description: answer,
            };
            Some(Effects::changed(&slot.session).with_frame(frame))
        })?;

        if let Err(e) = self.apply(effects) {
            let failed = self.update(&session.call_id, |slot| {
                (slot.session.state == CallState::Active).then(|| {
                    slot.set_state(CallState::Failed(CallReason::SignalingUnavailable));
                    Effects::changed(&slot.session)
                })
            });
            self.apply_best_effort(failed);
            return Err(e);
        }
        Ok(session)
    }

    /// Refuse the ringing incoming call.
    ///
    /// # Errors
    ///
    /// [`HubError::StateConflict`] unless a call is incoming and ringing.
    pub fn decline(&self) -> Result<CallSession> {
        let (session, effects) = self.local("decline", |slot| {
            if slot.session.state != CallState::IncomingRinging {
                return None;
            }
            slot.set_state(CallState::Ended(CallReason::Declined));
            let frame = ClientMessage::CallDeclined {
                call_id: slot.session.call_id.clone(),
                reason: CallReason::Declined,
            };
            Some(Effects::changed(&slot.session).with_frame(frame))
        })?;
        self.apply_best_effort(effects);
        Ok(session)
    }

    /// End the call from any ringing or active state.
    ///
    /// # Errors
    ///
    /// [`HubError::StateConflict`] when idle or already terminal.
    pub fn hang_up(&self) -> Result<CallSession> {
        let (session, effects) = self.local("hang up", |slot| {
            if slot.session.state.is_terminal() {
                return None;
            }
            slot.set_state(CallState::Ended(CallReason::HangUp));
            let frame = ClientMessage::CallEnd {
                call_id: slot.session.call_id.clone(),
            };
            Some(Effects::changed(&slot.session).with_frame(frame))
        })?;
        self.apply_best_effort(effects);
        Ok(session)
    }

    /// Turn the local microphone or camera on or off during an active call.
    ///
    /// # Errors
    ///
    /// [`HubError::StateConflict`] unless the call is active, or the send
    /// error if `media-state` cannot be handed to the connection. The local
    /// media state is updated either way.
    pub fn toggle_media(&self, kind: MediaKind, enabled: bool) -> Result<CallSession> {
        let (session, effects) = self.local("toggle media", |slot| {
            if slot.session.state != CallState::Active {
                return None;
            }
            slot.session.local_media = slot.session.local_media.with(kind, enabled);
            let media = slot.session.local_media;
            let frame = ClientMessage::MediaState {
                call_id: slot.session.call_id.clone(),
                audio_enabled: media.audio_enabled,
                video_enabled: media.video_enabled,
            };
            Some(Effects::changed(&slot.session).with_frame(frame))
        })?;
        self.apply(effects)?;
        Ok(session)
    }

    /// Clear a terminal session and return to idle.
    ///
    /// # Errors
    ///
    /// [`HubError::StateConflict`] when idle or the call is still live.
    pub fn acknowledge(&self) -> Result<()> {
        {
            let mut slot = lock(&self.inner.slot);
            match slot.as_ref() {
                Some(current) if current.session.state.is_terminal() => {}
                other => return Err(conflict("acknowledge", other)),
            }
            if let Some(done) = slot.take() {
                debug!(call_id = %done.session.call_id, "call acknowledged");
            }
        }
        self.emit(vec![HubEvent::CallStateChanged(None)]);
        Ok(())
    }

    // ── Inbound frames ──────────────────────────────────────────────

    pub(crate) fn handle_incoming(&self, data: IncomingCallData) {
        if data.from_user_id == self.inner.local_user_id {
            warn!(call_id = %data.call_id, "ignoring incoming call from ourselves");
            return;
        }

        let effects = {
            let mut slot = lock(&self.inner.slot);
            let occupied_by = slot.as_ref().map(|s| s.session.call_id.clone());
            match occupied_by {
                Some(current) if current == data.call_id => {
                    debug!(call_id = %data.call_id, "duplicate incoming call ignored");
                    return;
                }
                Some(current) => {
                    info!(
                        call_id = %data.call_id,
                        %current,
                        "busy, auto-declining incoming call"
                    );
                    Effects::default().with_frame(ClientMessage::CallDeclined {
                        call_id: data.call_id,
                        reason: CallReason::Busy,
                    })
                }
                None => {
                    let session = CallSession {
                        call_id: data.call_id,
                        direction: CallDirection::Incoming,
                        peer_user_id: data.from_user_id,
                        state: CallState::IncomingRinging,
                        local_media: self.inner.default_media,
                        remote_media: data.media,
                        started_at: Utc::now(),
                        answered_at: None,
                        remote_description: data.session_description,
                    };
                    info!(call_id = %session.call_id, peer = %session.peer_user_id, "incoming call");
                    *slot = Some(Slot {
                        ring_timer: self.arm_ring_timer(&session.call_id),
                        session: session.clone(),
                    });
                    Effects {
                        frame: None,
                        events: vec![
                            HubEvent::CallStateChanged(Some(session.clone())),
                            HubEvent::IncomingCall(session),
                        ],
                    }
                }
            }
        };
        self.apply_best_effort(effects);
    }

    pub(crate) fn handle_accepted(&self, data: CallAcceptedData) {
        let effects = self.update(&data.call_id, |slot| {
            if slot.session.state != CallState::Ringing {
                return None;
            }
            slot.session.remote_description = data.session_description;
            slot.set_state(CallState::Active);
            Some(Effects::changed(&slot.session))
        });
        self.apply_best_effort(effects);
    }

    pub(crate) fn handle_declined(&self, data: CallDeclinedData) {
        self.remote_terminal(&data.call_id, CallState::Ended(data.reason));
    }

    pub(crate) fn handle_failed(&self, data: CallFailedData) {
        self.remote_terminal(&data.call_id, CallState::Failed(data.reason));
    }

    pub(crate) fn handle_ended(&self, data: CallEndedData) {
        self.remote_terminal(&data.call_id, CallState::Ended(CallReason::RemoteHangUp));
    }

    pub(crate) fn handle_media_update(&self, update: MediaStateUpdate) {
        let effects = self.update(&update.call_id, |slot| {
            if slot.session.state.is_terminal() {
                return None;
            }
            slot.session.remote_media = update.media();
            Some(Effects::changed(&slot.session))
        });
        self.apply_best_effort(effects);
    }

    /// Fail a live call after the signaling connection went away for good.
    pub(crate) fn signaling_lost(&self) {
        let effects = {
            let mut slot = lock(&self.inner.slot);
            match slot.as_mut() {
                Some(current) if !current.session.state.is_terminal() => {
                    warn!(call_id = %current.session.call_id, "signaling lost during call");
                    current.set_state(CallState::Failed(CallReason::SignalingUnavailable));
                    Some(Effects::changed(&current.session))
                }
                _ => None,
            }
        };
        self.apply_best_effort(effects);
    }

    // ── Internals ───────────────────────────────────────────────────

    fn remote_terminal(&self, call_id: &str, next: CallState) {
        let effects = self.update(call_id, |slot| {
            if slot.session.state.is_terminal() {
                return None;
            }
            info!(call_id, state = %next, "call ended by peer or server");
            slot.set_state(next);
            Some(Effects::changed(&slot.session))
        });
        self.apply_best_effort(effects);
    }

    fn ring_expired(&self, call_id: &str) {
        let effects = self.update(call_id, |slot| {
            let (next, frame) = match slot.session.state {
                CallState::Ringing => (
                    CallState::Failed(CallReason::Timeout),
                    ClientMessage::CallFailed {
                        call_id: slot.session.call_id.clone(),
                        reason: CallReason::Timeout,
                    },
                ),
                CallState::IncomingRinging => (
                    CallState::Ended(CallReason::Missed),
                    ClientMessage::CallDeclined {
                        call_id: slot.session.call_id.clone(),
                        reason: CallReason::Missed,
                    },
                ),
                _ => return None,
            };
            info!(call_id, "ring timeout");
            // This runs on the timer task itself; drop the handle without aborting.
            slot.ring_timer = None;
            slot.set_state(next);
            Some(Effects::changed(&slot.session).with_frame(frame))
        });
        self.apply_best_effort(effects);
    }

    /// Run `step` on the slot if it holds `call_id`. Stale ids are ignored.
    fn update<F>(&self, call_id: &str, step: F) -> Option<Effects>
    where
        F: FnOnce(&mut Slot) -> Option<Effects>,
    {
        let mut slot = lock(&self.inner.slot);
        match slot.as_mut() {
            Some(current) if current.session.call_id == call_id => {
                let effects = step(&mut *current);
                if effects.is_none() {
                    debug!(call_id, state = %current.session.state, "call frame ignored in current state");
                }
                effects
            }
            _ => {
                debug!(call_id, "stale call id ignored");
                None
            }
        }
    }

    /// Run a local action on the slot, turning a refused step into a
    /// `StateConflict`.
    fn local<F>(&self, operation: &'static str, step: F) -> Result<(CallSession, Effects)>
    where
        F: FnOnce(&mut Slot) -> Option<Effects>,
    {
        let mut slot = lock(&self.inner.slot);
        let Some(current) = slot.as_mut() else {
            return Err(conflict(operation, None));
        };
        let state = current.session.state;
        match step(&mut *current) {
            Some(effects) => Ok((current.session.clone(), effects)),
            None => Err(HubError::StateConflict {
                operation,
                state: state.to_string(),
            }),
        }
    }

    /// Send the frame, then emit the events. Returns the send error.
    fn apply(&self, effects: impl Into<Option<Effects>>) -> Result<()> {
        let Some(effects) = effects.into() else {
            return Ok(());
        };
        let sent = match effects.frame {
            Some(frame) => self.inner.sink.enqueue(frame),
            None => Ok(()),
        };
        self.emit(effects.events);
        sent
    }

    fn apply_best_effort(&self, effects: impl Into<Option<Effects>>) {
        if let Err(e) = self.apply(effects) {
            warn!(error = %e, "call frame could not be sent");
        }
    }

    fn emit(&self, events: Vec<HubEvent>) {
        for event in &events {
            self.inner.dispatcher.emit(event);
        }
    }

    fn arm_ring_timer(&self, call_id: &str) -> Option<AbortHandle> {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(call_id, "no tokio runtime, ring timeout disabled");
            return None;
        };
        let machine: Weak<Inner> = Arc::downgrade(&self.inner);
        let timeout = self.inner.ring_timeout;
        let call_id = call_id.to_owned();
        let task = runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = machine.upgrade() {
                CallMachine { inner }.ring_expired(&call_id);
            }
        });
        Some(task.abort_handle())
    }
}

impl fmt::Debug for CallMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallMachine")
            .field("current", &self.current())
            .field("ring_timeout", &self.inner.ring_timeout)
            .finish()
    }
}

fn conflict(operation: &'static str, slot: Option<&Slot>) -> HubError {
    HubError::StateConflict {
        operation,
        state: slot.map_or_else(|| "idle".to_owned(), |s| s.session.state.to_string()),
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
    use crate::dispatcher::Subscription;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingSink {
        frames: StdMutex<Vec<ClientMessage>>,
        offline: AtomicBool,
    }

    impl RecordingSink {
        fn frames(&self) -> Vec<ClientMessage> {
            self.frames.lock().unwrap().clone()
        }
    }

    impl SignalSink for RecordingSink {
        fn enqueue(&self, message: ClientMessage) -> Result<()> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(HubError::NotConnected);
            }
            self.frames.lock().unwrap().push(message);
            Ok(())
        }
    }

    struct Harness {
        machine: CallMachine,
        sink: Arc<RecordingSink>,
        states: Arc<StdMutex<Vec<Option<CallState>>>>,
        incoming: Arc<StdMutex<Vec<CallId>>>,
        _subs: Vec<Subscription>,
    }

    fn harness() -> Harness {
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = EventDispatcher::new();
        let states = Arc::new(StdMutex::new(Vec::new()));
        let incoming = Arc::new(StdMutex::new(Vec::new()));

        let state_log = Arc::clone(&states);
        let state_sub = dispatcher.on(crate::event::EventKind::CallStateChanged, move |e| {
            if let HubEvent::CallStateChanged(s) = e {
                state_log.lock().unwrap().push(s.as_ref().map(|s| s.state));
            }
        });
        let incoming_log = Arc::clone(&incoming);
        let incoming_sub = dispatcher.on(crate::event::EventKind::IncomingCall, move |e| {
            if let HubEvent::IncomingCall(s) = e {
                incoming_log.lock().unwrap().push(s.call_id.clone());
            }
        });

        let config = HubConfig::new("alice").with_ring_timeout(Duration::from_secs(30));
        let machine = CallMachine::new(Arc::clone(&sink) as Arc<dyn SignalSink>, dispatcher, &config);
        Harness {
            machine,
            sink,
            states,
            incoming,
            _subs: vec![state_sub, incoming_sub],
        }
    }

    fn incoming(call_id: &str, from: &str) -> IncomingCallData {
        IncomingCallData {
            call_id: call_id.into(),
            from_user_id: from.into(),
            media: MediaState::audio_video(),
            session_description: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn outgoing_call_is_accepted_then_hung_up() {
        let h = harness();
        let session = h.machine.place_call("bob").unwrap();
        assert_eq!(session.state, CallState::Ringing);
        assert_eq!(session.direction, CallDirection::Outgoing);

        h.machine.handle_accepted(CallAcceptedData {
            call_id: session.call_id.clone(),
            session_description: Some(serde_json::json!({"sdp": "answer"})),
        });
        let active = h.machine.current().unwrap();
        assert_eq!(active.state, CallState::Active);
        assert!(active.answered_at.is_some());
        assert_eq!(active.remote_description, Some(serde_json::json!({"sdp": "answer"})));

        h.machine.hang_up().unwrap();
        assert_eq!(
            h.machine.current().unwrap().state,
            CallState::Ended(CallReason::HangUp)
        );

        let frames = h.sink.frames();
        assert!(matches!(&frames[0], ClientMessage::CallInitiate { peer_user_id, .. } if peer_user_id == "bob"));
        assert_eq!(
            frames[1],
            ClientMessage::CallEnd {
                call_id: session.call_id
            }
        );
        assert_eq!(
            *h.states.lock().unwrap(),
            vec![
                Some(CallState::Ringing),
                Some(CallState::Active),
                Some(CallState::Ended(CallReason::HangUp)),
            ]
        );

        h.machine.acknowledge().unwrap();
        assert!(h.machine.current().is_none());
        assert_eq!(h.states.lock().unwrap().last(), Some(&None));
    }

    #[tokio::test(start_paused = true)]
    async fn incoming_call_while_active_is_auto_declined_busy() {
        let h = harness();
        let session = h.machine.place_call("bob").unwrap();
        h.machine.handle_accepted(CallAcceptedData {
            call_id: session.call_id.clone(),
            session_description: None,
        });

        h.machine.handle_incoming(incoming("other-call", "carol"));

        let current = h.machine.current().unwrap();
        assert_eq!(current.call_id, session.call_id);
        assert_eq!(current.state, CallState::Active);
        assert_eq!(
            h.sink.frames().last().unwrap(),
            &ClientMessage::CallDeclined {
                call_id: "other-call".into(),
                reason: CallReason::Busy,
            }
        );
        assert!(h.incoming.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_outgoing_call_times_out() {
        let h = harness();
        let session = h.machine.place_call("bob").unwrap();

        tokio::time::sleep(Duration::from_secs(31)).await;

        assert_eq!(
            h.machine.current().unwrap().state,
            CallState::Failed(CallReason::Timeout)
        );
        assert_eq!(
            h.sink.frames().last().unwrap(),
            &ClientMessage::CallFailed {
                call_id: session.call_id.clone(),
                reason: CallReason::Timeout,
            }
        );

        // A late answer for the timed-out call changes nothing.
        h.machine.handle_accepted(CallAcceptedData {
            call_id: session.call_id,
            session_description: None,
        });
        assert_eq!(
            h.machine.current().unwrap().state,
            CallState::Failed(CallReason::Timeout)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_incoming_call_is_missed() {
        let h = harness();
        h.machine.handle_incoming(incoming("c-in", "bob"));
        assert_eq!(*h.incoming.lock().unwrap(), vec!["c-in".to_owned()]);

        tokio::time::sleep(Duration::from_secs(31)).await;

        assert_eq!(
            h.machine.current().unwrap().state,
            CallState::Ended(CallReason::Missed)
        );
        assert_eq!(
            h.sink.frames(),
            vec![ClientMessage::CallDeclined {
                call_id: "c-in".into(),
                reason: CallReason::Missed,
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn accepted_call_does_not_time_out() {
        let h = harness();
        h.machine.handle_incoming(incoming("c-in", "bob"));
        h.machine.accept().unwrap();

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.machine.current().unwrap().state, CallState::Active);
        assert_eq!(h.sink.frames().len(), 1);
    }

    #[tokio::test]
    async fn second_place_call_is_rejected_without_wire_traffic() {
        let h = harness();
        h.machine.place_call("bob").unwrap();

        let err = h.machine.place_call("carol").unwrap_err();
        assert!(matches!(err, HubError::StateConflict { operation: "place a call", .. }));
        assert_eq!(h.sink.frames().len(), 1);
    }

    #[tokio::test]
    async fn calling_yourself_is_invalid() {
        let h = harness();
        assert!(matches!(
            h.machine.place_call("alice"),
            Err(HubError::InvalidArgument(_))
        ));
        assert!(h.machine.current().is_none());
    }

    #[tokio::test]
    async fn unsendable_initiate_fails_the_call() {
        let h = harness();
        h.sink.offline.store(true, Ordering::SeqCst);

        let err = h.machine.place_call("bob").unwrap_err();
        assert!(matches!(err, HubError::NotConnected));
        assert_eq!(
            h.machine.current().unwrap().state,
            CallState::Failed(CallReason::SignalingUnavailable)
        );
    }

    #[tokio::test]
    async fn accept_and_decline_require_incoming_ringing() {
        let h = harness();
        assert!(matches!(
            h.machine.accept(),
            Err(HubError::StateConflict { ref state, .. }) if state == "idle"
        ));

        h.machine.place_call("bob").unwrap();
        assert!(matches!(h.machine.decline(), Err(HubError::StateConflict { .. })));
        assert_eq!(h.sink.frames().len(), 1);
    }

    #[tokio::test]
    async fn decline_sends_reason_and_ends() {
        let h = harness();
        h.machine.handle_incoming(incoming("c-in", "bob"));
        h.machine.decline().unwrap();

        assert_eq!(
            h.machine.current().unwrap().state,
            CallState::Ended(CallReason::Declined)
        );
        assert_eq!(
            h.sink.frames(),
            vec![ClientMessage::CallDeclined {
                call_id: "c-in".into(),
                reason: CallReason::Declined,
            }]
        );
    }

    #[tokio::test]
    async fn duplicate_incoming_call_is_ignored() {
        let h = harness();
        h.machine.handle_incoming(incoming("c-in", "bob"));
        h.machine.handle_incoming(incoming("c-in", "bob"));

        assert_eq!(h.incoming.lock().unwrap().len(), 1);
        assert!(h.sink.frames().is_empty());
    }

    #[tokio::test]
    async fn busy_failure_from_server_fails_outgoing_call() {
        let h = harness();
        let session = h.machine.place_call("bob").unwrap();
        h.machine.handle_failed(CallFailedData {
            call_id: session.call_id,
            reason: CallReason::Busy,
        });
        assert_eq!(
            h.machine.current().unwrap().state,
            CallState::Failed(CallReason::Busy)
        );
    }

    #[tokio::test]
    async fn stale_call_ids_are_ignored() {
        let h = harness();
        let session = h.machine.place_call("bob").unwrap();
        h.machine.handle_declined(CallDeclinedData {
            call_id: "someone-else".into(),
            reason: CallReason::Declined,
        });
        h.machine.handle_ended(CallEndedData {
            call_id: "someone-else".into(),
        });
        assert_eq!(h.machine.current().unwrap().call_id, session.call_id);
        assert_eq!(h.machine.current().unwrap().state, CallState::Ringing);
    }

    #[tokio::test]
    async fn media_toggles_only_while_active() {
        let h = harness();
        h.machine.handle_incoming(incoming("c-in", "bob"));
        assert!(h.machine.toggle_media(MediaKind::Video, true).is_err());

        h.machine.accept().unwrap();
        let session = h.machine.toggle_media(MediaKind::Video, true).unwrap();
        assert!(session.local_media.video_enabled);
        assert_eq!(
            h.sink.frames().last().unwrap(),
            &ClientMessage::MediaState {
                call_id: "c-in".into(),
                audio_enabled: true,
                video_enabled: true,
            }
        );

        h.machine.handle_media_update(MediaStateUpdate {
            call_id: "c-in".into(),
            audio_enabled: false,
            video_enabled: false,
        });
        let current = h.machine.current().unwrap();
        assert_eq!(current.state, CallState::Active);
        assert!(!current.remote_media.audio_enabled);
    }

    #[tokio::test]
    async fn remote_hang_up_ends_active_call() {
        let h = harness();
        h.machine.handle_incoming(incoming("c-in", "bob"));
        h.machine.accept().unwrap();
        h.machine.handle_ended(CallEndedData {
            call_id: "c-in".into(),
        });
        assert_eq!(
            h.machine.current().unwrap().state,
            CallState::Ended(CallReason::RemoteHangUp)
        );
        assert!(h.machine.hang_up().is_err());
    }

    #[tokio::test]
    async fn acknowledge_requires_terminal_state() {
        let h = harness();
        assert!(h.machine.acknowledge().is_err());
        h.machine.place_call("bob").unwrap();
        assert!(matches!(
            h.machine.acknowledge(),
            Err(HubError::StateConflict { ref state, .. }) if state == "ringing"
        ));
    }

    #[tokio::test]
    async fn signaling_loss_fails_live_call() {
        let h = harness();
        h.machine.place_call("bob").unwrap();
        h.machine.signaling_lost();
        assert_eq!(
            h.machine.current().unwrap().state,
            CallState::Failed(CallReason::SignalingUnavailable)
        );
    }

    #[tokio::test]
    async fn handler_may_call_back_into_the_machine() {
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = EventDispatcher::new();
        let machine = CallMachine::new(
            Arc::clone(&sink) as Arc<dyn SignalSink>,
            dispatcher.clone(),
            &HubConfig::new("alice"),
        );

        let answering = machine.clone();
        let _sub = dispatcher.on(crate::event::EventKind::IncomingCall, move |_| {
            answering.accept().unwrap();
        });
        machine.handle_incoming(incoming("c-in", "bob"));
        assert_eq!(machine.current().unwrap().state, CallState::Active);
    }
}
