#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
//! End-to-end tests of the assembled `Hub`.
//!
//! Each test starts a hub over the scripted in-process connector, connects,
//! and then plays the server's side of the conversation through a
//! `ServerEnd`.

mod common;

use std::time::Duration;

use chrono::{TimeZone, Utc};
use tokio_test::{assert_pending, assert_ready};
use signal_hub_client::protocol::{
    CallAcceptedData, CallEndedData, ChatMessage, ClientMessage, IncomingCallData, MediaState,
    NewMessageData, PresenceEntry, PresenceSnapshot, ServerMessage,
};
use signal_hub_client::{
    CallReason, CallState, ConnectionState, EventKind, Hub, HubConfig, HubEvent, ReconnectPolicy,
};

use common::{fake_connector, init_tracing, DialScript, EventLog, RecordingStore, ServerEnd};
use common::wait_until;

struct Fixture {
    hub: Hub,
    script: DialScript,
    server: ServerEnd,
    log: EventLog,
    store: RecordingStore,
}

async fn start(config: HubConfig) -> Fixture {
    init_tracing();
    let (connector, script) = fake_connector();
    let server = script.accept();
    let store = RecordingStore::default();
    let hub = Hub::start(connector, store.clone(), config);
    let log = EventLog::attach(hub.events());
    hub.connect("tok").await.unwrap();
    Fixture {
        hub,
        script,
        server,
        log,
        store,
    }
}

fn config() -> HubConfig {
    HubConfig::new("me").with_heartbeat_interval(None)
}

fn incoming(call_id: &str, from: &str) -> ServerMessage {
    ServerMessage::IncomingCall(IncomingCallData {
        call_id: call_id.into(),
        from_user_id: from.into(),
        media: MediaState::audio_only(),
        session_description: None,
    })
}

fn call_state(hub: &Hub) -> Option<CallState> {
    hub.calls().current().map(|s| s.state)
}

// ════════════════════════════════════════════════════════════════════
// Call scenarios
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn incoming_call_is_accepted_and_answer_sent_once() {
    let mut f = start(config()).await;

    f.server.push(&incoming("c1", "u1"));
    wait_until(|| call_state(&f.hub).is_some()).await;
    assert_eq!(call_state(&f.hub), Some(CallState::IncomingRinging));
    assert!(f.log.contains(|e| matches!(e, HubEvent::IncomingCall(s) if s.call_id == "c1")));

    f.hub.calls().accept().unwrap();
    assert_eq!(call_state(&f.hub), Some(CallState::Active));
    assert_eq!(
        f.server.next_frame().await,
        ClientMessage::CallAccepted {
            call_id: "c1".into(),
            session_description: None,
        }
    );

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(f.server.drain().is_empty());
    assert_eq!(call_state(&f.hub), Some(CallState::Active));
}

#[tokio::test(start_paused = true)]
async fn second_incoming_call_is_declined_busy() {
    let mut f = start(config()).await;
    f.server.push(&incoming("c1", "u1"));
    wait_until(|| call_state(&f.hub).is_some()).await;
    f.hub.calls().accept().unwrap();
    f.server.next_frame().await;

    f.server.push(&incoming("c2", "u2"));
    assert_eq!(
        f.server.next_frame().await,
        ClientMessage::CallDeclined {
            call_id: "c2".into(),
            reason: CallReason::Busy,
        }
    );

    let current = f.hub.calls().current().unwrap();
    assert_eq!(current.call_id, "c1");
    assert_eq!(current.state, CallState::Active);
}

#[tokio::test(start_paused = true)]
async fn unanswered_call_fails_once_and_ignores_late_answer() {
    let mut f = start(config()).await;

    let session = f.hub.calls().place_call("bob").unwrap();
    assert!(matches!(
        f.server.next_frame().await,
        ClientMessage::CallInitiate { ref call_id, .. } if *call_id == session.call_id
    ));

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(
        call_state(&f.hub),
        Some(CallState::Failed(CallReason::Timeout))
    );
    assert_eq!(
        f.server.next_frame().await,
        ClientMessage::CallFailed {
            call_id: session.call_id.clone(),
            reason: CallReason::Timeout,
        }
    );

    f.server.push(&ServerMessage::CallAccepted(CallAcceptedData {
        call_id: session.call_id,
        session_description: None,
    }));
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(
        call_state(&f.hub),
        Some(CallState::Failed(CallReason::Timeout))
    );
    let failures = f
        .log
        .snapshot()
        .into_iter()
        .filter(|e| {
            matches!(e, HubEvent::CallStateChanged(Some(s)) if s.state == CallState::Failed(CallReason::Timeout))
        })
        .count();
    assert_eq!(failures, 1);
}

#[tokio::test(start_paused = true)]
async fn reconnect_mid_call_leaves_the_call_untouched() {
    let mut f = start(config()).await;
    f.server.push(&incoming("c1", "u1"));
    wait_until(|| call_state(&f.hub).is_some()).await;
    f.hub.calls().accept().unwrap();

    let mut states = f.hub.connection().subscribe_state();
    f.server.drop_connection();
    states
        .wait_for(|s| *s == ConnectionState::Reconnecting)
        .await
        .unwrap();
    wait_until(|| {
        f.log
            .contains(|e| *e == HubEvent::ConnectionStateChanged(ConnectionState::Reconnecting))
    })
    .await;
    assert_eq!(call_state(&f.hub), Some(CallState::Active));

    let second = f.script.accept();
    states
        .wait_for(|s| *s == ConnectionState::Connected)
        .await
        .unwrap();
    assert_eq!(call_state(&f.hub), Some(CallState::Active));

    second.push(&ServerMessage::CallEnded(CallEndedData {
        call_id: "c1".into(),
    }));
    wait_until(|| call_state(&f.hub) == Some(CallState::Ended(CallReason::RemoteHangUp))).await;
}

#[tokio::test(start_paused = true)]
async fn losing_signaling_for_good_fails_the_live_call() {
    let config = config().with_reconnect_policy(ReconnectPolicy::immediate(0));
    let mut f = start(config).await;
    f.hub.calls().place_call("bob").unwrap();

    f.server.drop_connection();
    wait_until(|| f.hub.connection_state() == ConnectionState::Failed).await;
    wait_until(|| {
        call_state(&f.hub) == Some(CallState::Failed(CallReason::SignalingUnavailable))
    })
    .await;

    f.hub.calls().acknowledge().unwrap();
    assert!(f.hub.calls().current().is_none());
}

async fn wait_for_state_event(f: &Fixture, state: ConnectionState) {
    wait_until(|| {
        f.log
            .contains(|e| *e == HubEvent::ConnectionStateChanged(state))
    })
    .await;
}

fn assert_nothing_routed(f: &Fixture) {
    assert!(!f.log.contains(|e| matches!(
        e.kind(),
        EventKind::IncomingCall | EventKind::CallStateChanged | EventKind::PresenceChanged
    )));
    assert!(f.hub.calls().current().is_none());
    assert!(f.hub.presence().get_cached("bob").is_none());
}

#[tokio::test(start_paused = true)]
async fn frames_buffered_when_signaling_fails_are_not_routed() {
    let config = config().with_reconnect_policy(ReconnectPolicy::immediate(0));
    let mut f = start(config).await;
    wait_for_state_event(&f, ConnectionState::Connected).await;

    f.server.push(&incoming("c1", "bob"));
    f.server
        .push(&ServerMessage::UserStatusChanged(presence("bob", true, 1)));
    f.server.drop_connection();

    wait_for_state_event(&f, ConnectionState::Failed).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_nothing_routed(&f);
}

#[tokio::test(start_paused = true)]
async fn frames_racing_a_disconnect_are_not_routed() {
    let f = start(config()).await;
    wait_for_state_event(&f, ConnectionState::Connected).await;

    f.server.push(&incoming("c1", "bob"));
    f.server
        .push(&ServerMessage::UserStatusChanged(presence("bob", true, 1)));
    f.hub.disconnect().await;

    wait_for_state_event(&f, ConnectionState::Disconnected).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_nothing_routed(&f);
}

// ════════════════════════════════════════════════════════════════════
// Presence
// ════════════════════════════════════════════════════════════════════

fn presence(user: &str, online: bool, secs: i64) -> PresenceEntry {
    PresenceEntry {
        user_id: user.into(),
        is_online: online,
        last_active_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
    }
}

#[tokio::test(start_paused = true)]
async fn out_of_order_presence_push_is_discarded() {
    let f = start(config()).await;

    f.server
        .push(&ServerMessage::UserStatusChanged(presence("bob", true, 20)));
    f.server
        .push(&ServerMessage::UserStatusChanged(presence("bob", false, 10)));
    f.server
        .push(&ServerMessage::UserStatusChanged(presence("carol", true, 1)));

    wait_until(|| f.hub.presence().get_cached("carol").is_some()).await;
    assert!(f.hub.presence().get_cached("bob").unwrap().is_online);

    let changes = f
        .log
        .snapshot()
        .into_iter()
        .filter(|e| e.kind() == EventKind::PresenceChanged)
        .count();
    assert_eq!(changes, 2);
}

#[tokio::test(start_paused = true)]
async fn presence_query_round_trip() {
    let mut f = start(config()).await;

    let tracker = f.hub.presence().clone();
    let mut query = tokio_test::task::spawn(tracker.query_batch(["bob", "carol"]));
    assert_pending!(query.poll());

    let ClientMessage::PresenceQuery {
        request_id,
        user_ids,
    } = f.server.next_frame().await
    else {
        panic!("expected a presence query");
    };
    assert_eq!(user_ids, vec!["bob".to_owned(), "carol".to_owned()]);

    f.server
        .push(&ServerMessage::PresenceSnapshot(PresenceSnapshot {
            request_id,
            entries: vec![presence("bob", true, 5)],
        }));

    wait_until(|| query.is_woken()).await;
    let result = assert_ready!(query.poll()).unwrap();
    assert_eq!(result.len(), 1);
    assert!(result["bob"].is_online);
    assert_eq!(f.hub.presence().online_users(), vec!["bob".to_owned()]);
}

// ════════════════════════════════════════════════════════════════════
// Messages and server notices
// ════════════════════════════════════════════════════════════════════

fn new_message(conversation: &str, id: &str) -> ServerMessage {
    ServerMessage::NewMessage(NewMessageData {
        conversation_id: conversation.into(),
        message: ChatMessage {
            id: id.into(),
            sender_id: "bob".into(),
            body: Some(serde_json::json!({"text": "hi"})),
            sent_at: None,
        },
    })
}

#[tokio::test(start_paused = true)]
async fn new_messages_refresh_open_conversations_and_count_others() {
    let f = start(config()).await;
    f.hub.messages().set_viewing(Some("conv-open".into()));

    f.server.push(&new_message("conv-open", "m1"));
    f.server.push(&new_message("conv-other", "m2"));

    wait_until(|| f.hub.messages().unread_count("conv-other") == 1).await;
    assert_eq!(
        *f.store.calls.lock().unwrap(),
        vec![
            "invalidate:conv-open".to_owned(),
            "summary:conv-open:m1".to_owned()
        ]
    );
    assert!(f.log.contains(|e| matches!(
        e,
        HubEvent::UnreadChanged { conversation_id, unread: 1 } if conversation_id == "conv-other"
    )));
    assert!(f.log.contains(|e| e.kind() == EventKind::NewMessage));
}

#[tokio::test(start_paused = true)]
async fn server_notices_become_events() {
    let f = start(config()).await;
    f.server.push(&ServerMessage::AuthenticationError {
        message: "token expired".into(),
    });
    f.server.push(&ServerMessage::Error {
        message: "rate limited".into(),
    });

    wait_until(|| f.log.contains(|e| e.kind() == EventKind::ServerError)).await;
    assert!(f.log.contains(|e| matches!(
        e,
        HubEvent::AuthenticationFailed { message } if message == "token expired"
    )));
}

// ════════════════════════════════════════════════════════════════════
// Lifecycle
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn connection_transitions_are_published() {
    let f = start(config()).await;
    wait_until(|| {
        f.log
            .contains(|e| *e == HubEvent::ConnectionStateChanged(ConnectionState::Connected))
    })
    .await;

    f.hub.shutdown().await;
    assert_eq!(f.hub.connection_state(), ConnectionState::Disconnected);
    assert!(f.server.client_closed());
    assert_eq!(
        f.log.snapshot().last(),
        Some(&HubEvent::ConnectionStateChanged(
            ConnectionState::Disconnected
        ))
    );
}
