#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
//! Connection manager lifecycle tests.
//!
//! Drives a real `ConnectionManager` against the scripted `FakeConnector`
//! from `tests/common`, with tokio's clock paused so backoff delays elapse
//! instantly.

mod common;

use std::sync::Arc;
use std::time::Duration;

use signal_hub_client::protocol::{ClientMessage, ServerMessage};
use signal_hub_client::{ConnectionManager, ConnectionState, HubConfig, HubError, ReconnectPolicy};

use common::{fake_connector, init_tracing, wait_until};

fn config() -> HubConfig {
    HubConfig::new("me").with_heartbeat_interval(None)
}

fn end_call(id: &str) -> ClientMessage {
    ClientMessage::CallEnd {
        call_id: id.into(),
    }
}

// ════════════════════════════════════════════════════════════════════
// Connect and send
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn connect_then_send_writes_frame() {
    init_tracing();
    let (connector, script) = fake_connector();
    let mut server = script.accept();
    let (manager, _inbound) = ConnectionManager::new(connector, &config());

    manager.connect("tok-1").await.unwrap();
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(script.tokens(), vec!["tok-1".to_owned()]);

    manager.send(end_call("c1")).await.unwrap();
    assert_eq!(server.next_frame().await, end_call("c1"));
}

#[tokio::test(start_paused = true)]
async fn send_while_disconnected_fails_fast() {
    let (connector, _script) = fake_connector();
    let (manager, _inbound) = ConnectionManager::new(connector, &config());

    let err = manager.send(ClientMessage::Ping).await.unwrap_err();
    assert!(matches!(err, HubError::NotConnected));
    assert!(matches!(
        manager.enqueue(ClientMessage::Ping),
        Err(HubError::NotConnected)
    ));
}

#[tokio::test(start_paused = true)]
async fn inbound_frames_arrive_in_order_and_malformed_ones_are_dropped() {
    let (connector, script) = fake_connector();
    let server = script.accept();
    let (manager, mut inbound) = ConnectionManager::new(connector, &config());
    manager.connect("tok").await.unwrap();

    server.push_raw("not json at all");
    server.push_raw(r#"{"type":"NoSuchMessage"}"#);
    server.push(&ServerMessage::Pong);
    server.push(&ServerMessage::TokenRefreshed);

    assert_eq!(inbound.recv().await.unwrap(), ServerMessage::Pong);
    assert_eq!(inbound.recv().await.unwrap(), ServerMessage::TokenRefreshed);
    assert_eq!(manager.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn heartbeat_pings_while_connected() {
    let (connector, script) = fake_connector();
    let mut server = script.accept();
    let config = HubConfig::new("me").with_heartbeat_interval(Some(Duration::from_secs(25)));
    let (manager, _inbound) = ConnectionManager::new(connector, &config);
    manager.connect("tok").await.unwrap();

    tokio::time::sleep(Duration::from_secs(24)).await;
    assert!(server.drain().is_empty());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(server.drain(), vec![ClientMessage::Ping]);
}

#[tokio::test(start_paused = true)]
async fn zero_heartbeat_period_disables_pings() {
    let (connector, script) = fake_connector();
    let mut server = script.accept();
    let mut config = config();
    config.heartbeat_interval = Some(Duration::ZERO);
    let (manager, _inbound) = ConnectionManager::new(connector, &config);
    manager.connect("tok").await.unwrap();

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert!(server.drain().is_empty());

    manager.send(end_call("c1")).await.unwrap();
    assert_eq!(server.next_frame().await, end_call("c1"));
}

#[tokio::test(start_paused = true)]
async fn connector_need_not_be_sync() {
    // `Cell` is `Send` but not `Sync`.
    struct Counting {
        dials: std::cell::Cell<u32>,
    }

    #[async_trait::async_trait]
    impl signal_hub_client::Connector for Counting {
        async fn connect(
            &mut self,
            _token: &str,
        ) -> Result<Box<dyn signal_hub_client::Transport>, HubError> {
            self.dials.set(self.dials.get() + 1);
            Err(HubError::Connection("offline".into()))
        }
    }

    let connector = Counting {
        dials: std::cell::Cell::new(0),
    };
    let (manager, _inbound) = ConnectionManager::new(connector, &config());
    assert!(matches!(
        manager.connect("tok").await,
        Err(HubError::Connection(_))
    ));
    assert_eq!(manager.state(), ConnectionState::Failed);
}

// ════════════════════════════════════════════════════════════════════
// Failure and retry
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn failed_initial_connect_is_not_retried_automatically() {
    let (connector, script) = fake_connector();
    script.reject(HubError::Connection("refused".into()));
    let (manager, _inbound) = ConnectionManager::new(connector, &config());

    let err = manager.connect("tok").await.unwrap_err();
    assert!(matches!(err, HubError::Connection(_)));
    assert_eq!(manager.state(), ConnectionState::Failed);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(script.dials(), 1);

    let _server = script.accept();
    manager.retry().await.unwrap();
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(script.tokens(), vec!["tok".to_owned(), "tok".to_owned()]);
}

#[tokio::test(start_paused = true)]
async fn retry_without_a_token_is_rejected() {
    let (connector, _script) = fake_connector();
    let (manager, _inbound) = ConnectionManager::new(connector, &config());
    assert!(matches!(
        manager.retry().await,
        Err(HubError::InvalidArgument(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn connect_times_out_when_dial_hangs() {
    struct Hanging;

    #[async_trait::async_trait]
    impl signal_hub_client::Connector for Hanging {
        async fn connect(
            &mut self,
            _token: &str,
        ) -> Result<Box<dyn signal_hub_client::Transport>, HubError> {
            std::future::pending().await
        }
    }

    let config = config().with_connect_timeout(Duration::from_secs(3));
    let (manager, _inbound) = ConnectionManager::new(Hanging, &config);
    assert!(matches!(
        manager.connect("tok").await,
        Err(HubError::Timeout)
    ));
    assert_eq!(manager.state(), ConnectionState::Failed);
}

// ════════════════════════════════════════════════════════════════════
// Reconnection
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn network_loss_buffers_sends_and_flushes_them_in_order() {
    init_tracing();
    let (connector, script) = fake_connector();
    let mut first = script.accept();
    let (manager, _inbound) = ConnectionManager::new(connector, &config());
    manager.connect("tok").await.unwrap();
    let mut states = manager.subscribe_state();

    first.drop_connection();
    states
        .wait_for(|s| *s == ConnectionState::Reconnecting)
        .await
        .unwrap();

    manager.enqueue(end_call("1")).unwrap();
    manager.enqueue(end_call("2")).unwrap();
    manager.enqueue(end_call("3")).unwrap();

    let mut second = script.accept();
    states
        .wait_for(|s| *s == ConnectionState::Connected)
        .await
        .unwrap();

    assert_eq!(second.next_frame().await, end_call("1"));
    assert_eq!(second.next_frame().await, end_call("2"));
    assert_eq!(second.next_frame().await, end_call("3"));
    assert_eq!(manager.queued(), 0);
}

#[tokio::test(start_paused = true)]
async fn exhausted_reconnect_moves_to_failed_and_rejects_sends() {
    let (connector, script) = fake_connector();
    let mut server = script.accept();
    let config = config().with_reconnect_policy(ReconnectPolicy::immediate(2));
    let (manager, _inbound) = ConnectionManager::new(connector, &config);
    manager.connect("tok").await.unwrap();
    let mut states = manager.subscribe_state();

    server.drop_connection();
    states
        .wait_for(|s| *s == ConnectionState::Failed)
        .await
        .unwrap();

    assert_eq!(script.dials(), 3);
    assert!(matches!(
        manager.send(ClientMessage::Ping).await,
        Err(HubError::NotConnected)
    ));

    let _server = script.accept();
    manager.retry().await.unwrap();
    assert_eq!(manager.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn rejected_token_during_reconnect_fails_without_more_attempts() {
    let (connector, script) = fake_connector();
    let mut server = script.accept();
    let (manager, _inbound) = ConnectionManager::new(connector, &config());
    manager.connect("tok").await.unwrap();
    let mut states = manager.subscribe_state();

    script.reject(HubError::AuthRejected("expired".into()));
    server.drop_connection();
    states
        .wait_for(|s| *s == ConnectionState::Failed)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(script.dials(), 2);
}

#[tokio::test(start_paused = true)]
async fn disconnect_cancels_backoff_and_fails_buffered_sends() {
    let (connector, script) = fake_connector();
    let mut server = script.accept();
    let (manager, _inbound) = ConnectionManager::new(connector, &config());
    let manager = Arc::new(manager);
    manager.connect("tok").await.unwrap();
    let mut states = manager.subscribe_state();

    server.drop_connection();
    states
        .wait_for(|s| *s == ConnectionState::Reconnecting)
        .await
        .unwrap();

    let sender = Arc::clone(&manager);
    let pending = tokio::spawn(async move { sender.send(end_call("late")).await });
    wait_until(|| manager.queued() == 1).await;

    manager.disconnect().await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(matches!(
        pending.await.unwrap(),
        Err(HubError::NotConnected)
    ));

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(script.dials(), 1);
}

#[tokio::test(start_paused = true)]
async fn full_buffer_rejects_sends_with_queue_full() {
    let (connector, script) = fake_connector();
    let mut server = script.accept();
    let config = config().with_outbound_queue_capacity(2);
    let (manager, _inbound) = ConnectionManager::new(connector, &config);
    manager.connect("tok").await.unwrap();
    let mut states = manager.subscribe_state();

    server.drop_connection();
    states
        .wait_for(|s| *s == ConnectionState::Reconnecting)
        .await
        .unwrap();

    manager.enqueue(end_call("1")).unwrap();
    manager.enqueue(end_call("2")).unwrap();
    wait_until(|| manager.queued() == 2).await;

    assert!(matches!(
        manager.enqueue(end_call("3")),
        Err(HubError::QueueFull)
    ));
    assert!(matches!(
        manager.send(end_call("4")).await,
        Err(HubError::QueueFull)
    ));
}

// ════════════════════════════════════════════════════════════════════
// Token refresh
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn refresh_token_reauthenticates_in_place_when_supported() {
    let (connector, script) = fake_connector();
    let mut server = script.accept_with_reauth(true);
    let (manager, _inbound) = ConnectionManager::new(connector, &config());
    manager.connect("tok-1").await.unwrap();

    manager.refresh_token("tok-2").unwrap();
    assert_eq!(
        server.next_frame().await,
        ClientMessage::RefreshToken {
            token: "tok-2".into()
        }
    );
    assert_eq!(script.dials(), 1);
    assert_eq!(manager.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn refresh_token_redials_when_transport_cannot_reauthenticate() {
    let (connector, script) = fake_connector();
    let first = script.accept();
    let (manager, _inbound) = ConnectionManager::new(connector, &config());
    manager.connect("tok-1").await.unwrap();

    let mut second = script.accept();
    manager.refresh_token("tok-2").unwrap();
    wait_until(|| script.dials() == 2 && manager.state() == ConnectionState::Connected).await;

    assert_eq!(
        script.tokens(),
        vec!["tok-1".to_owned(), "tok-2".to_owned()]
    );
    assert!(first.client_closed());

    manager.send(end_call("after")).await.unwrap();
    assert_eq!(second.next_frame().await, end_call("after"));
}

// ════════════════════════════════════════════════════════════════════
// Shutdown
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn shutdown_closes_transport_and_is_idempotent() {
    let (connector, script) = fake_connector();
    let server = script.accept();
    let (manager, _inbound) = ConnectionManager::new(connector, &config());
    manager.connect("tok").await.unwrap();

    manager.shutdown().await;
    manager.shutdown().await;

    assert!(server.client_closed());
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(matches!(
        manager.send(ClientMessage::Ping).await,
        Err(HubError::NotConnected)
    ));
}
