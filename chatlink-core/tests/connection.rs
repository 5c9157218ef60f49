//! Connection lifecycle tests.
//!
//! Tests cover:
//! - connect/disconnect transitions and their preconditions
//! - reconnect attempt numbering, policy give-up, preference gating
//! - certificate rejection suppressing auto-reconnect
//! - stale session events and sink release

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chatlink_core::config::Settings;
use chatlink_core::history::HISTORY_MAX_COUNT;
use chatlink_core::prefs::NetworkType;
use chatlink_core::{
    ChannelListListener, Connection, ConnectionError, ConnectionStatus, InfoListener, ServerConfig, SessionEvent,
};

use common::{ConnectScript, Harness, RecordingPolicy, settle, wait_until};

fn server() -> ServerConfig {
    ServerConfig::new("test", "127.0.0.1:6667", "tester")
}

fn channels(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

async fn connected(h: &Harness, config: ServerConfig, initial: Vec<String>) -> Arc<Connection> {
    let conn = Connection::new(config, initial, h.deps.clone());
    conn.connect().unwrap();
    wait_until("connected", || conn.is_connected()).await;
    conn
}

#[derive(Default)]
struct CountingListener {
    info: AtomicUsize,
    channels: AtomicUsize,
}

impl InfoListener for CountingListener {
    fn connection_info_changed(&self, _connection: &Connection) {
        self.info.fetch_add(1, Ordering::SeqCst);
    }
}

impl ChannelListListener for CountingListener {
    fn channel_list_changed(&self, _connection: &Connection, _channels: &[String]) {
        self.channels.fetch_add(1, Ordering::SeqCst);
    }
}

/// Every status seen by an info listener, in notification order.
#[derive(Default)]
struct StatusTrail(parking_lot::Mutex<Vec<ConnectionStatus>>);

impl InfoListener for StatusTrail {
    fn connection_info_changed(&self, connection: &Connection) {
        let mut trail = self.0.lock();
        trail.push(connection.status());
    }
}

#[tokio::test]
async fn connect_reaches_connected() {
    let h = Harness::new();
    let conn = Connection::new(server(), Vec::new(), h.deps.clone());
    assert_eq!(conn.status(), ConnectionStatus::Idle);
    assert_eq!(conn.reconnect_attempt(), -1);

    conn.connect().unwrap();
    assert_eq!(conn.status(), ConnectionStatus::Connecting);
    wait_until("connected", || conn.is_connected()).await;

    assert_eq!(conn.reconnect_attempt(), 0);
    assert!(!conn.user_disconnect_requested());
    assert_eq!(conn.user_nick().as_deref(), Some("tester"));
    assert_eq!(h.factory.created_count(), 1);
    assert_eq!(h.sinks.opened().len(), 1);
}

#[tokio::test]
async fn connect_while_connected_is_noop() {
    let h = Harness::new();
    let conn = connected(&h, server(), Vec::new()).await;

    conn.connect().unwrap();
    settle().await;

    assert!(conn.is_connected());
    assert_eq!(h.factory.created_count(), 1);
    assert_eq!(h.factory.last().connect_count(), 1);
}

#[tokio::test]
async fn connect_while_connecting_is_noop() {
    let h = Harness::new();
    h.factory.script(&[ConnectScript::Hang]);
    let conn = Connection::new(server(), Vec::new(), h.deps.clone());

    conn.connect().unwrap();
    conn.connect().unwrap();
    settle().await;

    assert!(conn.is_connecting());
    assert_eq!(h.factory.created_count(), 1);
    assert_eq!(h.factory.last().connect_count(), 1);
}

#[tokio::test]
async fn connect_while_disconnecting_is_rejected() {
    let h = Harness::new();
    h.factory.script(&[ConnectScript::Hang]);
    let conn = Connection::new(server(), Vec::new(), h.deps.clone());

    conn.connect().unwrap();
    conn.disconnect();
    assert_eq!(conn.status(), ConnectionStatus::Disconnecting);
    assert_eq!(conn.connect(), Err(ConnectionError::DisconnectInProgress(conn.id())));

    wait_until("disconnected", || conn.status() == ConnectionStatus::Disconnected).await;
}

#[tokio::test]
async fn disconnect_while_connecting_aborts() {
    let h = Harness::new();
    h.factory.script(&[ConnectScript::Hang]);
    let conn = Connection::new(server(), Vec::new(), h.deps.clone());

    conn.connect().unwrap();
    conn.disconnect();
    assert_eq!(conn.status(), ConnectionStatus::Disconnecting);

    wait_until("disconnected", || conn.status() == ConnectionStatus::Disconnected).await;
    settle().await;

    let session = h.factory.last();
    assert_eq!(session.disconnect_count(), 1);
    assert!(session.quits.lock().is_empty());
    assert!(conn.user_disconnect_requested());
    assert_eq!(h.scheduler.pending(), 0);
    assert!(h.policy.attempts().is_empty());
    assert_eq!(h.sinks.opened()[0].close_count(), 1);
}

#[tokio::test]
async fn disconnect_when_connected_quits_gracefully() {
    let h = Harness::new();
    h.settings.update(|s| s.quit_message = "bye now".to_string());
    let conn = connected(&h, server(), Vec::new()).await;

    conn.disconnect();
    wait_until("disconnected", || conn.status() == ConnectionStatus::Disconnected).await;

    let session = h.factory.last();
    assert_eq!(*session.quits.lock(), vec!["bye now".to_string()]);
    assert_eq!(session.disconnect_count(), 1);
    assert!(conn.user_disconnect_requested());
    assert_eq!(h.scheduler.pending(), 0);
    assert_eq!(h.sinks.opened()[0].close_count(), 1);
}

#[tokio::test]
async fn disconnect_when_idle_finalizes_without_session() {
    let h = Harness::new();
    let conn = Connection::new(server(), Vec::new(), h.deps.clone());
    let listener = Arc::new(CountingListener::default());
    conn.subscribe_info(listener.clone());

    conn.disconnect();
    conn.disconnect();

    assert_eq!(conn.status(), ConnectionStatus::Disconnected);
    assert!(conn.user_disconnect_requested());
    assert_eq!(listener.info.load(Ordering::SeqCst), 2);
    assert_eq!(h.factory.created_count(), 0);
}

#[tokio::test]
async fn sink_closed_once_across_repeated_disconnects() {
    let h = Harness::new();
    let conn = connected(&h, server(), Vec::new()).await;

    conn.disconnect();
    wait_until("disconnected", || conn.status() == ConnectionStatus::Disconnected).await;
    conn.disconnect();
    conn.disconnect();
    settle().await;

    assert_eq!(h.sinks.opened().len(), 1);
    assert_eq!(h.sinks.opened()[0].close_count(), 1);
}

#[tokio::test]
async fn reconnect_after_disconnect_uses_fresh_session() {
    let h = Harness::new();
    let conn = connected(&h, server(), Vec::new()).await;

    conn.disconnect();
    wait_until("disconnected", || conn.status() == ConnectionStatus::Disconnected).await;
    conn.connect().unwrap();
    assert!(!conn.user_disconnect_requested());
    wait_until("reconnected", || conn.is_connected()).await;

    assert_eq!(h.factory.created_count(), 2);
    assert_eq!(h.sinks.opened().len(), 2);
    assert_eq!(h.sinks.opened()[0].close_count(), 1);
    assert_eq!(h.sinks.opened()[1].close_count(), 0);
}

#[tokio::test]
async fn failed_attempts_count_up_from_zero() {
    let h = Harness::new();
    h.factory
        .script(&[ConnectScript::Fail, ConnectScript::Fail, ConnectScript::Fail, ConnectScript::Succeed]);
    let conn = Connection::new(server(), Vec::new(), h.deps.clone());

    conn.connect().unwrap();
    for expected in 1..=3 {
        wait_until("timer queued", || h.scheduler.pending() == 1).await;
        assert_eq!(conn.status(), ConnectionStatus::Disconnected);
        assert_eq!(conn.reconnect_attempt(), expected);
        assert!(h.scheduler.fire_next());
    }
    wait_until("connected", || conn.is_connected()).await;

    assert_eq!(h.policy.attempts(), vec![0, 1, 2]);
    assert_eq!(conn.reconnect_attempt(), 0);
    // The session survives failed attempts and is reused.
    assert_eq!(h.factory.created_count(), 1);
    assert_eq!(h.factory.last().connect_count(), 4);
}

#[tokio::test]
async fn drop_after_success_restarts_at_attempt_zero() {
    let h = Harness::new();
    let conn = connected(&h, server(), Vec::new()).await;

    h.factory
        .last()
        .emit(SessionEvent::Dropped {
            reason: "ping timeout".to_string(),
        })
        .await;
    wait_until("timer queued", || h.scheduler.pending() == 1).await;

    assert_eq!(conn.status(), ConnectionStatus::Disconnected);
    assert_eq!(h.policy.attempts(), vec![0]);
    assert_eq!(conn.reconnect_attempt(), 1);

    assert!(h.scheduler.fire_next());
    wait_until("reconnected", || conn.is_connected()).await;
    assert_eq!(conn.reconnect_attempt(), 0);
    assert_eq!(h.sinks.opened()[0].close_count(), 0);
}

#[tokio::test]
async fn policy_giving_up_stops_reconnecting() {
    let h = Harness::with_policy(RecordingPolicy::with_limit(3));
    h.factory.script(&[ConnectScript::Fail; 4]);
    let conn = Connection::new(server(), Vec::new(), h.deps.clone());

    conn.connect().unwrap();
    for _ in 0..3 {
        wait_until("timer queued", || h.scheduler.pending() == 1).await;
        assert!(h.scheduler.fire_next());
    }
    wait_until("policy consulted", || h.policy.attempts().len() == 4).await;
    settle().await;

    assert_eq!(h.policy.attempts(), vec![0, 1, 2, 3]);
    assert_eq!(h.scheduler.pending(), 0);
    assert_eq!(conn.status(), ConnectionStatus::Disconnected);
    assert!(!conn.user_disconnect_requested());
}

#[tokio::test]
async fn disconnect_suppresses_pending_reconnect() {
    let h = Harness::new();
    h.factory.script(&[ConnectScript::Fail]);
    let conn = Connection::new(server(), Vec::new(), h.deps.clone());

    conn.connect().unwrap();
    wait_until("timer queued", || h.scheduler.pending() == 1).await;
    conn.disconnect();
    assert!(h.scheduler.fire_next());
    settle().await;

    assert_eq!(conn.status(), ConnectionStatus::Disconnected);
    assert_eq!(h.factory.last().connect_count(), 1);
    assert_eq!(h.scheduler.pending(), 0);
}

#[tokio::test]
async fn reconnect_timer_respects_wifi_rule() {
    let settings = Settings {
        reconnect_wifi_required: true,
        ..Settings::default()
    };
    let h = Harness::build(RecordingPolicy::default(), settings, NetworkType::Cellular);
    h.factory.script(&[ConnectScript::Fail]);
    let conn = Connection::new(server(), Vec::new(), h.deps.clone());

    conn.connect().unwrap();
    wait_until("timer queued", || h.scheduler.pending() == 1).await;
    assert!(h.scheduler.fire_next());
    settle().await;

    assert_eq!(conn.status(), ConnectionStatus::Disconnected);
    assert_eq!(h.factory.last().connect_count(), 1);
}

#[tokio::test]
async fn reconnect_timer_respects_connectivity_change_setting() {
    let h = Harness::new();
    h.factory.script(&[ConnectScript::Fail]);
    let conn = Connection::new(server(), Vec::new(), h.deps.clone());

    conn.connect().unwrap();
    wait_until("timer queued", || h.scheduler.pending() == 1).await;
    h.settings.update(|s| s.reconnect_on_connectivity_change = false);
    assert!(h.scheduler.fire_next());
    settle().await;

    assert_eq!(conn.status(), ConnectionStatus::Disconnected);
    assert_eq!(h.factory.last().connect_count(), 1);
}

#[tokio::test]
async fn reconnect_timer_respects_disabled_setting() {
    let h = Harness::new();
    h.factory.script(&[ConnectScript::Fail]);
    let conn = Connection::new(server(), Vec::new(), h.deps.clone());

    conn.connect().unwrap();
    wait_until("timer queued", || h.scheduler.pending() == 1).await;
    h.settings.update(|s| s.reconnect_enabled = false);
    assert!(h.scheduler.fire_next());
    settle().await;

    assert_eq!(conn.status(), ConnectionStatus::Disconnected);
    assert_eq!(h.factory.last().connect_count(), 1);
}

#[tokio::test]
async fn certificate_rejection_suppresses_reconnect() {
    let h = Harness::new();
    h.factory.script(&[ConnectScript::RejectCertificate]);
    let conn = Connection::new(server(), Vec::new(), h.deps.clone());

    conn.connect().unwrap();
    wait_until("disconnected", || conn.status() == ConnectionStatus::Disconnected).await;
    settle().await;

    assert!(conn.user_disconnect_requested());
    assert_eq!(h.scheduler.pending(), 0);
    assert!(h.policy.attempts().is_empty());

    // An explicit connect still works afterwards.
    conn.connect().unwrap();
    assert!(!conn.user_disconnect_requested());
    wait_until("connected", || conn.is_connected()).await;
}

#[tokio::test]
async fn session_creation_failure_schedules_retry() {
    let h = Harness::new();
    h.factory.fail_create(true);
    let conn = Connection::new(server(), Vec::new(), h.deps.clone());

    conn.connect().unwrap();
    assert_eq!(conn.status(), ConnectionStatus::Disconnected);
    assert_eq!(h.scheduler.pending(), 1);
    assert_eq!(h.policy.attempts(), vec![0]);
    // The sink opened for the failed attempt is not leaked.
    assert_eq!(h.sinks.opened()[0].close_count(), 1);

    h.factory.fail_create(false);
    assert!(h.scheduler.fire_next());
    wait_until("connected", || conn.is_connected()).await;
}

#[tokio::test]
async fn joins_autojoin_then_previous_channels() {
    let h = Harness::new();
    let mut config = server();
    config.autojoin = channels(&["#a"]);
    let conn = connected(&h, config, channels(&["#a", "#b"])).await;

    let session = h.factory.last();
    wait_until("join requested", || !session.joined().is_empty()).await;
    assert_eq!(session.joined(), vec![channels(&["#a", "#a", "#b"])]);
    assert!(conn.is_connected());
}

#[tokio::test]
async fn reconnect_after_drop_rejoins_reported_channels() {
    let h = Harness::new();
    let mut config = server();
    config.autojoin = channels(&["#a"]);
    let conn = connected(&h, config, Vec::new()).await;
    let session = h.factory.last();
    wait_until("autojoin requested", || session.joined().len() == 1).await;

    session.emit(SessionEvent::ChannelsChanged(channels(&["#a", "#b"]))).await;
    wait_until("channels reported", || conn.channels().len() == 2).await;
    session
        .emit(SessionEvent::Dropped {
            reason: "ping timeout".to_string(),
        })
        .await;
    wait_until("timer queued", || h.scheduler.pending() == 1).await;

    assert!(h.scheduler.fire_next());
    wait_until("rejoin requested", || session.joined().len() == 2).await;
    assert_eq!(session.joined(), vec![channels(&["#a"]), channels(&["#a", "#a", "#b"])]);
    assert_eq!(h.factory.created_count(), 1);
}

#[tokio::test]
async fn rejoin_disabled_joins_only_autojoin() {
    let h = Harness::new();
    let mut config = server();
    config.autojoin = channels(&["#a"]);
    config.rejoin_channels = false;
    let _conn = connected(&h, config, channels(&["#b"])).await;

    let session = h.factory.last();
    wait_until("join requested", || !session.joined().is_empty()).await;
    assert_eq!(session.joined(), vec![channels(&["#a"])]);
}

#[tokio::test]
async fn nothing_to_join_sends_no_join() {
    let h = Harness::new();
    let _conn = connected(&h, server(), Vec::new()).await;
    settle().await;
    assert!(h.factory.last().joined().is_empty());
}

#[tokio::test]
async fn set_channels_notifies_each_call_once() {
    let h = Harness::new();
    let conn = Connection::new(server(), Vec::new(), h.deps.clone());
    let listener = Arc::new(CountingListener::default());
    let id = conn.subscribe_channels(listener.clone());

    conn.set_channels(channels(&["#rust"]));
    assert_eq!(listener.channels.load(Ordering::SeqCst), 1);
    conn.set_channels(channels(&["#rust"]));
    assert_eq!(listener.channels.load(Ordering::SeqCst), 2);
    assert_eq!(conn.channels(), channels(&["#rust"]));

    assert!(conn.unsubscribe_channels(id));
    conn.set_channels(Vec::new());
    assert_eq!(listener.channels.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn session_channel_events_update_snapshot() {
    let h = Harness::new();
    let conn = connected(&h, server(), Vec::new()).await;

    h.factory
        .last()
        .emit(SessionEvent::ChannelsChanged(channels(&["#x", "#y"])))
        .await;
    wait_until("channels updated", || conn.channels().len() == 2).await;
    assert_eq!(conn.channels(), channels(&["#x", "#y"]));
}

#[tokio::test]
async fn events_from_replaced_session_are_ignored() {
    let h = Harness::new();
    let conn = connected(&h, server(), Vec::new()).await;
    let old = h.factory.last();

    conn.disconnect();
    wait_until("disconnected", || conn.status() == ConnectionStatus::Disconnected).await;
    conn.connect().unwrap();
    wait_until("reconnected", || conn.is_connected()).await;
    let new = h.factory.last();
    assert!(!Arc::ptr_eq(&old, &new));

    old.emit(SessionEvent::ChannelsChanged(channels(&["#stale"]))).await;
    old.emit(SessionEvent::Dropped {
        reason: "stale".to_string(),
    })
    .await;
    settle().await;

    assert!(conn.is_connected());
    assert!(conn.channels().is_empty());
    assert_eq!(h.scheduler.pending(), 0);

    new.emit(SessionEvent::ChannelsChanged(channels(&["#fresh"]))).await;
    wait_until("channels updated", || conn.channels() == channels(&["#fresh"])).await;
}

#[tokio::test]
async fn drop_while_connecting_is_ignored() {
    let h = Harness::new();
    h.factory.script(&[ConnectScript::Hang]);
    let conn = Connection::new(server(), Vec::new(), h.deps.clone());

    conn.connect().unwrap();
    h.factory
        .last()
        .emit(SessionEvent::Dropped {
            reason: "early".to_string(),
        })
        .await;
    settle().await;

    assert!(conn.is_connecting());
    assert_eq!(h.scheduler.pending(), 0);
}

#[tokio::test]
async fn sent_history_keeps_latest_entries() {
    let h = Harness::new();
    let conn = Connection::new(server(), Vec::new(), h.deps.clone());
    for i in 0..30 {
        conn.add_sent_message(format!("message {i}"));
    }

    let history = conn.sent_history();
    assert_eq!(history.len(), HISTORY_MAX_COUNT);
    assert_eq!(history.first().map(String::as_str), Some("message 6"));
    assert_eq!(history.last().map(String::as_str), Some("message 29"));
}

#[tokio::test]
async fn drawer_flag_defaults_expanded() {
    let h = Harness::new();
    let conn = Connection::new(server(), Vec::new(), h.deps.clone());
    assert!(conn.is_expanded_in_drawer());
    conn.set_expanded_in_drawer(false);
    assert!(!conn.is_expanded_in_drawer());
}

#[tokio::test]
async fn snapshot_serializes_status() {
    let h = Harness::new();
    let conn = connected(&h, server(), channels(&["#a"])).await;

    let snapshot = conn.snapshot();
    assert_eq!(snapshot.status, ConnectionStatus::Connected);
    assert_eq!(snapshot.channels, channels(&["#a"]));

    let json: serde_json::Value = serde_json::from_str(&snapshot.to_json().unwrap()).unwrap();
    assert_eq!(json["status"], "connected");
    assert_eq!(json["nick"], "tester");
    assert_eq!(json["reconnect_attempt"], 0);
}

#[tokio::test]
async fn send_message_requires_connection_and_records_history() {
    let h = Harness::new();
    let conn = Connection::new(server(), Vec::new(), h.deps.clone());
    assert!(conn.send_message("#rust", "too early").await.is_err());
    assert!(conn.sent_history().is_empty());

    conn.connect().unwrap();
    wait_until("connected", || conn.is_connected()).await;
    conn.send_message("#rust", "hello").await.unwrap();

    assert_eq!(*h.factory.last().sent.lock(), vec![("#rust".to_string(), "hello".to_string())]);
    assert_eq!(conn.sent_history(), vec!["hello".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_only_take_legal_transitions() {
    let h = Harness::new();
    let conn = Connection::new(server(), Vec::new(), h.deps.clone());
    let trail = Arc::new(StatusTrail::default());
    conn.subscribe_info(trail.clone());

    let mut callers = Vec::new();
    for worker in 0..4 {
        let conn = Arc::clone(&conn);
        callers.push(tokio::spawn(async move {
            for round in 0..50 {
                if (worker + round) % 2 == 0 {
                    if let Err(e) = conn.connect() {
                        assert!(matches!(e, ConnectionError::DisconnectInProgress(_)), "{e}");
                    }
                } else {
                    conn.disconnect();
                }
                tokio::task::yield_now().await;
            }
        }));
    }
    // A caller panics if the state machine takes an illegal edge.
    for caller in callers {
        caller.await.unwrap();
    }

    conn.disconnect();
    wait_until("settled", || conn.status() == ConnectionStatus::Disconnected).await;
    settle().await;
    h.scheduler.assert_no_panics().await;

    let trail = trail.0.lock().clone();
    assert!(!trail.is_empty());
    assert!(!trail.contains(&ConnectionStatus::Idle));
    for sink in h.sinks.opened() {
        assert_eq!(sink.close_count(), 1);
    }
}
