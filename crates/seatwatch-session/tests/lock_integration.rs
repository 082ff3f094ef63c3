//! Integration tests for the session lock facility.
//!
//! These drive `SessionLock` end to end over `MockBus`: session lookup,
//! property access, signal fan-out, match reference counting, fault
//! handling and teardown.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use seatwatch_core::mock::MockBus;
use seatwatch_core::{BusValue, MatchRule, ObjectPath, Signal, TransportError};
use seatwatch_session::login1;
use seatwatch_session::{Error, SessionLock};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

// ============================================================================
// Constants
// ============================================================================

const SESSION_ID: &str = "2";
const SESSION_PATH: &str = "/org/freedesktop/login1/session/_32";

/// How long to wait for something that should happen
const RECV_TIMEOUT: Duration = Duration::from_millis(500);

/// How long to wait before deciding something did not happen
const QUIET_PERIOD: Duration = Duration::from_millis(50);

// ============================================================================
// Test Helpers
// ============================================================================

fn session_entry(id: &str, path: &str) -> BusValue {
    BusValue::Struct(vec![
        id.into(),
        BusValue::U32(1000),
        "user".into(),
        "seat0".into(),
        ObjectPath::new(path).into(),
    ])
}

/// A bus where logind knows sessions "1" and "2", the latter unlocked.
fn logind_bus() -> MockBus {
    let bus = MockBus::new();
    bus.set_reply(
        login1::MANAGER_INTERFACE,
        login1::LIST_SESSIONS,
        vec![BusValue::Array(vec![
            session_entry("1", "/org/freedesktop/login1/session/_31"),
            session_entry(SESSION_ID, SESSION_PATH),
        ])],
    );
    bus.set_property(
        &ObjectPath::new(SESSION_PATH),
        login1::SESSION_INTERFACE,
        login1::LOCKED_HINT,
        BusValue::Bool(false),
    );
    bus
}

async fn open(bus: &MockBus) -> SessionLock {
    SessionLock::new(Arc::new(bus.clone()), SESSION_ID)
        .await
        .expect("open session lock")
}

fn rule(interface: &str, member: &str) -> MatchRule {
    MatchRule::new(
        login1::DESTINATION,
        ObjectPath::new(SESSION_PATH),
        interface,
        member,
    )
}

fn lock_signal(path: &str) -> Signal {
    Signal::new(path, login1::SESSION_INTERFACE, login1::LOCK, Vec::new())
}

fn locked_hint_changed(value: BusValue) -> Signal {
    let mut changed = HashMap::new();
    changed.insert(
        login1::LOCKED_HINT.to_string(),
        BusValue::Variant(Box::new(value)),
    );
    Signal::new(
        SESSION_PATH,
        login1::PROPERTIES_INTERFACE,
        login1::PROPERTIES_CHANGED,
        vec![
            login1::SESSION_INTERFACE.into(),
            BusValue::Dict(changed),
            BusValue::Array(Vec::new()),
        ],
    )
}

async fn expect_quiet<T: std::fmt::Debug>(rx: &mut mpsc::Receiver<T>) {
    if let Ok(Some(value)) = timeout(QUIET_PERIOD, rx.recv()).await {
        panic!("unexpected delivery: {value:?}");
    }
}

/// Polls `check` until it holds or `RECV_TIMEOUT` passes.
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < RECV_TIMEOUT {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(5)).await;
    }
    check()
}

// ============================================================================
// Construction
// ============================================================================

#[tokio::test]
async fn test_resolves_session_path() {
    let bus = logind_bus();
    let lock = open(&bus).await;

    assert_eq!(lock.path().as_str(), SESSION_PATH);
    assert_eq!(bus.calls_to(login1::LIST_SESSIONS).len(), 1);
}

#[tokio::test]
async fn test_empty_session_id_is_rejected() {
    let bus = logind_bus();
    let result = SessionLock::new(Arc::new(bus.clone()), "").await;

    assert!(matches!(result, Err(Error::EmptySessionId)));
    assert!(bus.calls().is_empty());
}

#[tokio::test]
async fn test_unknown_session_is_not_found() {
    let bus = logind_bus();
    let result = SessionLock::new(Arc::new(bus), "42").await;

    match result {
        Err(Error::SessionNotFound(id)) => assert_eq!(id, "42"),
        other => panic!("expected SessionNotFound, got {:?}", other.err()),
    }
}

#[tokio::test]
async fn test_malformed_session_list_is_rejected() {
    let bus = MockBus::new();
    bus.set_reply(
        login1::MANAGER_INTERFACE,
        login1::LIST_SESSIONS,
        vec![BusValue::Array(vec![BusValue::Struct(vec![BusValue::U32(2)])])],
    );
    let result = SessionLock::new(Arc::new(bus), SESSION_ID).await;

    assert!(matches!(result, Err(Error::UnexpectedReply { .. })));
}

#[tokio::test]
async fn test_list_sessions_failure_is_transport_error() {
    let bus = MockBus::new();
    bus.set_reply_error(
        login1::MANAGER_INTERFACE,
        login1::LIST_SESSIONS,
        TransportError::call("access denied"),
    );
    let err = SessionLock::new(Arc::new(bus), SESSION_ID)
        .await
        .err()
        .expect("construction should fail");

    assert!(matches!(err, Error::Transport { .. }));
    assert!(err.to_string().contains("access denied"));
}

// ============================================================================
// Locked Hint
// ============================================================================

#[tokio::test]
async fn test_locked_hint_end_to_end() {
    let bus = logind_bus();
    let lock = open(&bus).await;

    assert!(!lock.locked().await.unwrap());

    let (tx, mut rx) = mpsc::channel(4);
    lock.add_locked_signal(tx).await.unwrap();

    bus.emit(locked_hint_changed(BusValue::Bool(true))).await;

    let received = timeout(RECV_TIMEOUT, rx.recv()).await.unwrap();
    assert_eq!(received, Some(true));
    expect_quiet(&mut rx).await;

    lock.set_locked(true).await.unwrap();
    let calls = bus.calls_to(login1::SET_LOCKED_HINT);
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].path.as_str(), SESSION_PATH);
    assert_eq!(calls[0].interface, login1::SESSION_INTERFACE);
    assert_eq!(calls[0].args, vec![BusValue::Bool(true)]);

    lock.close().await.unwrap();
}

#[tokio::test]
async fn test_unrelated_property_change_is_not_delivered() {
    let bus = logind_bus();
    let lock = open(&bus).await;

    let (tx, mut rx) = mpsc::channel(4);
    lock.add_locked_signal(tx).await.unwrap();

    let mut changed = HashMap::new();
    changed.insert("IdleHint".to_string(), BusValue::Bool(true));
    bus.emit(Signal::new(
        SESSION_PATH,
        login1::PROPERTIES_INTERFACE,
        login1::PROPERTIES_CHANGED,
        vec![
            login1::SESSION_INTERFACE.into(),
            BusValue::Dict(changed),
            BusValue::Array(Vec::new()),
        ],
    ))
    .await;

    expect_quiet(&mut rx).await;
    assert!(lock.fault().is_none());
}

#[tokio::test]
async fn test_locked_property_of_wrong_type() {
    let bus = logind_bus();
    bus.set_property(
        &ObjectPath::new(SESSION_PATH),
        login1::SESSION_INTERFACE,
        login1::LOCKED_HINT,
        "no".into(),
    );
    let lock = open(&bus).await;

    assert!(matches!(
        lock.locked().await,
        Err(Error::UnexpectedReply { .. })
    ));
}

// ============================================================================
// Lock / Unlock Signals
// ============================================================================

#[tokio::test]
async fn test_signals_for_other_sessions_are_ignored() {
    let bus = logind_bus();
    let lock = open(&bus).await;

    let (tx, mut rx) = mpsc::channel(4);
    lock.add_lock_signal(tx).await.unwrap();

    bus.emit(lock_signal("/org/freedesktop/login1/session/_31")).await;
    expect_quiet(&mut rx).await;

    bus.emit(lock_signal(SESSION_PATH)).await;
    assert_eq!(timeout(RECV_TIMEOUT, rx.recv()).await.unwrap(), Some(()));
}

#[tokio::test]
async fn test_lock_fans_out_to_every_listener() {
    let bus = logind_bus();
    let lock = open(&bus).await;

    let (tx_a, mut rx_a) = mpsc::channel(4);
    let (tx_b, mut rx_b) = mpsc::channel(4);
    let (unlock_tx, mut unlock_rx) = mpsc::channel(4);
    lock.add_lock_signal(tx_a).await.unwrap();
    lock.add_lock_signal(tx_b).await.unwrap();
    lock.add_unlock_signal(unlock_tx).await.unwrap();

    bus.emit(lock_signal(SESSION_PATH)).await;

    assert_eq!(timeout(RECV_TIMEOUT, rx_a.recv()).await.unwrap(), Some(()));
    assert_eq!(timeout(RECV_TIMEOUT, rx_b.recv()).await.unwrap(), Some(()));
    expect_quiet(&mut unlock_rx).await;

    bus.emit(Signal::new(
        SESSION_PATH,
        login1::SESSION_INTERFACE,
        login1::UNLOCK,
        Vec::new(),
    ))
    .await;
    assert_eq!(
        timeout(RECV_TIMEOUT, unlock_rx.recv()).await.unwrap(),
        Some(())
    );
}

#[tokio::test]
async fn test_full_listener_does_not_block_others() {
    let bus = logind_bus();
    let lock = open(&bus).await;

    let (slow_tx, mut slow_rx) = mpsc::channel(1);
    let (fast_tx, mut fast_rx) = mpsc::channel(8);
    lock.add_lock_signal(slow_tx).await.unwrap();
    lock.add_lock_signal(fast_tx).await.unwrap();

    for _ in 0..3 {
        bus.emit(lock_signal(SESSION_PATH)).await;
    }

    for _ in 0..3 {
        assert_eq!(timeout(RECV_TIMEOUT, fast_rx.recv()).await.unwrap(), Some(()));
    }
    // The slow listener kept only what fit in its buffer.
    assert_eq!(slow_rx.recv().await, Some(()));
    expect_quiet(&mut slow_rx).await;
}

// ============================================================================
// Match Reference Counting
// ============================================================================

#[tokio::test]
async fn test_match_added_once_and_removed_with_last_listener() {
    let bus = logind_bus();
    let lock = open(&bus).await;
    let lock_rule = rule(login1::SESSION_INTERFACE, login1::LOCK);

    let (tx_a, _rx_a) = mpsc::channel(1);
    let (tx_b, _rx_b) = mpsc::channel(1);
    lock.add_lock_signal(tx_a.clone()).await.unwrap();
    lock.add_lock_signal(tx_b.clone()).await.unwrap();
    lock.add_lock_signal(tx_a.clone()).await.unwrap();
    assert_eq!(bus.add_match_count(&lock_rule), 1);

    lock.remove_lock_signal(&tx_a).await.unwrap();
    assert!(bus.is_match_active(&lock_rule));

    lock.remove_lock_signal(&tx_b).await.unwrap();
    assert!(!bus.is_match_active(&lock_rule));
    assert_eq!(bus.remove_match_count(&lock_rule), 1);

    // Removing a listener that is not there changes nothing.
    lock.remove_lock_signal(&tx_b).await.unwrap();
    assert_eq!(bus.remove_match_count(&lock_rule), 1);
}

#[tokio::test]
async fn test_failed_match_leaves_no_listener() {
    let bus = logind_bus();
    let lock = open(&bus).await;
    let unlock_rule = rule(login1::SESSION_INTERFACE, login1::UNLOCK);

    bus.fail_add_match(true);
    let (tx, mut rx) = mpsc::channel(1);
    let err = lock.add_unlock_signal(tx.clone()).await.unwrap_err();
    assert!(matches!(err, Error::Transport { .. }));
    assert!(!bus.is_match_active(&unlock_rule));

    // The listener was not kept: a signal reaching the reader goes nowhere.
    bus.emit(Signal::new(
        SESSION_PATH,
        login1::SESSION_INTERFACE,
        login1::UNLOCK,
        Vec::new(),
    ))
    .await;
    expect_quiet(&mut rx).await;

    bus.fail_add_match(false);
    lock.add_unlock_signal(tx).await.unwrap();
    assert!(bus.is_match_active(&unlock_rule));
}

#[tokio::test]
async fn test_failed_match_removal_still_drops_listener() {
    let bus = logind_bus();
    let lock = open(&bus).await;

    let (tx, mut rx) = mpsc::channel(1);
    lock.add_lock_signal(tx.clone()).await.unwrap();

    bus.fail_remove_match(true);
    assert!(lock.remove_lock_signal(&tx).await.is_err());

    bus.emit(lock_signal(SESSION_PATH)).await;
    expect_quiet(&mut rx).await;
}

#[tokio::test]
async fn test_closed_listener_is_rejected() {
    let bus = logind_bus();
    let lock = open(&bus).await;

    let (tx, rx) = mpsc::channel::<bool>(1);
    drop(rx);

    assert!(matches!(
        lock.add_locked_signal(tx).await,
        Err(Error::SubscriberClosed)
    ));
    assert!(!bus.is_match_active(&rule(
        login1::PROPERTIES_INTERFACE,
        login1::PROPERTIES_CHANGED
    )));
}

#[tokio::test]
async fn test_dropped_listener_is_pruned_and_match_released() {
    let bus = logind_bus();
    let lock = open(&bus).await;
    let lock_rule = rule(login1::SESSION_INTERFACE, login1::LOCK);

    let (tx, rx) = mpsc::channel(1);
    lock.add_lock_signal(tx).await.unwrap();
    drop(rx);

    bus.emit(lock_signal(SESSION_PATH)).await;

    assert!(eventually(|| !bus.is_match_active(&lock_rule)).await);
}

// ============================================================================
// Faults and Teardown
// ============================================================================

#[tokio::test]
async fn test_protocol_violation_faults_the_facility() {
    let bus = logind_bus();
    let lock = open(&bus).await;

    let (tx, _rx) = mpsc::channel(1);
    lock.add_locked_signal(tx).await.unwrap();

    bus.emit(locked_hint_changed("yes".into())).await;
    assert!(eventually(|| lock.fault().is_some()).await);

    let fault = lock.fault().unwrap();
    assert_eq!(fault.signal, "org.freedesktop.DBus.Properties.PropertiesChanged");

    let (tx, _rx) = mpsc::channel(1);
    assert!(matches!(
        lock.add_lock_signal(tx).await,
        Err(Error::Faulted(_))
    ));
}

#[tokio::test]
async fn test_close_removes_every_match() {
    let bus = logind_bus();
    let lock = open(&bus).await;

    let (unit_tx, _unit_rx) = mpsc::channel(1);
    let (bool_tx, _bool_rx) = mpsc::channel(1);
    lock.add_lock_signal(unit_tx.clone()).await.unwrap();
    lock.add_unlock_signal(unit_tx).await.unwrap();
    lock.add_locked_signal(bool_tx).await.unwrap();

    lock.close().await.unwrap();

    assert!(!bus.is_match_active(&rule(login1::SESSION_INTERFACE, login1::LOCK)));
    assert!(!bus.is_match_active(&rule(login1::SESSION_INTERFACE, login1::UNLOCK)));
    assert!(!bus.is_match_active(&rule(
        login1::PROPERTIES_INTERFACE,
        login1::PROPERTIES_CHANGED
    )));

    // Subscribing after close is refused.
    let (tx, _rx) = mpsc::channel(1);
    assert!(lock.add_lock_signal(tx).await.is_err());
}

#[tokio::test]
async fn test_close_collects_errors_and_is_idempotent() {
    let bus = logind_bus();
    let lock = open(&bus).await;

    let (unit_tx, _unit_rx) = mpsc::channel(1);
    lock.add_lock_signal(unit_tx.clone()).await.unwrap();
    lock.add_unlock_signal(unit_tx).await.unwrap();

    bus.fail_remove_match(true);
    let first = lock.close().await.unwrap_err();
    match &first {
        Error::Teardown(teardown) => assert_eq!(teardown.failures.len(), 2),
        other => panic!("expected Teardown, got {other:?}"),
    }

    bus.fail_remove_match(false);
    let second = lock.close().await.unwrap_err();
    assert_eq!(second.to_string(), first.to_string());
}

#[tokio::test]
async fn test_subscribe_waiting_on_close_is_refused() {
    let bus = logind_bus();
    let lock = Arc::new(open(&bus).await);
    let lock_rule = rule(login1::SESSION_INTERFACE, login1::LOCK);

    let (tx, _rx) = mpsc::channel(1);
    lock.add_lock_signal(tx).await.unwrap();

    bus.delay_remove_match(Duration::from_millis(100));
    let closing = tokio::spawn({
        let lock = Arc::clone(&lock);
        async move { lock.close().await }
    });
    // Close now holds the facility lock while the match removal stalls.
    sleep(Duration::from_millis(20)).await;

    let (late, _late_rx) = mpsc::channel(1);
    let result = lock.add_lock_signal(late).await;
    assert!(matches!(result, Err(Error::ChannelClosed)));

    closing.await.unwrap().unwrap();
    assert!(!bus.is_match_active(&lock_rule));
    assert_eq!(bus.add_match_count(&lock_rule), 1);
    assert_eq!(bus.remove_match_count(&lock_rule), 1);
}

#[tokio::test]
async fn test_unsubscribe_after_close_is_a_no_op() {
    let bus = logind_bus();
    let lock = open(&bus).await;
    let lock_rule = rule(login1::SESSION_INTERFACE, login1::LOCK);

    let (tx, _rx) = mpsc::channel(1);
    lock.add_lock_signal(tx.clone()).await.unwrap();
    lock.close().await.unwrap();

    lock.remove_lock_signal(&tx).await.unwrap();
    assert_eq!(bus.remove_match_count(&lock_rule), 1);
}

#[tokio::test]
async fn test_dropping_unclosed_lock_releases_reader_and_matches() {
    let bus = logind_bus();
    let lock = open(&bus).await;
    let lock_rule = rule(login1::SESSION_INTERFACE, login1::LOCK);

    let (tx, _rx) = mpsc::channel(1);
    lock.add_lock_signal(tx).await.unwrap();
    assert_eq!(bus.signal_listeners(), 1);

    drop(lock);

    assert!(eventually(|| bus.signal_listeners() == 0).await);
    assert!(eventually(|| !bus.is_match_active(&lock_rule)).await);
    assert_eq!(bus.remove_match_count(&lock_rule), 1);
}

#[tokio::test]
async fn test_dropping_closed_lock_touches_nothing() {
    let bus = logind_bus();
    let lock = open(&bus).await;
    let lock_rule = rule(login1::SESSION_INTERFACE, login1::LOCK);

    let (tx, _rx) = mpsc::channel(1);
    lock.add_lock_signal(tx).await.unwrap();
    lock.close().await.unwrap();
    drop(lock);

    sleep(QUIET_PERIOD).await;
    assert_eq!(bus.remove_match_count(&lock_rule), 1);
    assert_eq!(bus.signal_listeners(), 0);
}
