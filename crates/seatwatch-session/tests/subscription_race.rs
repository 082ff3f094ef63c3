//! Concurrent subscribe/unsubscribe racing signal dispatch.
//!
//! Afterwards the match must be registered exactly when listeners remain.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

use std::sync::Arc;
use std::time::Duration;

use seatwatch_core::mock::MockBus;
use seatwatch_core::{BusValue, MatchRule, ObjectPath, Signal};
use seatwatch_session::login1;
use seatwatch_session::SessionLock;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::timeout;

const SESSION_PATH: &str = "/org/freedesktop/login1/session/c1";
const TASKS: usize = 32;
const ROUNDS: usize = 20;

fn logind_bus() -> MockBus {
    let bus = MockBus::new();
    bus.set_reply(
        login1::MANAGER_INTERFACE,
        login1::LIST_SESSIONS,
        vec![BusValue::Array(vec![BusValue::Struct(vec![
            "c1".into(),
            BusValue::U32(1000),
            "user".into(),
            "seat0".into(),
            ObjectPath::new(SESSION_PATH).into(),
        ])])],
    );
    bus
}

fn lock_rule() -> MatchRule {
    MatchRule::new(
        login1::DESTINATION,
        ObjectPath::new(SESSION_PATH),
        login1::SESSION_INTERFACE,
        login1::LOCK,
    )
}

fn lock_signal() -> Signal {
    Signal::new(SESSION_PATH, login1::SESSION_INTERFACE, login1::LOCK, Vec::new())
}

/// Spawns a task that keeps emitting `Lock` until told to stop.
fn spawn_emitter(bus: MockBus) -> (tokio::task::JoinHandle<()>, mpsc::Sender<()>) {
    let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop_rx.recv() => break,
                _ = bus.emit(lock_signal()) => tokio::task::yield_now().await,
            }
        }
    });
    (handle, stop_tx)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_everyone_leaves_match_released() {
    let bus = logind_bus();
    let lock = Arc::new(SessionLock::new(Arc::new(bus.clone()), "c1").await.unwrap());
    let (emitter, stop) = spawn_emitter(bus.clone());

    let mut tasks = JoinSet::new();
    for _ in 0..TASKS {
        let lock = Arc::clone(&lock);
        tasks.spawn(async move {
            for _ in 0..ROUNDS {
                let (tx, mut rx) = mpsc::channel(2);
                lock.add_lock_signal(tx.clone()).await.unwrap();
                let _ = rx.try_recv();
                lock.remove_lock_signal(&tx).await.unwrap();
            }
        });
    }
    while let Some(joined) = tasks.join_next().await {
        joined.unwrap();
    }

    stop.send(()).await.unwrap();
    emitter.await.unwrap();

    assert!(!bus.is_match_active(&lock_rule()));
    assert!(bus.add_match_count(&lock_rule()) >= 1);
    assert_eq!(
        bus.add_match_count(&lock_rule()),
        bus.remove_match_count(&lock_rule())
    );
    assert!(lock.fault().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_survivors_keep_match_and_receive() {
    let bus = logind_bus();
    let lock = Arc::new(SessionLock::new(Arc::new(bus.clone()), "c1").await.unwrap());
    let (emitter, stop) = spawn_emitter(bus.clone());

    let mut tasks = JoinSet::new();
    for i in 0..TASKS {
        let lock = Arc::clone(&lock);
        tasks.spawn(async move {
            let mut kept = None;
            for round in 0..ROUNDS {
                let (tx, rx) = mpsc::channel(64);
                lock.add_lock_signal(tx.clone()).await.unwrap();
                // Every fourth task keeps its last listener.
                if i % 4 == 0 && round == ROUNDS - 1 {
                    kept = Some(rx);
                } else {
                    lock.remove_lock_signal(&tx).await.unwrap();
                }
            }
            kept
        });
    }

    let mut survivors = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        if let Some(rx) = joined.unwrap() {
            survivors.push(rx);
        }
    }

    stop.send(()).await.unwrap();
    emitter.await.unwrap();

    assert_eq!(survivors.len(), TASKS / 4);
    assert!(bus.is_match_active(&lock_rule()));
    assert_eq!(
        bus.add_match_count(&lock_rule()),
        bus.remove_match_count(&lock_rule()) + 1
    );

    // Drain whatever arrived during the race, then check live delivery.
    for rx in &mut survivors {
        while rx.try_recv().is_ok() {}
    }
    bus.emit(lock_signal()).await;
    for rx in &mut survivors {
        let got = timeout(Duration::from_millis(500), rx.recv()).await.unwrap();
        assert_eq!(got, Some(()));
    }

    lock.close().await.unwrap();
    assert!(!bus.is_match_active(&lock_rule()));
}
