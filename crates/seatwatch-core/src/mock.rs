//! In-memory transports for tests.
//!
//! [`MockBus`] records every call and match change, serves scripted
//! replies and properties, and injects signals. [`MockIdleConnection`]
//! plays a compositor: it advertises globals, hands out notification ids,
//! records destroy and teardown requests, and emits events pushed through
//! its [`MockIdleRemote`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::bus::{BusConnection, BusValue, MatchRule, ObjectPath, Signal, SIGNAL_BUFFER};
use crate::error::TransportError;
use crate::idle::{
    Global, IdleConnection, IdleEvent, NotificationId, IDLE_NOTIFIER_INTERFACE, SEAT_INTERFACE,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Mock Bus
// ============================================================================

/// One method call seen by [`MockBus`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub destination: String,
    pub path: ObjectPath,
    pub interface: String,
    pub method: String,
    pub args: Vec<BusValue>,
}

#[derive(Default)]
struct MockBusState {
    calls: Vec<RecordedCall>,
    replies: HashMap<String, Result<Vec<BusValue>, TransportError>>,
    properties: HashMap<(ObjectPath, String), BusValue>,
    added: HashMap<MatchRule, usize>,
    removed: HashMap<MatchRule, usize>,
    fail_add_match: bool,
    fail_remove_match: bool,
    remove_match_delay: Option<Duration>,
    signal_senders: Vec<mpsc::Sender<Signal>>,
}

/// Scriptable [`BusConnection`]. Clones share state.
#[derive(Clone, Default)]
pub struct MockBus {
    state: Arc<Mutex<MockBusState>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the reply body for `interface.method`. Unscripted methods reply with an empty body.
    pub fn set_reply(&self, interface: &str, method: &str, reply: Vec<BusValue>) {
        lock(&self.state)
            .replies
            .insert(format!("{interface}.{method}"), Ok(reply));
    }

    pub fn set_reply_error(&self, interface: &str, method: &str, error: TransportError) {
        lock(&self.state)
            .replies
            .insert(format!("{interface}.{method}"), Err(error));
    }

    pub fn set_property(&self, path: &ObjectPath, interface: &str, property: &str, value: BusValue) {
        lock(&self.state)
            .properties
            .insert((path.clone(), format!("{interface}.{property}")), value);
    }

    pub fn fail_add_match(&self, fail: bool) {
        lock(&self.state).fail_add_match = fail;
    }

    pub fn fail_remove_match(&self, fail: bool) {
        lock(&self.state).fail_remove_match = fail;
    }

    /// Makes every `remove_match` wait before answering.
    pub fn delay_remove_match(&self, delay: Duration) {
        lock(&self.state).remove_match_delay = Some(delay);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.state).calls.clone()
    }

    /// Calls whose method name is `method`.
    pub fn calls_to(&self, method: &str) -> Vec<RecordedCall> {
        lock(&self.state)
            .calls
            .iter()
            .filter(|c| c.method == method)
            .cloned()
            .collect()
    }

    /// Successful `add_match` calls for `rule`.
    pub fn add_match_count(&self, rule: &MatchRule) -> usize {
        lock(&self.state).added.get(rule).copied().unwrap_or(0)
    }

    /// Successful `remove_match` calls for `rule`.
    pub fn remove_match_count(&self, rule: &MatchRule) -> usize {
        lock(&self.state).removed.get(rule).copied().unwrap_or(0)
    }

    /// True if `rule` has been added more often than removed.
    pub fn is_match_active(&self, rule: &MatchRule) -> bool {
        self.add_match_count(rule) > self.remove_match_count(rule)
    }

    /// Number of signal receivers that are still open.
    pub fn signal_listeners(&self) -> usize {
        lock(&self.state)
            .signal_senders
            .iter()
            .filter(|tx| !tx.is_closed())
            .count()
    }

    /// Delivers `signal` to every open signal receiver, waiting for buffer space.
    pub async fn emit(&self, signal: Signal) {
        let senders: Vec<_> = {
            let mut state = lock(&self.state);
            state.signal_senders.retain(|tx| !tx.is_closed());
            state.signal_senders.clone()
        };

        for tx in senders {
            let _ = tx.send(signal.clone()).await;
        }
    }

    /// Ends every signal stream, as a closing connection would.
    pub fn disconnect(&self) {
        lock(&self.state).signal_senders.clear();
    }
}

#[async_trait]
impl BusConnection for MockBus {
    async fn call(
        &self,
        destination: &str,
        path: &ObjectPath,
        interface: &str,
        method: &str,
        args: Vec<BusValue>,
    ) -> Result<Vec<BusValue>, TransportError> {
        let mut state = lock(&self.state);
        state.calls.push(RecordedCall {
            destination: destination.to_string(),
            path: path.clone(),
            interface: interface.to_string(),
            method: method.to_string(),
            args,
        });

        state
            .replies
            .get(&format!("{interface}.{method}"))
            .cloned()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn get_property(
        &self,
        _destination: &str,
        path: &ObjectPath,
        interface: &str,
        property: &str,
    ) -> Result<BusValue, TransportError> {
        lock(&self.state)
            .properties
            .get(&(path.clone(), format!("{interface}.{property}")))
            .cloned()
            .ok_or_else(|| TransportError::property(format!("no such property {interface}.{property}")))
    }

    async fn add_match(&self, rule: &MatchRule) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        if state.fail_add_match {
            return Err(TransportError::matching("add match refused"));
        }
        *state.added.entry(rule.clone()).or_insert(0) += 1;
        Ok(())
    }

    async fn remove_match(&self, rule: &MatchRule) -> Result<(), TransportError> {
        let delay = lock(&self.state).remove_match_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = lock(&self.state);
        if state.fail_remove_match {
            return Err(TransportError::matching("remove match refused"));
        }
        *state.removed.entry(rule.clone()).or_insert(0) += 1;
        Ok(())
    }

    fn signals(&self) -> mpsc::Receiver<Signal> {
        let (tx, rx) = mpsc::channel(SIGNAL_BUFFER);
        lock(&self.state).signal_senders.push(tx);
        rx
    }
}

// ============================================================================
// Mock Idle Connection
// ============================================================================

/// Teardown steps recorded by [`MockIdleConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStep {
    ReleaseSeat,
    DestroyNotifier,
    Close,
}

#[derive(Default)]
struct MockIdleState {
    roundtrips: usize,
    bound: Vec<String>,
    requested_timeouts: Vec<u32>,
    destroyed: Vec<NotificationId>,
    teardown: Vec<TeardownStep>,
    failing_steps: Vec<TeardownStep>,
    fail_destroy: bool,
    next_id: u32,
}

/// Scriptable [`IdleConnection`].
pub struct MockIdleConnection {
    globals: Vec<Global>,
    state: Arc<Mutex<MockIdleState>>,
    events: mpsc::UnboundedReceiver<Result<IdleEvent, TransportError>>,
}

/// Test-side controls for a [`MockIdleConnection`].
#[derive(Clone)]
pub struct MockIdleRemote {
    state: Arc<Mutex<MockIdleState>>,
    events: mpsc::UnboundedSender<Result<IdleEvent, TransportError>>,
}

impl MockIdleConnection {
    /// A compositor advertising exactly `globals`.
    pub fn new(globals: Vec<Global>) -> (Self, MockIdleRemote) {
        let state = Arc::new(Mutex::new(MockIdleState {
            next_id: 1,
            ..MockIdleState::default()
        }));
        let (tx, rx) = mpsc::unbounded_channel();

        let conn = Self {
            globals,
            state: Arc::clone(&state),
            events: rx,
        };
        let remote = MockIdleRemote { state, events: tx };
        (conn, remote)
    }

    /// A compositor advertising an idle notifier and a seat.
    pub fn standard() -> (Self, MockIdleRemote) {
        Self::new(vec![
            Global::new(1, "wl_compositor", 6),
            Global::new(7, SEAT_INTERFACE, 9),
            Global::new(12, IDLE_NOTIFIER_INTERFACE, 1),
        ])
    }
}

impl MockIdleRemote {
    pub fn emit(&self, event: IdleEvent) {
        let _ = self.events.send(Ok(event));
    }

    /// Makes the next `next_event` fail, as a dropped socket would.
    pub fn disconnect(&self) {
        let _ = self
            .events
            .send(Err(TransportError::disconnected("compositor went away")));
    }

    pub fn fail_destroy(&self, fail: bool) {
        lock(&self.state).fail_destroy = fail;
    }

    pub fn fail_teardown_step(&self, step: TeardownStep) {
        lock(&self.state).failing_steps.push(step);
    }

    pub fn roundtrips(&self) -> usize {
        lock(&self.state).roundtrips
    }

    /// Interfaces bound so far.
    pub fn bound(&self) -> Vec<String> {
        lock(&self.state).bound.clone()
    }

    pub fn requested_timeouts(&self) -> Vec<u32> {
        lock(&self.state).requested_timeouts.clone()
    }

    pub fn destroyed(&self) -> Vec<NotificationId> {
        lock(&self.state).destroyed.clone()
    }

    pub fn teardown_steps(&self) -> Vec<TeardownStep> {
        lock(&self.state).teardown.clone()
    }
}

impl MockIdleConnection {
    fn teardown_step(&mut self, step: TeardownStep) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        state.teardown.push(step);
        if state.failing_steps.contains(&step) {
            return Err(TransportError::request(format!("{step:?} failed")));
        }
        Ok(())
    }
}

#[async_trait]
impl IdleConnection for MockIdleConnection {
    async fn roundtrip(&mut self) -> Result<Vec<Global>, TransportError> {
        lock(&self.state).roundtrips += 1;
        Ok(self.globals.clone())
    }

    fn bind(&mut self, global: &Global) -> Result<(), TransportError> {
        lock(&self.state).bound.push(global.interface.clone());
        Ok(())
    }

    fn get_idle_notification(&mut self, timeout_ms: u32) -> Result<NotificationId, TransportError> {
        let mut state = lock(&self.state);
        state.requested_timeouts.push(timeout_ms);
        let id = NotificationId(state.next_id);
        state.next_id += 1;
        Ok(id)
    }

    fn destroy_notification(&mut self, id: NotificationId) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        state.destroyed.push(id);
        if state.fail_destroy {
            return Err(TransportError::request(format!("destroy {id} failed")));
        }
        Ok(())
    }

    async fn next_event(&mut self) -> Result<IdleEvent, TransportError> {
        match self.events.recv().await {
            Some(event) => event,
            None => Err(TransportError::disconnected("event source dropped")),
        }
    }

    fn release_seat(&mut self) -> Result<(), TransportError> {
        self.teardown_step(TeardownStep::ReleaseSeat)
    }

    fn destroy_notifier(&mut self) -> Result<(), TransportError> {
        self.teardown_step(TeardownStep::DestroyNotifier)
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.teardown_step(TeardownStep::Close)
    }
}
