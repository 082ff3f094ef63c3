//! Signal state of one session lock and its dispatch.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::trace;

use seatwatch_core::{
    BusConnection, BusValue, MatchRule, ObjectPath, ProtocolViolation, Signal, SignalHandler,
    Subscription, TeardownError,
};

use crate::login1;

/// Every subscription of one session, guarded together.
pub(super) struct LockSignals {
    pub lock: Subscription<()>,
    pub unlock: Subscription<()>,
    pub locked: Subscription<bool>,
}

impl LockSignals {
    fn new(path: &ObjectPath) -> Self {
        let rule = |interface: &str, member: &str| {
            MatchRule::new(login1::DESTINATION, path.clone(), interface, member)
        };

        Self {
            lock: Subscription::new(rule(login1::SESSION_INTERFACE, login1::LOCK)),
            unlock: Subscription::new(rule(login1::SESSION_INTERFACE, login1::UNLOCK)),
            locked: Subscription::new(rule(
                login1::PROPERTIES_INTERFACE,
                login1::PROPERTIES_CHANGED,
            )),
        }
    }

    /// Drops every listener and removes every match, attempting each one.
    pub async fn clear_all(&mut self, bus: &dyn BusConnection) -> Result<(), TeardownError> {
        let mut teardown = TeardownError::new();
        teardown.record(self.lock.clear(bus).await);
        teardown.record(self.unlock.clear(bus).await);
        teardown.record(self.locked.clear(bus).await);
        teardown.into_result()
    }
}

/// Shared between the facility and its signal reader.
pub(super) struct LockRouter {
    pub bus: Arc<dyn BusConnection>,
    pub path: ObjectPath,
    pub signals: Mutex<LockSignals>,
}

impl LockRouter {
    pub fn new(bus: Arc<dyn BusConnection>, path: ObjectPath) -> Self {
        let signals = Mutex::new(LockSignals::new(&path));
        Self { bus, path, signals }
    }
}

/// Extracts `LockedHint` from a `PropertiesChanged(s, a{sv}, as)` body.
///
/// `Ok(None)` means the change did not touch the hint.
fn locked_hint(signal: &Signal) -> Result<Option<bool>, ProtocolViolation> {
    let changed = signal
        .body
        .get(1)
        .and_then(BusValue::as_dict)
        .ok_or_else(|| ProtocolViolation::new(signal.name(), "body[1] is not a property map"))?;

    let Some(hint) = changed.get(login1::LOCKED_HINT) else {
        return Ok(None);
    };

    hint.as_bool().map(Some).ok_or_else(|| {
        ProtocolViolation::new(
            signal.name(),
            format!("LockedHint is a {}, not a boolean", hint.unwrap_variant().type_name()),
        )
    })
}

#[async_trait]
impl SignalHandler for LockRouter {
    async fn handle(&self, signal: Signal) -> Result<(), ProtocolViolation> {
        if signal.path != self.path {
            return Ok(());
        }

        let mut signals = self.signals.lock().await;
        let bus = &*self.bus;

        match (signal.interface.as_str(), signal.member.as_str()) {
            (login1::SESSION_INTERFACE, login1::LOCK) => {
                signals.lock.deliver(bus, ()).await;
            }
            (login1::SESSION_INTERFACE, login1::UNLOCK) => {
                signals.unlock.deliver(bus, ()).await;
            }
            (login1::PROPERTIES_INTERFACE, login1::PROPERTIES_CHANGED) => {
                if let Some(locked) = locked_hint(&signal)? {
                    signals.locked.deliver(bus, locked).await;
                }
            }
            _ => trace!(signal = %signal.name(), "Ignoring unrelated signal"),
        }

        Ok(())
    }
}
