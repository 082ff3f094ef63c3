//! Manager-wide signal state and its dispatch.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use seatwatch_core::{
    BusConnection, BusValue, MatchRule, ObjectPath, ProtocolViolation, Signal, SignalHandler,
    Subscription, TeardownError,
};

use crate::login1;

pub(super) struct InhibitSignals {
    pub prepare_for_sleep: Subscription<bool>,
    pub prepare_for_shutdown: Subscription<bool>,
}

impl InhibitSignals {
    /// Drops every listener and removes both matches, attempting each one.
    pub async fn clear_all(&mut self, bus: &dyn BusConnection) -> Result<(), TeardownError> {
        let mut teardown = TeardownError::new();
        teardown.record(self.prepare_for_sleep.clear(bus).await);
        teardown.record(self.prepare_for_shutdown.clear(bus).await);
        teardown.into_result()
    }
}

pub(super) struct InhibitRouter {
    pub bus: Arc<dyn BusConnection>,
    pub path: ObjectPath,
    pub signals: Mutex<InhibitSignals>,
}

impl InhibitRouter {
    pub fn new(bus: Arc<dyn BusConnection>, path: ObjectPath) -> Self {
        let rule = |member: &str| {
            MatchRule::new(
                login1::DESTINATION,
                path.clone(),
                login1::MANAGER_INTERFACE,
                member,
            )
        };
        let signals = Mutex::new(InhibitSignals {
            prepare_for_sleep: Subscription::new(rule(login1::PREPARE_FOR_SLEEP)),
            prepare_for_shutdown: Subscription::new(rule(login1::PREPARE_FOR_SHUTDOWN)),
        });

        Self { bus, path, signals }
    }
}

/// `PrepareForSleep(b)` and `PrepareForShutdown(b)` carry exactly one boolean.
fn start_flag(signal: &Signal) -> Result<bool, ProtocolViolation> {
    match signal.body.first() {
        Some(BusValue::Bool(start)) => Ok(*start),
        Some(other) => Err(ProtocolViolation::new(
            signal.name(),
            format!("body[0] is a {}, not a boolean", other.type_name()),
        )),
        None => Err(ProtocolViolation::new(signal.name(), "body is empty")),
    }
}

#[async_trait]
impl SignalHandler for InhibitRouter {
    async fn handle(&self, signal: Signal) -> Result<(), ProtocolViolation> {
        if signal.path != self.path || signal.interface != login1::MANAGER_INTERFACE {
            return Ok(());
        }

        let mut signals = self.signals.lock().await;
        let bus = &*self.bus;

        match signal.member.as_str() {
            login1::PREPARE_FOR_SLEEP => {
                let start = start_flag(&signal)?;
                signals.prepare_for_sleep.deliver(bus, start).await;
            }
            login1::PREPARE_FOR_SHUTDOWN => {
                let start = start_flag(&signal)?;
                signals.prepare_for_shutdown.deliver(bus, start).await;
            }
            _ => {}
        }

        Ok(())
    }
}
