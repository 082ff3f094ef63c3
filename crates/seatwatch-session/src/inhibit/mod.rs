//! Sleep and shutdown inhibition through the logind manager.
//!
//! [`Inhibitor::inhibit`] takes an inhibitor lock; the returned
//! [`InhibitLock`] holds it until released or dropped. Consumers that
//! want to act right before the system suspends or powers off add a
//! channel with [`Inhibitor::add_prepare_for_sleep`] or
//! [`Inhibitor::add_prepare_for_shutdown`]: `true` is sent when the
//! transition starts and `false` when it was cancelled or has finished.
//!
//! A typical delay-mode flow:
//! 1. take a `Mode::Delay` lock,
//! 2. wait for `true` on the prepare-for-sleep channel,
//! 3. do the pre-sleep work, then release the lock,
//! 4. on `false`, take a fresh lock for the next cycle.

mod lock;
mod router;

pub use lock::InhibitLock;

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::{mpsc, OnceCell};
use tracing::{debug, info, warn};

use seatwatch_core::{
    join_what, BusConnection, BusValue, Error, Mode, ObjectPath, ProtocolViolation, Result,
    SignalPump, Subscription, TeardownError, What,
};

use crate::login1;
use router::{InhibitRouter, InhibitSignals};

/// Inhibitor locks and sleep/shutdown notifications.
pub struct Inhibitor {
    router: Arc<InhibitRouter>,
    pump: SignalPump,
    closed: OnceCell<std::result::Result<(), TeardownError>>,
}

impl Inhibitor {
    /// Starts the signal reader for the logind manager object.
    pub fn new(bus: Arc<dyn BusConnection>) -> Self {
        let signals = bus.signals();
        let router = Arc::new(InhibitRouter::new(bus, ObjectPath::new(login1::MANAGER_PATH)));
        let pump = SignalPump::spawn("inhibitor", signals, Arc::clone(&router));

        Self {
            router,
            pump,
            closed: OnceCell::new(),
        }
    }

    /// Takes an inhibitor lock for every category in `what`.
    ///
    /// `who` names the application and `why` is shown to users; both are
    /// free text.
    ///
    /// # Errors
    ///
    /// - `Error::EmptyInhibitWhat` if `what` is empty
    /// - `Error::Transport` if the call fails
    /// - `Error::UnexpectedReply` if the reply carries no file descriptor
    pub async fn inhibit(
        &self,
        who: &str,
        why: &str,
        mode: Mode,
        what: &[What],
    ) -> Result<InhibitLock> {
        if what.is_empty() {
            return Err(Error::EmptyInhibitWhat);
        }

        let what = join_what(what);
        let reply = self
            .router
            .bus
            .call(
                login1::DESTINATION,
                &self.router.path,
                login1::MANAGER_INTERFACE,
                login1::INHIBIT,
                vec![
                    BusValue::from(what.as_str()),
                    BusValue::from(who),
                    BusValue::from(why),
                    BusValue::from(mode.as_str()),
                ],
            )
            .await
            .map_err(|e| Error::transport("failed to inhibit", e))?;

        let fd = match reply.into_iter().next() {
            Some(BusValue::Fd(fd)) => fd,
            Some(other) => {
                return Err(Error::unexpected_reply(
                    login1::INHIBIT,
                    format!("expected a file descriptor, got {}", other.type_name()),
                ))
            }
            None => return Err(Error::unexpected_reply(login1::INHIBIT, "reply is empty")),
        };
        let fd = fd.into_owned().map_err(|e| {
            Error::unexpected_reply(login1::INHIBIT, format!("could not take descriptor: {e}"))
        })?;

        info!(what = %what, who, mode = %mode, "Inhibitor lock taken");
        Ok(InhibitLock::new(fd))
    }

    /// Sends `true` to `tx` when the system starts preparing for sleep and
    /// `false` once it has resumed or the sleep was cancelled.
    ///
    /// # Errors
    ///
    /// - `Error::SubscriberClosed` if the receiver is gone
    /// - `Error::Transport` if the match cannot be registered
    /// - `Error::Faulted` / `Error::ChannelClosed` if the signal reader has stopped
    pub async fn add_prepare_for_sleep(&self, tx: mpsc::Sender<bool>) -> Result<()> {
        self.subscribe(|s| &mut s.prepare_for_sleep, tx).await
    }

    /// Stops notifying `tx`. Safe for channels that were never added.
    ///
    /// # Errors
    ///
    /// - `Error::Transport` if the match cannot be removed
    pub async fn remove_prepare_for_sleep(&self, tx: &mpsc::Sender<bool>) -> Result<()> {
        self.unsubscribe(|s| &mut s.prepare_for_sleep, tx).await
    }

    /// Like [`add_prepare_for_sleep`](Self::add_prepare_for_sleep), for
    /// power-off and reboot.
    ///
    /// # Errors
    ///
    /// Same as [`add_prepare_for_sleep`](Self::add_prepare_for_sleep).
    pub async fn add_prepare_for_shutdown(&self, tx: mpsc::Sender<bool>) -> Result<()> {
        self.subscribe(|s| &mut s.prepare_for_shutdown, tx).await
    }

    /// # Errors
    ///
    /// - `Error::Transport` if the match cannot be removed
    pub async fn remove_prepare_for_shutdown(&self, tx: &mpsc::Sender<bool>) -> Result<()> {
        self.unsubscribe(|s| &mut s.prepare_for_shutdown, tx).await
    }

    /// The protocol violation that stopped the signal reader, if any.
    pub fn fault(&self) -> Option<ProtocolViolation> {
        self.pump.fault()
    }

    /// Drops every listener, removes both matches and stops the signal
    /// reader. Locks already handed out stay held.
    ///
    /// Idempotent: later calls return the first call's outcome.
    ///
    /// # Errors
    ///
    /// - `Error::Teardown` listing each match that could not be removed
    pub async fn close(&self) -> Result<()> {
        self.closed
            .get_or_init(|| async {
                let outcome = {
                    let mut signals = self.router.signals.lock().await;
                    let outcome = signals.clear_all(&*self.router.bus).await;
                    // Still under the lock: a waiting subscribe must find the reader stopped.
                    self.pump.stop();
                    outcome
                };
                debug!("Inhibitor closed");
                outcome
            })
            .await
            .clone()
            .map_err(Error::Teardown)
    }

    async fn subscribe(
        &self,
        select: impl FnOnce(&mut InhibitSignals) -> &mut Subscription<bool>,
        tx: mpsc::Sender<bool>,
    ) -> Result<()> {
        let mut signals = self.router.signals.lock().await;
        self.pump.ensure_running()?;
        select(&mut *signals).subscribe(&*self.router.bus, tx).await
    }

    async fn unsubscribe(
        &self,
        select: impl FnOnce(&mut InhibitSignals) -> &mut Subscription<bool>,
        tx: &mpsc::Sender<bool>,
    ) -> Result<()> {
        let mut signals = self.router.signals.lock().await;
        select(&mut *signals).unsubscribe(&*self.router.bus, tx).await
    }
}

impl Drop for Inhibitor {
    /// Removes the matches of an inhibitor that was never closed. Locks
    /// already handed out are unaffected.
    fn drop(&mut self) {
        if self.closed.initialized() {
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            warn!("Inhibitor dropped outside a runtime, matches stay registered");
            return;
        };

        let router = Arc::clone(&self.router);
        runtime.spawn(async move {
            let mut signals = router.signals.lock().await;
            if let Err(e) = signals.clear_all(&*router.bus).await {
                warn!(error = %e, "Dropped inhibitor left matches behind");
            }
        });
    }
}
