//! Lock state of one logind session.
//!
//! [`SessionLock`] lets any number of consumers:
//! - read and set the session's locked hint,
//! - be told when logind asks the session to lock (`Lock`) or unlock (`Unlock`),
//! - be told when the locked hint changes (`PropertiesChanged` carrying `LockedHint`).
//!
//! Listeners are `mpsc::Sender`s. Delivery never blocks: a listener whose
//! buffer is full misses that signal, so size the channel for the bursts
//! you care about.
//!
//! All methods take `&self`; wrap the facility in an `Arc` to share it.

mod router;

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::{mpsc, OnceCell};
use tracing::{debug, info, warn};

use seatwatch_core::{
    BusConnection, BusValue, Error, ObjectPath, ProtocolViolation, Result, SignalPump,
    Subscription, TeardownError,
};

use crate::login1;
use router::{LockRouter, LockSignals};

/// Lock state and lock signals of one logind session.
pub struct SessionLock {
    router: Arc<LockRouter>,
    pump: SignalPump,
    closed: OnceCell<std::result::Result<(), TeardownError>>,
}

impl SessionLock {
    /// Resolves `session_id` through `ListSessions` and starts the signal reader.
    ///
    /// `session_id` is usually the `XDG_SESSION_ID` environment variable.
    ///
    /// # Errors
    ///
    /// - `Error::EmptySessionId` if `session_id` is empty
    /// - `Error::Transport` if `ListSessions` fails
    /// - `Error::UnexpectedReply` if the session list has an unexpected shape
    /// - `Error::SessionNotFound` if no session has this id
    pub async fn new(bus: Arc<dyn BusConnection>, session_id: &str) -> Result<Self> {
        if session_id.is_empty() {
            return Err(Error::EmptySessionId);
        }

        let path = find_session(&*bus, session_id).await?;
        info!(session_id, path = %path, "Resolved logind session");

        let signals = bus.signals();
        let router = Arc::new(LockRouter::new(bus, path));
        let pump = SignalPump::spawn("session-lock", signals, Arc::clone(&router));

        Ok(Self {
            router,
            pump,
            closed: OnceCell::new(),
        })
    }

    /// Object path of the session.
    pub fn path(&self) -> &ObjectPath {
        &self.router.path
    }

    /// Current locked hint; `true` means locked.
    ///
    /// # Errors
    ///
    /// - `Error::Transport` if reading the property fails
    /// - `Error::UnexpectedReply` if the property is not a boolean
    pub async fn locked(&self) -> Result<bool> {
        let value = self
            .router
            .bus
            .get_property(
                login1::DESTINATION,
                &self.router.path,
                login1::SESSION_INTERFACE,
                login1::LOCKED_HINT,
            )
            .await
            .map_err(|e| Error::transport("could not get locked hint", e))?;

        value.as_bool().ok_or_else(|| {
            Error::unexpected_reply(
                login1::LOCKED_HINT,
                format!("expected a boolean, got {}", value.unwrap_variant().type_name()),
            )
        })
    }

    /// Sets the locked hint. Call this after actually locking or unlocking.
    ///
    /// # Errors
    ///
    /// - `Error::Transport` if the call fails
    pub async fn set_locked(&self, locked: bool) -> Result<()> {
        self.router
            .bus
            .call(
                login1::DESTINATION,
                &self.router.path,
                login1::SESSION_INTERFACE,
                login1::SET_LOCKED_HINT,
                vec![BusValue::Bool(locked)],
            )
            .await
            .map_err(|e| Error::transport("could not set locked hint", e))?;

        debug!(locked, "Locked hint set");
        Ok(())
    }

    /// Notifies `tx` whenever logind asks the session to lock.
    ///
    /// # Errors
    ///
    /// - `Error::SubscriberClosed` if the receiver is gone
    /// - `Error::Transport` if the match cannot be registered
    /// - `Error::Faulted` / `Error::ChannelClosed` if the signal reader has stopped
    pub async fn add_lock_signal(&self, tx: mpsc::Sender<()>) -> Result<()> {
        self.subscribe(|s| &mut s.lock, tx).await
    }

    /// Stops notifying `tx`. Safe for channels that were never added.
    ///
    /// # Errors
    ///
    /// - `Error::Transport` if the match cannot be removed
    pub async fn remove_lock_signal(&self, tx: &mpsc::Sender<()>) -> Result<()> {
        self.unsubscribe(|s| &mut s.lock, tx).await
    }

    /// Notifies `tx` whenever logind asks the session to unlock.
    ///
    /// # Errors
    ///
    /// Same as [`add_lock_signal`](Self::add_lock_signal).
    pub async fn add_unlock_signal(&self, tx: mpsc::Sender<()>) -> Result<()> {
        self.subscribe(|s| &mut s.unlock, tx).await
    }

    /// # Errors
    ///
    /// - `Error::Transport` if the match cannot be removed
    pub async fn remove_unlock_signal(&self, tx: &mpsc::Sender<()>) -> Result<()> {
        self.unsubscribe(|s| &mut s.unlock, tx).await
    }

    /// Sends the new locked hint to `tx` whenever it changes.
    ///
    /// # Errors
    ///
    /// Same as [`add_lock_signal`](Self::add_lock_signal).
    pub async fn add_locked_signal(&self, tx: mpsc::Sender<bool>) -> Result<()> {
        self.subscribe(|s| &mut s.locked, tx).await
    }

    /// # Errors
    ///
    /// - `Error::Transport` if the match cannot be removed
    pub async fn remove_locked_signal(&self, tx: &mpsc::Sender<bool>) -> Result<()> {
        self.unsubscribe(|s| &mut s.locked, tx).await
    }

    /// The protocol violation that stopped the signal reader, if any.
    pub fn fault(&self) -> Option<ProtocolViolation> {
        self.pump.fault()
    }

    /// Drops every listener, removes every match and stops the signal reader.
    ///
    /// Idempotent: later calls return the first call's outcome. Discard
    /// the facility afterwards; adding a listener fails from here on,
    /// removing one is a no-op. Dropping an unclosed lock removes its
    /// matches in the background.
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
                info!(path = %self.router.path, "Session lock closed");
                outcome
            })
            .await
            .clone()
            .map_err(Error::Teardown)
    }

    async fn subscribe<T: Clone + Send>(
        &self,
        select: impl FnOnce(&mut LockSignals) -> &mut Subscription<T>,
        tx: mpsc::Sender<T>,
    ) -> Result<()> {
        let mut signals = self.router.signals.lock().await;
        self.pump.ensure_running()?;
        select(&mut *signals).subscribe(&*self.router.bus, tx).await
    }

    async fn unsubscribe<T: Clone + Send>(
        &self,
        select: impl FnOnce(&mut LockSignals) -> &mut Subscription<T>,
        tx: &mpsc::Sender<T>,
    ) -> Result<()> {
        let mut signals = self.router.signals.lock().await;
        select(&mut *signals).unsubscribe(&*self.router.bus, tx).await
    }
}

impl Drop for SessionLock {
    /// Removes the matches of a lock that was never closed. The reader
    /// stops with the pump.
    fn drop(&mut self) {
        if self.closed.initialized() {
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            warn!(path = %self.router.path, "Session lock dropped outside a runtime, matches stay registered");
            return;
        };

        let router = Arc::clone(&self.router);
        runtime.spawn(async move {
            let mut signals = router.signals.lock().await;
            if let Err(e) = signals.clear_all(&*router.bus).await {
                warn!(path = %router.path, error = %e, "Dropped session lock left matches behind");
            }
        });
    }
}

/// Finds the object path of `session_id` in logind's `a(susso)` session list.
async fn find_session(bus: &dyn BusConnection, session_id: &str) -> Result<ObjectPath> {
    let manager = ObjectPath::new(login1::MANAGER_PATH);
    let reply = bus
        .call(
            login1::DESTINATION,
            &manager,
            login1::MANAGER_INTERFACE,
            login1::LIST_SESSIONS,
            Vec::new(),
        )
        .await
        .map_err(|e| Error::transport("failed to list sessions", e))?;

    let sessions = reply
        .first()
        .and_then(BusValue::as_slice)
        .ok_or_else(|| Error::unexpected_reply(login1::LIST_SESSIONS, "reply is not an array"))?;

    for (i, session) in sessions.iter().enumerate() {
        let fields = session.as_slice().ok_or_else(|| {
            Error::unexpected_reply(login1::LIST_SESSIONS, format!("session {i} is not a struct"))
        })?;

        let id = fields.first().and_then(BusValue::as_str).ok_or_else(|| {
            Error::unexpected_reply(login1::LIST_SESSIONS, format!("session {i}[0] is not a string"))
        })?;

        if id != session_id {
            continue;
        }

        let path = fields.get(4).and_then(BusValue::as_object_path).ok_or_else(|| {
            Error::unexpected_reply(
                login1::LIST_SESSIONS,
                format!("session {i}[4] is not an object path"),
            )
        })?;
        return Ok(path.clone());
    }

    Err(Error::SessionNotFound(session_id.to_string()))
}
