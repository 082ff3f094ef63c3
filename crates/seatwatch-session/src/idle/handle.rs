//! Client side of the idle connection owner.

use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, OnceCell};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use seatwatch_core::idle::{IDLE_NOTIFIER_INTERFACE, SEAT_INTERFACE};
use seatwatch_core::{Error, IdleConnection, Result, TeardownError};

use super::actor::{IdleOwner, TeardownOutcome};
use super::commands::IdleCommand;
use super::notification::{clamp_timeout, CreateIdleNotification, IdleNotification, PhaseCell};

const COMMAND_BUFFER: usize = 32;

// ============================================================================
// Idle Controller
// ============================================================================

/// Idle notifications for one seat.
///
/// Owns the background task that holds the protocol connection. Dropping
/// the controller shuts that task down; [`close`](Self::close) does the
/// same and reports teardown errors.
pub struct IdleController {
    sender: mpsc::Sender<IdleCommand>,
    shutdown: CancellationToken,
    outcome: TeardownOutcome,
    owner: Mutex<Option<JoinHandle<()>>>,
    closed: OnceCell<std::result::Result<(), TeardownError>>,
    runtime: Handle,
}

impl IdleController {
    /// Binds the idle notifier and the seat, then moves `conn` into the
    /// owner task.
    ///
    /// Must be called from within a tokio runtime; notification handles
    /// close through it.
    ///
    /// # Errors
    ///
    /// - `Error::Transport` if a roundtrip or bind fails
    /// - `Error::NotifierNotFound` if the compositor has no idle notifier
    /// - `Error::SeatNotFound` if the compositor advertises no seat
    pub async fn connect<C: IdleConnection>(mut conn: C) -> Result<Self> {
        if let Err(e) = handshake(&mut conn).await {
            if let Err(close_err) = conn.close() {
                warn!(error = %close_err, "Closing idle connection after failed handshake");
            }
            return Err(e);
        }

        let (sender, receiver) = mpsc::channel(COMMAND_BUFFER);
        let shutdown = CancellationToken::new();
        let outcome: TeardownOutcome = Arc::new(OnceLock::new());
        let runtime = Handle::current();

        let owner = IdleOwner::new(conn, receiver, shutdown.clone(), Arc::clone(&outcome));
        let task = runtime.spawn(owner.run());

        Ok(Self {
            sender,
            shutdown,
            outcome,
            owner: Mutex::new(Some(task)),
            closed: OnceCell::new(),
            runtime,
        })
    }

    /// Registers an idle/resume watch.
    ///
    /// The timeout is clamped: negative values become zero. Events are
    /// delivered best-effort from short-lived tasks; a consumer that is
    /// not receiving delays only its own events.
    ///
    /// # Errors
    ///
    /// - `Error::MissingTarget` if neither `idle` nor `resume` is set
    /// - `Error::DurationTooLarge` if the timeout exceeds `u32::MAX` ms
    /// - `Error::Transport` if the compositor request fails
    /// - `Error::ChannelClosed` if the controller has shut down
    pub async fn add_notification(&self, request: CreateIdleNotification) -> Result<IdleNotification> {
        if request.idle.is_none() && request.resume.is_none() {
            return Err(Error::MissingTarget);
        }
        let timeout_ms = clamp_timeout(request.timeout_ms)?;

        let phase = Arc::new(PhaseCell::new());
        let (tx, rx) = oneshot::channel();
        self.submit(IdleCommand::AddNotification {
            timeout_ms,
            idle: request.idle,
            resume: request.resume,
            phase: Arc::clone(&phase),
            respond_to: tx,
        })
        .await?;

        let id = rx.await.map_err(|_| Error::ChannelClosed)??;

        Ok(IdleNotification::new(
            id,
            phase,
            self.sender.clone(),
            self.shutdown.clone(),
            self.runtime.clone(),
        ))
    }

    /// Whether the owner task has shut down, for any reason.
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Shuts the owner task down and waits for its teardown.
    ///
    /// Every notification handed out is closed with it. Idempotent: later
    /// calls return the first call's outcome, as does a call made after
    /// the connection failed on its own.
    ///
    /// # Errors
    ///
    /// - `Error::Teardown` listing each teardown step that failed
    pub async fn close(&self) -> Result<()> {
        self.closed
            .get_or_init(|| async {
                self.shutdown.cancel();

                let task = self
                    .owner
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                if let Some(task) = task {
                    if let Err(e) = task.await {
                        warn!(error = %e, "Idle owner task ended abnormally");
                    }
                }

                info!("Idle controller closed");
                self.outcome.get().cloned().unwrap_or_else(|| {
                    let mut teardown = TeardownError::new();
                    teardown.push(Error::ChannelClosed);
                    teardown.into_result()
                })
            })
            .await
            .clone()
            .map_err(Error::Teardown)
    }

    /// Sends a command unless shutdown wins the race.
    async fn submit(&self, cmd: IdleCommand) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(Error::ChannelClosed),
            sent = self.sender.send(cmd) => sent.map_err(|_| Error::ChannelClosed),
        }
    }
}

impl Drop for IdleController {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Two roundtrips: the first lists globals, the second completes the binds.
async fn handshake<C: IdleConnection>(conn: &mut C) -> Result<()> {
    let globals = conn
        .roundtrip()
        .await
        .map_err(|e| Error::transport("initial roundtrip failed", e))?;

    let notifier = globals
        .iter()
        .find(|g| g.interface == IDLE_NOTIFIER_INTERFACE)
        .ok_or(Error::NotifierNotFound)?;
    let seat = globals
        .iter()
        .find(|g| g.interface == SEAT_INTERFACE)
        .ok_or(Error::SeatNotFound)?;

    conn.bind(notifier)
        .map_err(|e| Error::transport("failed to bind idle notifier", e))?;
    conn.bind(seat)
        .map_err(|e| Error::transport("failed to bind seat", e))?;

    conn.roundtrip()
        .await
        .map_err(|e| Error::transport("second roundtrip failed", e))?;

    info!(
        notifier_version = notifier.version,
        seat = seat.name,
        "Idle notifier bound"
    );
    Ok(())
}
