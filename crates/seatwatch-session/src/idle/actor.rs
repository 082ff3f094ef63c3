//! Idle connection owner - the only task that touches the connection.
//!
//! The owner loop races three things:
//! - the shutdown token,
//! - commands submitted by handles,
//! - the next protocol event (which also keeps the connection serviced).
//!
//! Commands run in-line between events, so requests and event dispatch
//! never overlap on the connection.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Responder send failures are ignored (the requester gave up waiting)

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use seatwatch_core::{
    Error, IdleConnection, IdleEvent, NotificationId, Result, TeardownError,
};

use super::commands::IdleCommand;
use super::notification::{NotificationPhase, PhaseCell};

/// Teardown outcome, written once by the owner and read by the controller.
pub(crate) type TeardownOutcome = Arc<OnceLock<std::result::Result<(), TeardownError>>>;

/// Delivery targets of one notification.
struct Registration {
    idle: Option<mpsc::Sender<()>>,
    resume: Option<mpsc::Sender<()>>,
    phase: Arc<PhaseCell>,
}

// ============================================================================
// Idle Owner
// ============================================================================

pub(crate) struct IdleOwner<C> {
    conn: C,
    receiver: mpsc::Receiver<IdleCommand>,
    registrations: HashMap<NotificationId, Registration>,
    shutdown: CancellationToken,
    outcome: TeardownOutcome,
}

impl<C: IdleConnection> IdleOwner<C> {
    pub fn new(
        conn: C,
        receiver: mpsc::Receiver<IdleCommand>,
        shutdown: CancellationToken,
        outcome: TeardownOutcome,
    ) -> Self {
        Self {
            conn,
            receiver,
            registrations: HashMap::new(),
            shutdown,
            outcome,
        }
    }

    /// Runs until shutdown, until every handle is gone, or until the
    /// connection fails; then tears the connection down.
    pub async fn run(mut self) {
        info!("Idle owner starting");

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    debug!("Idle owner shutdown requested");
                    break;
                }
                cmd = self.receiver.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        debug!("Every idle handle dropped");
                        break;
                    }
                },
                event = self.conn.next_event() => match event {
                    Ok(event) => self.route_event(event),
                    Err(e) => {
                        warn!(error = %e, "Idle connection failed");
                        break;
                    }
                },
            }
        }

        self.teardown();
        info!("Idle owner stopped");
    }

    fn handle_command(&mut self, cmd: IdleCommand) {
        match cmd {
            IdleCommand::AddNotification {
                timeout_ms,
                idle,
                resume,
                phase,
                respond_to,
            } => {
                let result = self.handle_add(timeout_ms, idle, resume, phase);
                let _ = respond_to.send(result);
            }
            IdleCommand::Destroy { id, respond_to } => {
                let result = self.handle_destroy(id);
                match respond_to {
                    Some(respond_to) => {
                        let _ = respond_to.send(result);
                    }
                    None => {
                        if let Err(e) = result {
                            warn!(notification = %id, error = %e, "Idle notification destroy failed");
                        }
                    }
                }
            }
        }
    }

    // ========================================================================
    // Command Handlers
    // ========================================================================

    fn handle_add(
        &mut self,
        timeout_ms: u32,
        idle: Option<mpsc::Sender<()>>,
        resume: Option<mpsc::Sender<()>>,
        phase: Arc<PhaseCell>,
    ) -> Result<NotificationId> {
        let id = self
            .conn
            .get_idle_notification(timeout_ms)
            .map_err(|e| Error::transport("failed to create idle notification", e))?;

        self.registrations
            .insert(id, Registration { idle, resume, phase });

        debug!(
            notification = %id,
            timeout_ms,
            total = self.registrations.len(),
            "Idle notification created"
        );
        Ok(id)
    }

    fn handle_destroy(&mut self, id: NotificationId) -> Result<()> {
        let Some(registration) = self.registrations.remove(&id) else {
            trace!(notification = %id, "Destroy for unknown notification ignored");
            return Ok(());
        };

        // Closed even when the request fails: the handle never fires again.
        registration.phase.mark_closed();

        self.conn
            .destroy_notification(id)
            .map_err(|e| Error::transport("failed to destroy idle notification", e))?;

        debug!(notification = %id, total = self.registrations.len(), "Idle notification destroyed");
        Ok(())
    }

    // ========================================================================
    // Event Routing
    // ========================================================================

    /// Forwards an event from a fresh task so a slow consumer never
    /// stalls the owner. The send gives up when shutdown starts.
    fn route_event(&self, event: IdleEvent) {
        let id = event.notification();
        let Some(registration) = self.registrations.get(&id) else {
            trace!(notification = %id, "Event for unknown notification");
            return;
        };
        if registration.phase.get() != NotificationPhase::Active {
            trace!(notification = %id, "Event for closing notification dropped");
            return;
        }

        let target = match event {
            IdleEvent::Idled(_) => registration.idle.clone(),
            IdleEvent::Resumed(_) => registration.resume.clone(),
        };
        let Some(tx) = target else {
            return;
        };

        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    trace!(?event, "Shutdown won over event delivery");
                }
                sent = tx.send(()) => {
                    if sent.is_err() {
                        trace!(?event, "Idle listener gone");
                    }
                }
            }
        });
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Releases the seat, destroys the notifier and closes the connection,
    /// attempting every step. Then marks every registration closed and
    /// fires the shutdown token.
    fn teardown(&mut self) {
        let mut teardown = TeardownError::new();
        teardown.record(
            self.conn
                .release_seat()
                .map_err(|e| Error::transport("failed to release seat", e)),
        );
        teardown.record(
            self.conn
                .destroy_notifier()
                .map_err(|e| Error::transport("failed to destroy idle notifier", e)),
        );
        teardown.record(
            self.conn
                .close()
                .map_err(|e| Error::transport("failed to close idle connection", e)),
        );

        for (_, registration) in self.registrations.drain() {
            registration.phase.mark_closed();
        }

        let outcome = teardown.into_result();
        if let Err(e) = &outcome {
            warn!(error = %e, "Idle teardown incomplete");
        }
        let _ = self.outcome.set(outcome);

        self.shutdown.cancel();
    }
}
