//! Idle notification requests and handles.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use seatwatch_core::{Error, NotificationId, Result};

use super::commands::IdleCommand;

// ============================================================================
// Creation Request
// ============================================================================

/// Parameters for [`IdleController::add_notification`](super::IdleController::add_notification).
///
/// At least one of `idle` and `resume` must be set.
#[derive(Debug, Clone, Default)]
pub struct CreateIdleNotification {
    /// Inactivity before `Idled` fires. Negative values mean "immediately".
    pub timeout_ms: i64,
    /// Receives `()` each time the seat goes idle.
    pub idle: Option<mpsc::Sender<()>>,
    /// Receives `()` each time activity resumes after going idle.
    pub resume: Option<mpsc::Sender<()>>,
}

impl CreateIdleNotification {
    pub fn new(timeout_ms: i64) -> Self {
        Self {
            timeout_ms,
            ..Self::default()
        }
    }

    /// Saturates at `i64::MAX` milliseconds, which the protocol then rejects.
    pub fn from_duration(timeout: Duration) -> Self {
        Self::new(i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX))
    }

    pub fn on_idle(mut self, tx: mpsc::Sender<()>) -> Self {
        self.idle = Some(tx);
        self
    }

    pub fn on_resume(mut self, tx: mpsc::Sender<()>) -> Self {
        self.resume = Some(tx);
        self
    }
}

/// Maps a signed millisecond timeout onto the protocol's `u32` range.
///
/// # Errors
///
/// - `Error::DurationTooLarge` above `u32::MAX` milliseconds
pub(crate) fn clamp_timeout(timeout_ms: i64) -> Result<u32> {
    if timeout_ms < 0 {
        return Ok(0);
    }
    u32::try_from(timeout_ms).map_err(|_| Error::DurationTooLarge {
        millis: timeout_ms,
        max: u32::MAX,
    })
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Lifecycle of one idle notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationPhase {
    /// Events are delivered.
    Active,
    /// Close was requested; the destroy has not run on the owner yet.
    Closing,
    /// Destroyed, or torn down with its controller.
    Closed,
}

impl fmt::Display for NotificationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

const ACTIVE: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// Phase shared between a handle and the owner task.
#[derive(Debug)]
pub(crate) struct PhaseCell(AtomicU8);

impl PhaseCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(ACTIVE))
    }

    pub fn get(&self) -> NotificationPhase {
        match self.0.load(Ordering::Acquire) {
            ACTIVE => NotificationPhase::Active,
            CLOSING => NotificationPhase::Closing,
            _ => NotificationPhase::Closed,
        }
    }

    /// Moves `Active` to `Closing`. Only the first caller gets `true`.
    pub fn begin_close(&self) -> bool {
        self.0
            .compare_exchange(ACTIVE, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn mark_closed(&self) {
        self.0.store(CLOSED, Ordering::Release);
    }
}

// ============================================================================
// Notification Handle
// ============================================================================

/// One registered idle/resume watch.
///
/// Closing never touches the connection directly; the destroy request is
/// queued to the owner task. Dropping the handle closes it.
pub struct IdleNotification {
    id: NotificationId,
    phase: Arc<PhaseCell>,
    /// Given up on the first close so a closed handle keeps nothing alive.
    owner: Mutex<Option<mpsc::Sender<IdleCommand>>>,
    shutdown: CancellationToken,
    runtime: Handle,
}

impl IdleNotification {
    pub(crate) fn new(
        id: NotificationId,
        phase: Arc<PhaseCell>,
        owner: mpsc::Sender<IdleCommand>,
        shutdown: CancellationToken,
        runtime: Handle,
    ) -> Self {
        Self {
            id,
            phase,
            owner: Mutex::new(Some(owner)),
            shutdown,
            runtime,
        }
    }

    pub fn id(&self) -> NotificationId {
        self.id
    }

    pub fn phase(&self) -> NotificationPhase {
        self.phase.get()
    }

    /// Requests destruction and returns immediately.
    ///
    /// Safe to call from any thread, from inside an event consumer, and
    /// more than once. The destroy runs later on the owner task, or not at
    /// all if the controller shuts down first (teardown covers it then).
    /// Use [`close_and_wait`](Self::close_and_wait) to observe completion.
    pub fn close(&self) {
        let Some(owner) = self.begin_close() else {
            return;
        };

        let id = self.id;
        let phase = Arc::clone(&self.phase);
        let shutdown = self.shutdown.clone();
        self.runtime.spawn(async move {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    trace!(notification = %id, "Owner already shut down, destroy skipped");
                    phase.mark_closed();
                }
                sent = owner.send(IdleCommand::Destroy { id, respond_to: None }) => {
                    if sent.is_err() {
                        phase.mark_closed();
                    }
                }
            }
        });
    }

    /// Like [`close`](Self::close), but waits for the owner to run the
    /// destroy and reports its outcome.
    ///
    /// Returns `Ok(())` without waiting if the handle was already closing
    /// or the controller has shut down.
    ///
    /// # Errors
    ///
    /// - `Error::Transport` if the destroy request failed
    pub async fn close_and_wait(&self) -> Result<()> {
        let Some(owner) = self.begin_close() else {
            return Ok(());
        };

        let (tx, rx) = oneshot::channel();
        let command = IdleCommand::Destroy {
            id: self.id,
            respond_to: Some(tx),
        };

        let sent = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => false,
            sent = owner.send(command) => sent.is_ok(),
        };
        if !sent {
            self.phase.mark_closed();
            return Ok(());
        }

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => {
                // Owner exited with the request queued; teardown closed us.
                self.phase.mark_closed();
                Ok(())
            }
        }
    }

    fn begin_close(&self) -> Option<mpsc::Sender<IdleCommand>> {
        if !self.phase.begin_close() {
            return None;
        }
        debug!(notification = %self.id, "Closing idle notification");
        self.owner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl fmt::Debug for IdleNotification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdleNotification")
            .field("id", &self.id)
            .field("phase", &self.phase())
            .finish()
    }
}

impl Drop for IdleNotification {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_negative_to_zero() {
        assert_eq!(clamp_timeout(-5000).unwrap(), 0);
        assert_eq!(clamp_timeout(i64::MIN).unwrap(), 0);
    }

    #[test]
    fn test_clamp_passes_range() {
        assert_eq!(clamp_timeout(0).unwrap(), 0);
        assert_eq!(clamp_timeout(5000).unwrap(), 5000);
        assert_eq!(clamp_timeout(i64::from(u32::MAX)).unwrap(), u32::MAX);
    }

    #[test]
    fn test_clamp_rejects_too_large() {
        let too_large = i64::from(u32::MAX) + 1;
        match clamp_timeout(too_large) {
            Err(Error::DurationTooLarge { millis, max }) => {
                assert_eq!(millis, too_large);
                assert_eq!(max, u32::MAX);
            }
            other => panic!("expected DurationTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn test_from_duration_saturates() {
        let request = CreateIdleNotification::from_duration(Duration::from_secs(5));
        assert_eq!(request.timeout_ms, 5000);

        let request = CreateIdleNotification::from_duration(Duration::MAX);
        assert_eq!(request.timeout_ms, i64::MAX);
        assert!(clamp_timeout(request.timeout_ms).is_err());
    }

    #[test]
    fn test_phase_cell_transitions_once() {
        let phase = PhaseCell::new();
        assert_eq!(phase.get(), NotificationPhase::Active);

        assert!(phase.begin_close());
        assert_eq!(phase.get(), NotificationPhase::Closing);
        assert!(!phase.begin_close());

        phase.mark_closed();
        assert_eq!(phase.get(), NotificationPhase::Closed);
        assert!(!phase.begin_close());
    }

    #[tokio::test]
    async fn test_close_queues_single_destroy() {
        let (tx, mut rx) = mpsc::channel(4);
        let notification = IdleNotification::new(
            NotificationId(3),
            Arc::new(PhaseCell::new()),
            tx,
            CancellationToken::new(),
            Handle::current(),
        );

        notification.close();
        notification.close();
        drop(notification);

        match rx.recv().await {
            Some(IdleCommand::Destroy { id, respond_to }) => {
                assert_eq!(id, NotificationId(3));
                assert!(respond_to.is_none());
            }
            other => panic!("expected Destroy, got {other:?}"),
        }
        // Every sender is gone once the spawned send completes.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_close_after_shutdown_marks_closed() {
        let (tx, mut rx) = mpsc::channel(4);
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let phase = Arc::new(PhaseCell::new());
        let notification = IdleNotification::new(
            NotificationId(1),
            Arc::clone(&phase),
            tx,
            shutdown,
            Handle::current(),
        );

        notification.close_and_wait().await.unwrap();
        assert_eq!(notification.phase(), NotificationPhase::Closed);
        assert!(rx.try_recv().is_err());
    }
}
