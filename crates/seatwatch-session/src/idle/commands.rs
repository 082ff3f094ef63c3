//! Work items handed to the idle connection owner.
//!
//! Requests that need an answer carry a oneshot `respond_to`; a dropped
//! responder means the owner shut down before handling the request.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use seatwatch_core::{NotificationId, Result};

use super::notification::PhaseCell;

// ============================================================================
// Idle Commands
// ============================================================================

/// Commands executed on the owner task, in submission order.
#[derive(Debug)]
pub(crate) enum IdleCommand {
    /// Create a notification on the bound seat.
    AddNotification {
        /// Already clamped to the protocol's range
        timeout_ms: u32,
        idle: Option<mpsc::Sender<()>>,
        resume: Option<mpsc::Sender<()>>,
        /// Shared with the caller's `IdleNotification`
        phase: Arc<PhaseCell>,
        respond_to: oneshot::Sender<Result<NotificationId>>,
    },

    /// Destroy one notification.
    ///
    /// Fire-and-forget when `respond_to` is `None`. Destroying an id the
    /// owner no longer knows is a successful no-op.
    Destroy {
        id: NotificationId,
        respond_to: Option<oneshot::Sender<Result<()>>>,
    },
}
