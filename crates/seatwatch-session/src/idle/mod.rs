//! Idle notifications over a connection that forbids concurrent use.
//!
//! The protocol connection is moved into one owner task. Everything else
//! talks to that task by message:
//!
//! ```text
//! IdleController ──AddNotification──▶ IdleOwner ──▶ IdleConnection
//! IdleNotification ───Destroy───────▶     │
//!        ▲                                │ Idled / Resumed
//!        └──── mpsc::Sender<()> ◀── spawned forwarder
//! ```
//!
//! Notification lifecycle: `Active -> Closing -> Closed`. Closing is
//! entered the moment a handle is closed; the destroy itself runs later
//! on the owner task.

mod actor;
mod commands;
mod handle;
mod notification;

pub use handle::IdleController;
pub use notification::{CreateIdleNotification, IdleNotification, NotificationPhase};
