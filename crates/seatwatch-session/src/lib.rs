//! seatwatch session facilities
//!
//! Each facility shares one fragile connection between any number of
//! independent consumers:
//! - `lock` - logind session Lock/Unlock/LockedHint signals and the locked hint
//! - `inhibit` - PrepareForSleep/PrepareForShutdown signals and inhibitor locks
//! - `idle` - idle/resume notifications over a non-reentrant protocol connection
//! - `secrets` - locking Secret Service collections
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  signals  ┌─────────────┐  try_send  ┌──────────────┐
//! │ BusConnection│──────────▶│ SignalPump  │───────────▶│  listeners   │
//! └──────────────┘           │ (1 reader)  │            │ (mpsc::Sender)│
//!        ▲                   └─────────────┘            └──────────────┘
//!        │ add/remove match        │ Mutex<Subscriptions>
//!        └─────────────────────────┘
//!
//! ┌──────────────┐  IdleCommand  ┌─────────────┐  owns  ┌───────────────┐
//! │IdleController│──────────────▶│  IdleOwner  │───────▶│IdleConnection │
//! │  (handle)    │   (mpsc)      │ (1 task)    │        │(non-reentrant)│
//! └──────────────┘               └─────────────┘        └───────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod idle;
pub mod inhibit;
pub mod lock;
pub mod login1;
pub mod secrets;

pub use idle::{CreateIdleNotification, IdleController, IdleNotification, NotificationPhase};
pub use inhibit::{InhibitLock, Inhibitor};
pub use lock::SessionLock;
pub use secrets::{LockOutcome, SecretService};
pub use seatwatch_core::{Error, Mode, Result, What};
