//! seatwatch core - transport contracts and signal subscriptions
//!
//! This crate provides what every seatwatch facility shares:
//! - `bus` - the message-bus contract and its value model
//! - `idle` - the idle-notification protocol contract
//! - `subscription` - reference-counted matches with non-blocking fan-out
//! - `pump` - the single background reader feeding a facility
//! - `mock` - in-memory transports for tests
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod bus;
pub mod config;
pub mod error;
pub mod idle;
pub mod inhibit;
pub mod mock;
pub mod pump;
pub mod subscription;

// Re-exports for convenience
pub use bus::{BusConnection, BusValue, MatchRule, ObjectPath, Signal, UnixFd};
pub use config::{Config, ConfigError};
pub use error::{Error, ProtocolViolation, Result, TeardownError, TransportError, TransportErrorKind};
pub use idle::{Global, IdleConnection, IdleEvent, NotificationId};
pub use inhibit::{join_what, Mode, What};
pub use pump::{SignalHandler, SignalPump};
pub use subscription::{Delivery, Subscription};
