//! Idle-notification protocol contract (`ext-idle-notify-v1`).
//!
//! The protocol connection is not safe for concurrent use. An
//! [`IdleConnection`] is therefore moved into exactly one owner task and
//! every request goes through it; see `seatwatch_session::idle`.

use std::fmt;

use async_trait::async_trait;

use crate::error::TransportError;

/// Interface name of the idle notifier global.
pub const IDLE_NOTIFIER_INTERFACE: &str = "ext_idle_notifier_v1";

/// Interface name of the seat global.
pub const SEAT_INTERFACE: &str = "wl_seat";

/// A global object advertised by the compositor during a roundtrip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Global {
    /// Numeric name used to bind the global.
    pub name: u32,
    pub interface: String,
    pub version: u32,
}

impl Global {
    pub fn new(name: u32, interface: impl Into<String>, version: u32) -> Self {
        Self {
            name,
            interface: interface.into(),
            version,
        }
    }
}

/// Protocol object id of one idle notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NotificationId(pub u32);

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "idle-notification#{}", self.0)
    }
}

/// Event emitted by an idle notification object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleEvent {
    /// The seat has been inactive for the notification's duration.
    Idled(NotificationId),
    /// Activity resumed after an `Idled` event.
    Resumed(NotificationId),
}

impl IdleEvent {
    pub fn notification(&self) -> NotificationId {
        match self {
            Self::Idled(id) | Self::Resumed(id) => *id,
        }
    }
}

/// A non-reentrant connection to a compositor speaking the idle protocol.
///
/// All methods take `&mut self`; the connection must be driven from a
/// single task.
#[async_trait]
pub trait IdleConnection: Send + 'static {
    /// Flushes pending requests and waits for the compositor to process
    /// them, returning every global advertised so far.
    async fn roundtrip(&mut self) -> Result<Vec<Global>, TransportError>;

    /// Binds an advertised global (the notifier or the seat).
    fn bind(&mut self, global: &Global) -> Result<(), TransportError>;

    /// Creates a notification on the bound seat firing after `timeout_ms`
    /// of inactivity.
    fn get_idle_notification(&mut self, timeout_ms: u32) -> Result<NotificationId, TransportError>;

    fn destroy_notification(&mut self, id: NotificationId) -> Result<(), TransportError>;

    /// Reads and dispatches until the next notification event.
    ///
    /// Must be cancel-safe: the owner races it against other work and
    /// drops the future when something else wins.
    async fn next_event(&mut self) -> Result<IdleEvent, TransportError>;

    fn release_seat(&mut self) -> Result<(), TransportError>;

    fn destroy_notifier(&mut self) -> Result<(), TransportError>;

    /// Closes the underlying socket.
    fn close(&mut self) -> Result<(), TransportError>;
}
