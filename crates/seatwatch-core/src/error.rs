//! Error taxonomy shared by every facility, following the panic-free policy.
//!
//! - `TransportError`: the bus or idle-protocol connection refused or failed a request.
//! - `ProtocolViolation`: an incoming signal did not have its documented shape.
//! - `TeardownError`: one or more independent release steps failed during close.
//! - `Error`: everything a facility operation can return.
//!
//! All types are `Clone` so that the outcome of an idempotent close can be
//! cached and handed back unchanged on every later call.

use std::fmt;

use thiserror::Error;

// ============================================================================
// Transport Errors
// ============================================================================

/// What the transport was doing when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Opening the connection or the initial handshake failed.
    Connect,
    /// A remote method call failed or returned an error reply.
    Call,
    /// Reading a remote property failed.
    Property,
    /// Registering or removing a signal match failed.
    Match,
    /// The connection went away while waiting for events.
    Disconnected,
    /// A request on the idle-notification protocol failed.
    Request,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => write!(f, "connect"),
            Self::Call => write!(f, "call"),
            Self::Property => write!(f, "property"),
            Self::Match => write!(f, "match"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Request => write!(f, "request"),
        }
    }
}

/// Failure reported by a transport implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} error: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn connect(message: impl fmt::Display) -> Self {
        Self::new(TransportErrorKind::Connect, message.to_string())
    }

    pub fn call(message: impl fmt::Display) -> Self {
        Self::new(TransportErrorKind::Call, message.to_string())
    }

    pub fn property(message: impl fmt::Display) -> Self {
        Self::new(TransportErrorKind::Property, message.to_string())
    }

    pub fn matching(message: impl fmt::Display) -> Self {
        Self::new(TransportErrorKind::Match, message.to_string())
    }

    pub fn disconnected(message: impl fmt::Display) -> Self {
        Self::new(TransportErrorKind::Disconnected, message.to_string())
    }

    pub fn request(message: impl fmt::Display) -> Self {
        Self::new(TransportErrorKind::Request, message.to_string())
    }
}

// ============================================================================
// Protocol Violations
// ============================================================================

/// An incoming signal whose body does not match the shape the remote
/// service documents. Not recoverable locally.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("protocol violation in {signal}: {detail}")]
pub struct ProtocolViolation {
    /// Fully-qualified signal name, e.g. `org.freedesktop.login1.Manager.PrepareForSleep`.
    pub signal: String,
    pub detail: String,
}

impl ProtocolViolation {
    pub fn new(signal: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            signal: signal.into(),
            detail: detail.into(),
        }
    }
}

// ============================================================================
// Teardown Errors
// ============================================================================

/// Errors collected from independent release steps.
///
/// Every step is attempted; this holds each failure in the order the steps ran.
#[derive(Debug, Clone, Default)]
pub struct TeardownError {
    pub failures: Vec<Error>,
}

impl TeardownError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the outcome of one step, keeping only failures.
    pub fn record(&mut self, outcome: Result<()>) {
        if let Err(err) = outcome {
            self.failures.push(err);
        }
    }

    pub fn push(&mut self, err: Error) {
        self.failures.push(err);
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// `Ok(())` if nothing failed, otherwise `Err(self)`.
    pub fn into_result(self) -> std::result::Result<(), TeardownError> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for TeardownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.failures.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{failure}")?;
        }
        Ok(())
    }
}

impl std::error::Error for TeardownError {}

// ============================================================================
// Facility Errors
// ============================================================================

/// Errors returned by facility operations.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The subscriber's receiving half has already been dropped.
    #[error("subscriber channel is closed")]
    SubscriberClosed,

    #[error("session id is empty")]
    EmptySessionId,

    /// An idle notification needs somewhere to deliver at least one event.
    #[error("either an idle or a resume target is required")]
    MissingTarget,

    #[error("duration too large, {millis}ms > {max}ms")]
    DurationTooLarge { millis: i64, max: u32 },

    #[error("at least one inhibit category is required")]
    EmptyInhibitWhat,

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("idle notifier global not advertised by the compositor")]
    NotifierNotFound,

    #[error("seat global not advertised by the compositor")]
    SeatNotFound,

    #[error("unexpected reply to {method}: {detail}")]
    UnexpectedReply { method: String, detail: String },

    /// A transport request failed; `context` says which one.
    #[error("{context}: {source}")]
    Transport {
        context: String,
        #[source]
        source: TransportError,
    },

    /// The signal reader stopped after a protocol violation.
    #[error("signal reader stopped: {0}")]
    Faulted(ProtocolViolation),

    /// The owning task has shut down.
    #[error("owner channel closed")]
    ChannelClosed,

    #[error("teardown failed: {0}")]
    Teardown(TeardownError),
}

impl Error {
    /// Wraps a transport failure with a short description of the request.
    pub fn transport(context: impl Into<String>, source: TransportError) -> Self {
        Self::Transport {
            context: context.into(),
            source,
        }
    }

    pub fn unexpected_reply(method: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::UnexpectedReply {
            method: method.into(),
            detail: detail.into(),
        }
    }
}

impl From<TeardownError> for Error {
    fn from(err: TeardownError) -> Self {
        Self::Teardown(err)
    }
}

/// Result type for facility operations.
pub type Result<T> = std::result::Result<T, Error>;
