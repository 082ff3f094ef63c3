//! Message-bus transport contract.
//!
//! Facilities only need a handful of operations from the bus: call a
//! method, read a property, add and remove signal matches, and receive the
//! stream of incoming signals. [`BusConnection`] captures exactly that so
//! the facilities can run against `zbus` in production and against
//! [`crate::mock::MockBus`] in tests.

use std::collections::HashMap;
use std::fmt;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;

/// Capacity of the channel between a transport and its signal reader.
pub const SIGNAL_BUFFER: usize = 64;

// ============================================================================
// Object Paths
// ============================================================================

/// A bus object path such as `/org/freedesktop/login1/session/_32`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectPath(String);

impl ObjectPath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectPath {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

// ============================================================================
// Values
// ============================================================================

/// A file descriptor carried in a message body.
///
/// Shared so message bodies stay cheap to clone; whoever needs to own the
/// descriptor takes it with [`UnixFd::into_owned`].
#[derive(Debug, Clone)]
pub struct UnixFd(Arc<OwnedFd>);

impl UnixFd {
    pub fn new(fd: OwnedFd) -> Self {
        Self(Arc::new(fd))
    }

    /// Takes the descriptor, duplicating it if other clones still exist.
    pub fn into_owned(self) -> std::io::Result<OwnedFd> {
        match Arc::try_unwrap(self.0) {
            Ok(fd) => Ok(fd),
            Err(shared) => shared.try_clone(),
        }
    }
}

impl PartialEq for UnixFd {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_raw_fd() == other.0.as_raw_fd()
    }
}

/// A typed value in a message body.
#[derive(Debug, Clone, PartialEq)]
pub enum BusValue {
    Bool(bool),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    F64(f64),
    Str(String),
    ObjectPath(ObjectPath),
    Fd(UnixFd),
    Array(Vec<BusValue>),
    Struct(Vec<BusValue>),
    Dict(HashMap<String, BusValue>),
    Variant(Box<BusValue>),
}

impl BusValue {
    /// Looks through any number of variant wrappers.
    pub fn unwrap_variant(&self) -> &BusValue {
        match self {
            Self::Variant(inner) => inner.unwrap_variant(),
            other => other,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.unwrap_variant() {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self.unwrap_variant() {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object_path(&self) -> Option<&ObjectPath> {
        match self.unwrap_variant() {
            Self::ObjectPath(p) => Some(p),
            _ => None,
        }
    }

    /// Elements of an array or fields of a struct.
    pub fn as_slice(&self) -> Option<&[BusValue]> {
        match self.unwrap_variant() {
            Self::Array(items) | Self::Struct(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&HashMap<String, BusValue>> {
        match self.unwrap_variant() {
            Self::Dict(map) => Some(map),
            _ => None,
        }
    }

    /// Short type name used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::U32(_) => "u32",
            Self::I32(_) => "i32",
            Self::U64(_) => "u64",
            Self::I64(_) => "i64",
            Self::F64(_) => "f64",
            Self::Str(_) => "string",
            Self::ObjectPath(_) => "object path",
            Self::Fd(_) => "fd",
            Self::Array(_) => "array",
            Self::Struct(_) => "struct",
            Self::Dict(_) => "dict",
            Self::Variant(_) => "variant",
        }
    }
}

impl From<bool> for BusValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<&str> for BusValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for BusValue {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<ObjectPath> for BusValue {
    fn from(p: ObjectPath) -> Self {
        Self::ObjectPath(p)
    }
}

// ============================================================================
// Signals and Matches
// ============================================================================

/// An incoming signal.
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    /// Object the signal was emitted from.
    pub path: ObjectPath,
    pub interface: String,
    pub member: String,
    pub body: Vec<BusValue>,
}

impl Signal {
    pub fn new(
        path: impl Into<ObjectPath>,
        interface: impl Into<String>,
        member: impl Into<String>,
        body: Vec<BusValue>,
    ) -> Self {
        Self {
            path: path.into(),
            interface: interface.into(),
            member: member.into(),
            body,
        }
    }

    /// Fully-qualified member name, `interface.member`.
    pub fn name(&self) -> String {
        format!("{}.{}", self.interface, self.member)
    }
}

/// Selects one class of signals for delivery to this connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MatchRule {
    pub sender: String,
    pub path: ObjectPath,
    pub interface: String,
    pub member: String,
}

impl MatchRule {
    pub fn new(
        sender: impl Into<String>,
        path: ObjectPath,
        interface: impl Into<String>,
        member: impl Into<String>,
    ) -> Self {
        Self {
            sender: sender.into(),
            path,
            interface: interface.into(),
            member: member.into(),
        }
    }
}

impl fmt::Display for MatchRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "type='signal',sender='{}',path='{}',interface='{}',member='{}'",
            self.sender, self.path, self.interface, self.member
        )
    }
}

// ============================================================================
// Connection Contract
// ============================================================================

/// A connection to a message bus.
///
/// Calls may be issued concurrently with each other and with the signal
/// reader; implementations must be safe for that.
#[async_trait]
pub trait BusConnection: Send + Sync + 'static {
    /// Calls `interface.method` on `destination` at `path` and returns the reply body.
    async fn call(
        &self,
        destination: &str,
        path: &ObjectPath,
        interface: &str,
        method: &str,
        args: Vec<BusValue>,
    ) -> Result<Vec<BusValue>, TransportError>;

    /// Reads `interface.property` through `org.freedesktop.DBus.Properties.Get`.
    async fn get_property(
        &self,
        destination: &str,
        path: &ObjectPath,
        interface: &str,
        property: &str,
    ) -> Result<BusValue, TransportError>;

    async fn add_match(&self, rule: &MatchRule) -> Result<(), TransportError>;

    async fn remove_match(&self, rule: &MatchRule) -> Result<(), TransportError>;

    /// Opens a new receiver for every signal delivered to this connection.
    ///
    /// The stream ends when the connection closes. Dropping the receiver
    /// stops delivery to it.
    fn signals(&self) -> mpsc::Receiver<Signal>;
}
