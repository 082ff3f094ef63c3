//! Inhibitor categories and modes as logind spells them on the wire.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Separator logind expects between categories in the `what` argument.
pub const WHAT_SEPARATOR: &str = ":";

/// An operation an inhibitor lock can hold off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum What {
    HandleHibernateKey,
    HandleLidSwitch,
    HandlePowerKey,
    HandleSuspendKey,
    Idle,
    Shutdown,
    Sleep,
}

impl What {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HandleHibernateKey => "handle-hibernate-key",
            Self::HandleLidSwitch => "handle-lid-switch",
            Self::HandlePowerKey => "handle-power-key",
            Self::HandleSuspendKey => "handle-suspend-key",
            Self::Idle => "idle",
            Self::Shutdown => "shutdown",
            Self::Sleep => "sleep",
        }
    }
}

impl fmt::Display for What {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the lock blocks the operation or only delays it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// Mandatory until released.
    Block,
    /// Like `Block`, but ignored in some circumstances.
    BlockWeak,
    /// Delays the operation up to the configured maximum.
    Delay,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::BlockWeak => "block-weak",
            Self::Delay => "delay",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Joins categories into logind's single `what` string.
pub fn join_what(what: &[What]) -> String {
    what.iter()
        .map(What::as_str)
        .collect::<Vec<_>>()
        .join(WHAT_SEPARATOR)
}
