//! Well-known names of the logind service (`org.freedesktop.login1`).

pub const DESTINATION: &str = "org.freedesktop.login1";
pub const MANAGER_PATH: &str = "/org/freedesktop/login1";
pub const MANAGER_INTERFACE: &str = "org.freedesktop.login1.Manager";
pub const SESSION_INTERFACE: &str = "org.freedesktop.login1.Session";
pub const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

pub const LIST_SESSIONS: &str = "ListSessions";
pub const INHIBIT: &str = "Inhibit";
pub const SET_LOCKED_HINT: &str = "SetLockedHint";
pub const LOCKED_HINT: &str = "LockedHint";

pub const LOCK: &str = "Lock";
pub const UNLOCK: &str = "Unlock";
pub const PROPERTIES_CHANGED: &str = "PropertiesChanged";
pub const PREPARE_FOR_SLEEP: &str = "PrepareForSleep";
pub const PREPARE_FOR_SHUTDOWN: &str = "PrepareForShutdown";
