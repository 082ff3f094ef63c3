//! Locking Secret Service collections (`org.freedesktop.secrets`).

use std::sync::Arc;

use tracing::{debug, info};

use seatwatch_core::{BusConnection, BusValue, Error, ObjectPath, Result};

pub const DESTINATION: &str = "org.freedesktop.secrets";
pub const SERVICE_PATH: &str = "/org/freedesktop/secrets";
pub const SERVICE_INTERFACE: &str = "org.freedesktop.Secret.Service";
pub const LOCK: &str = "Lock";

/// Prefix joined onto every relative collection or item path.
pub const PATH_PREFIX: &str = "/org/freedesktop/secrets/";

/// Reply of `Lock(ao) -> (ao locked, o prompt)`.
#[derive(Debug, Clone, PartialEq)]
pub struct LockOutcome {
    /// Objects locked immediately.
    pub locked: Vec<ObjectPath>,
    /// Prompt to complete the rest; `None` when the service returned `/`.
    pub prompt: Option<ObjectPath>,
}

/// Client for the Secret Service on the session bus.
pub struct SecretService {
    bus: Arc<dyn BusConnection>,
}

impl SecretService {
    pub fn new(bus: Arc<dyn BusConnection>) -> Self {
        Self { bus }
    }

    /// Locks collections or items given relative to `/org/freedesktop/secrets/`,
    /// e.g. `collection/login`.
    ///
    /// An empty list makes no call.
    ///
    /// # Errors
    ///
    /// - `Error::Transport` if the call fails
    /// - `Error::UnexpectedReply` if the reply is not `(ao, o)`
    pub async fn lock<S: AsRef<str>>(&self, paths: &[S]) -> Result<LockOutcome> {
        if paths.is_empty() {
            return Ok(LockOutcome {
                locked: Vec::new(),
                prompt: None,
            });
        }

        let objects: Vec<BusValue> = paths
            .iter()
            .map(|p| {
                let relative = p.as_ref().trim_start_matches('/');
                BusValue::ObjectPath(ObjectPath::new(format!("{PATH_PREFIX}{relative}")))
            })
            .collect();
        debug!(count = objects.len(), "Locking secret objects");

        let reply = self
            .bus
            .call(
                DESTINATION,
                &ObjectPath::new(SERVICE_PATH),
                SERVICE_INTERFACE,
                LOCK,
                vec![BusValue::Array(objects)],
            )
            .await
            .map_err(|e| Error::transport("failed to lock secrets", e))?;

        let outcome = parse_lock_reply(&reply)?;
        info!(
            locked = outcome.locked.len(),
            prompt = outcome.prompt.is_some(),
            "Secrets locked"
        );
        Ok(outcome)
    }
}

fn parse_lock_reply(reply: &[BusValue]) -> Result<LockOutcome> {
    let locked = reply
        .first()
        .and_then(BusValue::as_slice)
        .ok_or_else(|| Error::unexpected_reply(LOCK, "reply[0] is not an array"))?
        .iter()
        .map(|v| {
            v.as_object_path()
                .cloned()
                .ok_or_else(|| Error::unexpected_reply(LOCK, "locked entry is not an object path"))
        })
        .collect::<Result<Vec<_>>>()?;

    let prompt = reply
        .get(1)
        .and_then(BusValue::as_object_path)
        .ok_or_else(|| Error::unexpected_reply(LOCK, "reply[1] is not an object path"))?;
    let prompt = (prompt.as_str() != "/").then(|| prompt.clone());

    Ok(LockOutcome { locked, prompt })
}
