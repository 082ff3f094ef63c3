//! seatwatch zbus - `BusConnection` over a real D-Bus connection
//!
//! [`ZbusConnection`] wraps a `zbus::Connection`:
//! - method calls carry dynamically built bodies,
//! - properties are read through `org.freedesktop.DBus.Properties.Get`,
//! - matches are registered with the bus daemon's `AddMatch`/`RemoveMatch`,
//! - every `signals()` receiver is fed by its own forwarding task.

mod convert;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use zbus::message::Type as MessageType;
use zbus::{Connection, Message, MessageStream};

use seatwatch_core::bus::SIGNAL_BUFFER;
use seatwatch_core::{BusConnection, BusValue, MatchRule, ObjectPath, Signal, TransportError};

const DBUS_NAME: &str = "org.freedesktop.DBus";
const DBUS_PATH: &str = "/org/freedesktop/DBus";
const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

/// A D-Bus connection usable by every seatwatch facility.
///
/// Cheap to clone; clones share the underlying connection.
#[derive(Clone, Debug)]
pub struct ZbusConnection {
    conn: Connection,
}

impl ZbusConnection {
    /// Connects to the system bus (logind).
    ///
    /// # Errors
    ///
    /// Returns a `Connect` transport error if the bus is unreachable.
    pub async fn system() -> Result<Self, TransportError> {
        let conn = Connection::system().await.map_err(TransportError::connect)?;
        info!("Connected to D-Bus system bus");
        Ok(Self { conn })
    }

    /// Connects to the session bus (Secret Service).
    ///
    /// # Errors
    ///
    /// Returns a `Connect` transport error if the bus is unreachable.
    pub async fn session() -> Result<Self, TransportError> {
        let conn = Connection::session().await.map_err(TransportError::connect)?;
        info!("Connected to D-Bus session bus");
        Ok(Self { conn })
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self { conn }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    async fn raw_call(
        &self,
        destination: &str,
        path: &str,
        interface: &str,
        method: &str,
        args: &[BusValue],
    ) -> Result<Message, TransportError> {
        let path = zbus::zvariant::ObjectPath::try_from(path).map_err(TransportError::call)?;

        let reply = if args.is_empty() {
            self.conn
                .call_method(Some(destination), path, Some(interface), method, &())
                .await
        } else {
            let body = convert::to_structure(args)?;
            self.conn
                .call_method(Some(destination), path, Some(interface), method, &body)
                .await
        };

        reply.map_err(|e| TransportError::call(format!("{interface}.{method}: {e}")))
    }
}

#[async_trait]
impl BusConnection for ZbusConnection {
    async fn call(
        &self,
        destination: &str,
        path: &ObjectPath,
        interface: &str,
        method: &str,
        args: Vec<BusValue>,
    ) -> Result<Vec<BusValue>, TransportError> {
        let reply = self
            .raw_call(destination, path.as_str(), interface, method, &args)
            .await?;
        convert::from_body(&reply.body())
    }

    async fn get_property(
        &self,
        destination: &str,
        path: &ObjectPath,
        interface: &str,
        property: &str,
    ) -> Result<BusValue, TransportError> {
        let reply = self
            .raw_call(
                destination,
                path.as_str(),
                PROPERTIES_INTERFACE,
                "Get",
                &[BusValue::from(interface), BusValue::from(property)],
            )
            .await
            .map_err(|e| TransportError::property(e.message))?;

        convert::from_body(&reply.body())?
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::property(format!("{interface}.{property}: empty reply")))
    }

    async fn add_match(&self, rule: &MatchRule) -> Result<(), TransportError> {
        let rule = rule.to_string();
        self.raw_call(DBUS_NAME, DBUS_PATH, DBUS_NAME, "AddMatch", &[BusValue::from(rule.as_str())])
            .await
            .map_err(|e| TransportError::matching(e.message))?;
        debug!(rule = %rule, "Match added");
        Ok(())
    }

    async fn remove_match(&self, rule: &MatchRule) -> Result<(), TransportError> {
        let rule = rule.to_string();
        self.raw_call(DBUS_NAME, DBUS_PATH, DBUS_NAME, "RemoveMatch", &[BusValue::from(rule.as_str())])
            .await
            .map_err(|e| TransportError::matching(e.message))?;
        debug!(rule = %rule, "Match removed");
        Ok(())
    }

    fn signals(&self) -> mpsc::Receiver<Signal> {
        let (tx, rx) = mpsc::channel(SIGNAL_BUFFER);
        // Created here so nothing arriving before the task starts is missed.
        let mut stream = MessageStream::from(&self.conn);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    next = stream.next() => match next {
                        Some(Ok(msg)) => {
                            let Some(signal) = to_signal(&msg) else {
                                continue;
                            };
                            if tx.send(signal).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => warn!(error = %e, "Skipping unreadable message"),
                        None => {
                            debug!("Message stream ended");
                            break;
                        }
                    },
                }
            }
            trace!("Signal forwarder stopped");
        });

        rx
    }
}

/// Extracts a signal from an incoming message; other message types yield `None`.
fn to_signal(msg: &Message) -> Option<Signal> {
    let header = msg.header();
    if header.message_type() != MessageType::Signal {
        return None;
    }

    let path = header.path()?.as_str().to_string();
    let interface = header.interface()?.as_str().to_string();
    let member = header.member()?.as_str().to_string();

    let body = match convert::from_body(&msg.body()) {
        Ok(body) => body,
        Err(e) => {
            warn!(interface = %interface, member = %member, error = %e, "Dropping signal with unreadable body");
            return None;
        }
    };

    Some(Signal::new(ObjectPath::new(path), interface, member, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use zbus::zvariant::Value;

    #[test]
    fn test_properties_changed_body_converts() {
        let mut changed: HashMap<&str, Value<'_>> = HashMap::new();
        changed.insert("LockedHint", Value::from(true));
        changed.insert("IdleHint", Value::from(false));
        let invalidated: Vec<&str> = Vec::new();

        let msg = Message::signal(
            "/org/freedesktop/login1/session/_31",
            PROPERTIES_INTERFACE,
            "PropertiesChanged",
        )
        .unwrap()
        .build(&("org.freedesktop.login1.Session", changed, invalidated))
        .unwrap();

        let signal = to_signal(&msg).expect("signal messages convert");
        assert_eq!(signal.path.as_str(), "/org/freedesktop/login1/session/_31");
        assert_eq!(signal.member, "PropertiesChanged");
        assert_eq!(signal.body.len(), 3);
        assert_eq!(signal.body[0].as_str(), Some("org.freedesktop.login1.Session"));

        let dict = signal.body[1].as_dict().expect("a{sv} converts to a dict");
        assert_eq!(dict.get("LockedHint").and_then(BusValue::as_bool), Some(true));
        assert_eq!(dict.get("IdleHint").and_then(BusValue::as_bool), Some(false));
        assert_eq!(signal.body[2].as_slice().map(<[BusValue]>::len), Some(0));
    }

    #[test]
    fn test_method_calls_are_not_signals() {
        let msg = Message::method("/org/freedesktop/login1", "ListSessions")
            .unwrap()
            .build(&())
            .unwrap();
        assert!(to_signal(&msg).is_none());
    }
}
