//! Conversions between `BusValue` and `zvariant::Value`.

use std::collections::HashMap;
use std::os::fd::AsFd;

use zbus::zvariant::{
    self, Array, Dict, OwnedValue, Signature, Structure, StructureBuilder, Value,
};

use seatwatch_core::{BusValue, ObjectPath, TransportError, UnixFd};

// ============================================================================
// Outgoing
// ============================================================================

/// D-Bus signature of a value. Empty arrays are typed `av`.
pub(crate) fn signature_of(value: &BusValue) -> String {
    match value {
        BusValue::Bool(_) => "b".to_string(),
        BusValue::U32(_) => "u".to_string(),
        BusValue::I32(_) => "i".to_string(),
        BusValue::U64(_) => "t".to_string(),
        BusValue::I64(_) => "x".to_string(),
        BusValue::F64(_) => "d".to_string(),
        BusValue::Str(_) => "s".to_string(),
        BusValue::ObjectPath(_) => "o".to_string(),
        BusValue::Fd(_) => "h".to_string(),
        BusValue::Array(items) => match items.first() {
            Some(first) => format!("a{}", signature_of(first)),
            None => "av".to_string(),
        },
        BusValue::Struct(fields) => {
            let inner: String = fields.iter().map(signature_of).collect();
            format!("({inner})")
        }
        BusValue::Dict(_) => "a{sv}".to_string(),
        BusValue::Variant(_) => "v".to_string(),
    }
}

fn signature(sig: String) -> Result<Signature<'static>, TransportError> {
    Signature::try_from(sig).map_err(TransportError::call)
}

/// Converts an outgoing argument.
///
/// # Errors
///
/// File descriptors cannot be sent, and every array element must share
/// the first element's type.
pub(crate) fn to_value(value: &BusValue) -> Result<Value<'static>, TransportError> {
    let converted = match value {
        BusValue::Bool(b) => Value::from(*b),
        BusValue::U32(n) => Value::from(*n),
        BusValue::I32(n) => Value::from(*n),
        BusValue::U64(n) => Value::from(*n),
        BusValue::I64(n) => Value::from(*n),
        BusValue::F64(n) => Value::from(*n),
        BusValue::Str(s) => Value::from(s.clone()),
        BusValue::ObjectPath(p) => {
            let path = zvariant::ObjectPath::try_from(p.as_str().to_string())
                .map_err(TransportError::call)?;
            Value::ObjectPath(path)
        }
        BusValue::Fd(_) => {
            return Err(TransportError::call(
                "sending file descriptors is not supported",
            ))
        }
        BusValue::Array(items) => {
            let element = match items.first() {
                Some(first) => signature_of(first),
                None => "v".to_string(),
            };
            let mut array = Array::new(signature(element)?);
            for item in items {
                array.append(to_value(item)?).map_err(TransportError::call)?;
            }
            Value::Array(array)
        }
        BusValue::Struct(fields) => Value::Structure(to_structure(fields)?),
        BusValue::Dict(map) => {
            let mut dict = Dict::new(signature("s".to_string())?, signature("v".to_string())?);
            for (key, item) in map {
                dict.append(Value::from(key.clone()), Value::Value(Box::new(to_value(item)?)))
                    .map_err(TransportError::call)?;
            }
            Value::Dict(dict)
        }
        BusValue::Variant(inner) => Value::Value(Box::new(to_value(inner)?)),
    };
    Ok(converted)
}

/// Builds a message body from a non-empty argument list.
pub(crate) fn to_structure(args: &[BusValue]) -> Result<Structure<'static>, TransportError> {
    let mut builder = StructureBuilder::new();
    for arg in args {
        builder = builder.append_field(to_value(arg)?);
    }
    Ok(builder.build())
}

// ============================================================================
// Incoming
// ============================================================================

/// Converts a received value.
///
/// # Errors
///
/// Fails only when a received file descriptor cannot be duplicated.
pub(crate) fn from_value(value: &Value<'_>) -> Result<BusValue, TransportError> {
    let converted = match value {
        Value::Bool(b) => BusValue::Bool(*b),
        Value::U8(n) => BusValue::U32(u32::from(*n)),
        Value::U16(n) => BusValue::U32(u32::from(*n)),
        Value::I16(n) => BusValue::I32(i32::from(*n)),
        Value::U32(n) => BusValue::U32(*n),
        Value::I32(n) => BusValue::I32(*n),
        Value::U64(n) => BusValue::U64(*n),
        Value::I64(n) => BusValue::I64(*n),
        Value::F64(n) => BusValue::F64(*n),
        Value::Str(s) => BusValue::Str(s.to_string()),
        Value::Signature(s) => BusValue::Str(s.to_string()),
        Value::ObjectPath(p) => BusValue::ObjectPath(ObjectPath::new(p.as_str())),
        Value::Value(inner) => BusValue::Variant(Box::new(from_value(inner)?)),
        Value::Array(array) => BusValue::Array(
            array
                .iter()
                .map(from_value)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        Value::Structure(structure) => BusValue::Struct(
            structure
                .fields()
                .iter()
                .map(from_value)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        Value::Dict(dict) => {
            let owned = dict.try_clone().map_err(TransportError::call)?;
            let entries =
                HashMap::<String, OwnedValue>::try_from(owned).map_err(TransportError::call)?;
            let mut map = HashMap::with_capacity(entries.len());
            for (key, item) in entries {
                map.insert(key, from_value(&item)?);
            }
            BusValue::Dict(map)
        }
        Value::Fd(fd) => {
            let owned = fd
                .as_fd()
                .try_clone_to_owned()
                .map_err(TransportError::call)?;
            BusValue::Fd(UnixFd::new(owned))
        }
        #[allow(unreachable_patterns)]
        other => BusValue::Str(format!("{other:?}")),
    };
    Ok(converted)
}

/// Converts every field of a message body.
pub(crate) fn from_body(body: &zbus::message::Body) -> Result<Vec<BusValue>, TransportError> {
    let Ok(structure) = body.deserialize::<Structure<'_>>() else {
        // Empty bodies have no structure to read.
        return Ok(Vec::new());
    };
    structure.fields().iter().map(from_value).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_of_nested_values() {
        let value = BusValue::Array(vec![BusValue::Struct(vec![
            "1".into(),
            BusValue::U32(1000),
            ObjectPath::new("/a").into(),
        ])]);
        assert_eq!(signature_of(&value), "a(suo)");
        assert_eq!(signature_of(&BusValue::Array(Vec::new())), "av");
        assert_eq!(signature_of(&BusValue::Dict(HashMap::new())), "a{sv}");
    }

    #[test]
    fn test_object_path_array_converts() {
        let value = BusValue::Array(vec![
            ObjectPath::new("/org/freedesktop/secrets/collection/login").into(),
        ]);
        let converted = to_value(&value).unwrap();
        assert_eq!(converted.value_signature().as_str(), "ao");

        let back = from_value(&converted).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_invalid_object_path_is_rejected() {
        let value = BusValue::ObjectPath(ObjectPath::new("not a path"));
        assert!(to_value(&value).is_err());
    }

    #[test]
    fn test_fd_arguments_are_rejected() {
        let file = std::fs::File::open("/dev/null").unwrap();
        let value = BusValue::Fd(UnixFd::new(file.into()));
        assert!(to_value(&value).is_err());
    }

    #[test]
    fn test_variant_dict_converts_back() {
        let mut map = HashMap::new();
        map.insert("LockedHint".to_string(), BusValue::Bool(true));
        let converted = to_value(&BusValue::Dict(map)).unwrap();

        let back = from_value(&converted).unwrap();
        let dict = back.as_dict().unwrap();
        assert_eq!(dict.get("LockedHint").and_then(BusValue::as_bool), Some(true));
    }
}
