use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ComputeError;

/// Identifies one compute method call: service, method and ordered arguments.
///
/// The arguments are kept in a canonical JSON encoding, which makes keys cheap to hash,
/// compare and clone. On the wire a key is `{"service": .., "method": .., "args": [..]}`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "WireKey", try_from = "WireKey")]
pub struct ComputedKey {
    service: Arc<str>,
    method: Arc<str>,
    args: Arc<str>,
}

impl ComputedKey {
    /// Creates a key for a call with the given arguments.
    ///
    /// Arguments that serialize to a JSON array are used as the argument list. `()` and `None`
    /// produce an empty list, any other value becomes the single argument.
    pub fn new<A>(service: &str, method: &str, args: &A) -> Result<Self, ComputeError>
    where
        A: Serialize + ?Sized,
    {
        let args = match serde_json::to_value(args)? {
            Value::Array(list) => list,
            Value::Null => Vec::new(),
            other => vec![other],
        };
        Ok(Self::from_parts(service, method, args))
    }

    /// Creates a key for a call without arguments.
    pub fn unit(service: &str, method: &str) -> Self {
        Self::from_parts(service, method, Vec::new())
    }

    fn from_parts(service: &str, method: &str, args: Vec<Value>) -> Self {
        // `serde_json` maps are ordered by key, so this encoding is canonical.
        let args = Value::Array(args).to_string();
        Self {
            service: service.into(),
            method: method.into(),
            args: args.into(),
        }
    }

    /// The service identifier.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// The method identifier.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// The `service.method` identifier under which the compute method is registered.
    pub fn method_id(&self) -> String {
        format!("{}.{}", self.service, self.method)
    }

    /// The canonical JSON encoding of the argument list.
    pub fn raw_args(&self) -> &str {
        &self.args
    }

    /// Deserializes the argument list, typically into a tuple.
    ///
    /// Mirrors the normalization of [`new`](Self::new): an empty list also deserializes as
    /// `()`, a single argument also as the bare value.
    pub fn args<T: DeserializeOwned>(&self) -> Result<T, ComputeError> {
        let err = match serde_json::from_str(&self.args) {
            Ok(args) => return Ok(args),
            Err(err) => err,
        };
        let mut list: Vec<Value> = serde_json::from_str(&self.args)?;
        let fallback = match list.len() {
            0 => T::deserialize(Value::Null),
            1 => T::deserialize(list.remove(0)),
            _ => return Err(err.into()),
        };
        fallback.map_err(|_| err.into())
    }
}

impl fmt::Display for ComputedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // `[..]` is the encoded argument array, so this reads like `time.format["%H:%M"]`.
        write!(f, "{}.{}{}", self.service, self.method, self.args)
    }
}

impl fmt::Debug for ComputedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComputedKey({self})")
    }
}

#[derive(Serialize, Deserialize)]
struct WireKey {
    service: String,
    method: String,
    #[serde(default)]
    args: Vec<Value>,
}

impl From<ComputedKey> for WireKey {
    fn from(key: ComputedKey) -> Self {
        // The canonical encoding was produced by `serde_json` itself.
        let args = serde_json::from_str(&key.args).unwrap_or_default();
        WireKey {
            service: key.service.to_string(),
            method: key.method.to_string(),
            args,
        }
    }
}

impl TryFrom<WireKey> for ComputedKey {
    type Error = String;

    fn try_from(wire: WireKey) -> Result<Self, Self::Error> {
        if wire.service.is_empty() || wire.method.is_empty() {
            return Err("service and method must not be empty".to_owned());
        }
        Ok(ComputedKey::from_parts(&wire.service, &wire.method, wire.args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_normalization() {
        let unit = ComputedKey::new("time", "now", &()).unwrap();
        assert_eq!(unit, ComputedKey::unit("time", "now"));
        assert_eq!(unit.raw_args(), "[]");

        let single = ComputedKey::new("users", "get", &42).unwrap();
        let tuple = ComputedKey::new("users", "get", &(42,)).unwrap();
        assert_eq!(single, tuple);
        assert_eq!(single.to_string(), "users.get[42]");

        let (id, name): (u32, String) = ComputedKey::new("users", "find", &(7, "ann"))
            .unwrap()
            .args()
            .unwrap();
        assert_eq!((id, name.as_str()), (7, "ann"));

        unit.args::<()>().unwrap();
        assert_eq!(single.args::<u32>().unwrap(), 42);
        assert_eq!(single.args::<(u32,)>().unwrap(), (42,));
        assert!(single.args::<String>().is_err());
    }

    #[test]
    fn test_object_args_are_canonical() {
        let a = ComputedKey::new("q", "m", &serde_json::json!([{"b": 1, "a": 2}])).unwrap();
        let b = ComputedKey::new("q", "m", &serde_json::json!([{"a": 2, "b": 1}])).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_wire_format() {
        let key = ComputedKey::new("time", "format", &("%H:%M",)).unwrap();
        assert_eq!(
            serde_json::to_value(&key).unwrap(),
            serde_json::json!({"service": "time", "method": "format", "args": ["%H:%M"]})
        );

        let parsed: ComputedKey =
            serde_json::from_str(r#"{"service":"time","method":"now"}"#).unwrap();
        assert_eq!(parsed, ComputedKey::unit("time", "now"));

        let empty = serde_json::from_str::<ComputedKey>(r#"{"service":"","method":"now"}"#);
        assert!(empty.is_err());
    }
}
