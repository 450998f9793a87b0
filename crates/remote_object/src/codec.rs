//! The bounded value vocabulary that crosses the wire as method arguments,
//! keyword maps, and results, plus its bit-exact `bincode` encoding.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by [`encode`] or [`decode`].
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode value: {0}")]
    Encode(#[source] bincode::error::EncodeError),
    #[error("failed to decode value: {0}")]
    Decode(#[source] bincode::error::DecodeError),
    #[error("value is not serializable (e.g. contains a non-finite float)")]
    NotSerializable,
}

/// Any value that can be sent as a method argument, keyword value, or result.
///
/// This is a closed set by design: the whole point of the codec is a wire
/// format both peers agree on bit-for-bit, so there is no escape hatch for
/// arbitrary host-language values the way a dynamically typed original would
/// have. Hosts map their own types onto this enum at the boundary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Bytes(Vec<u8>),
    String(String),
    List(Vec<Value>),
    Dict(BTreeMap<String, Value>),
}

impl Value {
    /// Convenience constructor for string values.
    pub fn string(s: impl Into<String>) -> Self {
        Value::String(s.into())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

fn bincode_config() -> impl bincode::config::Config {
    bincode::config::standard()
}

/// Serialize a [`Value`] to its wire bytes.
///
/// Compatibility requires bit-identical encoding across peers, so this always
/// uses the one fixed `bincode` configuration; it is not user-configurable.
pub fn encode(value: &Value) -> Result<Vec<u8>, CodecError> {
    bincode::serde::encode_to_vec(value, bincode_config()).map_err(CodecError::Encode)
}

/// Deserialize a [`Value`] from wire bytes produced by [`encode`].
pub fn decode(bytes: &[u8]) -> Result<Value, CodecError> {
    bincode::serde::decode_from_slice(bytes, bincode_config())
        .map(|(value, _consumed)| value)
        .map_err(CodecError::Decode)
}

/// Whether `value` is safe to put on the wire.
///
/// Consistent with [`encode`]: if this returns `true`, `encode` must succeed.
/// The converse need not hold, but in this realization it does too — the only
/// non-serializable values are non-finite floats, checked recursively.
pub fn is_serializable(value: &Value) -> bool {
    match value {
        Value::Null | Value::Bool(_) | Value::Int(_) | Value::Bytes(_) | Value::String(_) => true,
        Value::Float(f) => f.is_finite(),
        Value::List(items) => items.iter().all(is_serializable),
        Value::Dict(map) => map.values().all(is_serializable),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_scalars() {
        for value in [
            Value::Null,
            Value::Bool(true),
            Value::Int(-42),
            Value::Float(3.5),
            Value::Bytes(vec![1, 2, 3]),
            Value::string("hello"),
        ] {
            let bytes = encode(&value).unwrap();
            assert_eq!(decode(&bytes).unwrap(), value);
        }
    }

    #[test]
    fn round_trips_nested_collections() {
        let mut dict = BTreeMap::new();
        dict.insert("a".to_string(), Value::Int(1));
        dict.insert(
            "b".to_string(),
            Value::List(vec![Value::string("x"), Value::Bool(false)]),
        );
        let value = Value::Dict(dict);
        let bytes = encode(&value).unwrap();
        assert_eq!(decode(&bytes).unwrap(), value);
    }

    #[test]
    fn nan_and_infinite_floats_are_not_serializable() {
        assert!(!is_serializable(&Value::Float(f64::NAN)));
        assert!(!is_serializable(&Value::Float(f64::INFINITY)));
        assert!(!is_serializable(&Value::Float(f64::NEG_INFINITY)));
        assert!(is_serializable(&Value::Float(0.0)));
    }

    #[test]
    fn non_serializable_value_nests_through_collections() {
        let value = Value::List(vec![Value::Int(1), Value::Float(f64::NAN)]);
        assert!(!is_serializable(&value));

        let mut dict = BTreeMap::new();
        dict.insert("bad".to_string(), Value::Float(f64::NAN));
        assert!(!is_serializable(&Value::Dict(dict)));
    }

    #[test]
    fn is_serializable_implies_encode_succeeds() {
        let value = Value::List(vec![Value::Int(1), Value::string("ok")]);
        assert!(is_serializable(&value));
        assert!(encode(&value).is_ok());
    }
}
