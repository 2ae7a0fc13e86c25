//! Decoded bencode values
//!
//! A tagged variant over the four bencode types. Downstream code matches on
//! the tag and fails explicitly on an unexpected variant.

use std::collections::BTreeMap;

use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};

use crate::error::{DecodeErrorKind, TorrentError};

/// Dictionary representation: keys are raw byte strings, ordered byte-wise
pub type Dict = BTreeMap<Vec<u8>, Value>;

/// A decoded bencode value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Byte string (not necessarily UTF-8)
    Bytes(Vec<u8>),
    /// Signed integer
    Int(i64),
    /// Ordered list
    List(Vec<Value>),
    /// Dictionary with byte-string keys
    Dict(Dict),
}

impl Value {
    /// Build a byte-string value from text
    pub fn string(s: &str) -> Self {
        Value::Bytes(s.as_bytes().to_vec())
    }

    /// Short name of the variant, used in error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bytes(_) => "string",
            Value::Int(_) => "integer",
            Value::List(_) => "list",
            Value::Dict(_) => "dictionary",
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// The value as UTF-8 text, if it is a byte string holding valid UTF-8
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&Dict> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Look up a key when this value is a dictionary
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict()?.get(key)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(l: Vec<Value>) -> Self {
        Value::List(l)
    }
}

impl From<Dict> for Value {
    fn from(d: Dict) -> Self {
        Value::Dict(d)
    }
}

/// JSON rendering for the `decode` command; byte strings become lossy UTF-8
impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Bytes(b) => serializer.serialize_str(&String::from_utf8_lossy(b)),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Dict(dict) => {
                let mut map = serializer.serialize_map(Some(dict.len()))?;
                for (key, value) in dict {
                    map.serialize_entry(&String::from_utf8_lossy(key), value)?;
                }
                map.end()
            }
        }
    }
}

/// JSON documents map onto bencode except for null, booleans and non-integers
impl TryFrom<serde_json::Value> for Value {
    type Error = TorrentError;

    fn try_from(json: serde_json::Value) -> Result<Self, Self::Error> {
        match json {
            serde_json::Value::String(s) => Ok(Value::Bytes(s.into_bytes())),
            serde_json::Value::Number(n) => n.as_i64().map(Value::Int).ok_or_else(|| {
                TorrentError::encoding_error(
                    format!("number {} is not a 64-bit integer", n),
                    DecodeErrorKind::UnsupportedValue,
                )
            }),
            serde_json::Value::Array(items) => items
                .into_iter()
                .map(Value::try_from)
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
            serde_json::Value::Object(map) => {
                let mut dict = Dict::new();
                for (key, value) in map {
                    dict.insert(key.into_bytes(), Value::try_from(value)?);
                }
                Ok(Value::Dict(dict))
            }
            other => Err(TorrentError::encoding_error(
                format!("{} has no bencode representation", other),
                DecodeErrorKind::UnsupportedValue,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessors() {
        let value = Value::string("hello");
        assert_eq!(value.as_str(), Some("hello"));
        assert_eq!(value.as_int(), None);
        assert_eq!(value.type_name(), "string");

        let value = Value::Int(-7);
        assert_eq!(value.as_int(), Some(-7));
        assert!(value.as_bytes().is_none());
    }

    #[test]
    fn test_get_on_dict() {
        let mut dict = Dict::new();
        dict.insert(b"foo".to_vec(), Value::string("bar"));
        let value = Value::Dict(dict);

        assert_eq!(value.get(b"foo").and_then(Value::as_str), Some("bar"));
        assert!(value.get(b"missing").is_none());
        assert!(Value::Int(1).get(b"foo").is_none());
    }

    #[test]
    fn test_json_rendering() {
        let mut dict = Dict::new();
        dict.insert(b"hello".to_vec(), Value::Int(52));
        dict.insert(b"foo".to_vec(), Value::List(vec![Value::string("bar")]));

        let json = serde_json::to_string(&Value::Dict(dict)).unwrap();
        assert_eq!(json, r#"{"foo":["bar"],"hello":52}"#);
    }

    #[test]
    fn test_from_json() {
        let json: serde_json::Value = serde_json::from_str(r#"{"b":1,"a":["x",2]}"#).unwrap();
        let value = Value::try_from(json).unwrap();
        assert_eq!(value.get(b"b"), Some(&Value::Int(1)));
        assert_eq!(
            value.get(b"a"),
            Some(&Value::List(vec![Value::string("x"), Value::Int(2)]))
        );
    }

    #[test]
    fn test_from_json_unsupported() {
        for text in ["1.5", "true", "null", r#"{"a":[false]}"#] {
            let json: serde_json::Value = serde_json::from_str(text).unwrap();
            let err = Value::try_from(json).unwrap_err();
            assert_eq!(err.decode_kind(), Some(DecodeErrorKind::UnsupportedValue), "{}", text);
        }
    }
}
