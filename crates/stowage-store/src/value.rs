//! Primitive value model shared by every backend.
//!
//! A [`Value`] is what a single field of a [`DecomposedObject`] holds. The
//! textual backends cannot represent every variant natively (bytes and
//! timestamps come back as strings), so the `as_*` accessors accept the
//! backend encodings as long as the conversion is lossless.

use std::cmp::Ordering;
use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};

use crate::decomposed::DecomposedObject;
use crate::error::{StorageError, StorageResult};

/// Largest integer magnitude an `f64` represents exactly.
const F64_EXACT_INT: i64 = 1 << 53;

/// A primitive, list, or nested composite field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// An absent list element. Absent fields are simply left out of their
    /// object; `Null` only keeps a position inside a [`Value::List`].
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
    List(Vec<Value>),
    Nested(DecomposedObject),
}

/// The variant of a [`Value`], used in error messages and schema checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Null,
    Bool,
    Int,
    Float,
    Str,
    Bytes,
    Timestamp,
    List,
    Nested,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Null => "null",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::Str => "string",
            Self::Bytes => "bytes",
            Self::Timestamp => "timestamp",
            Self::List => "list",
            Self::Nested => "composite",
        };
        f.write_str(name)
    }
}

/// Owned byte sequence field.
///
/// A newtype so that `Vec<T>` stays free to mean "indexed collection".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Blob(pub Vec<u8>);

impl From<Vec<u8>> for Blob {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl Value {
    /// The variant of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Null => ValueKind::Null,
            Self::Bool(_) => ValueKind::Bool,
            Self::Int(_) => ValueKind::Int,
            Self::Float(_) => ValueKind::Float,
            Self::Str(_) => ValueKind::Str,
            Self::Bytes(_) => ValueKind::Bytes,
            Self::Timestamp(_) => ValueKind::Timestamp,
            Self::List(_) => ValueKind::List,
            Self::Nested(_) => ValueKind::Nested,
        }
    }

    pub fn as_bool(&self, path: &str) -> StorageResult<bool> {
        match self {
            Self::Bool(b) => Ok(*b),
            other => Err(StorageError::mismatch(path, ValueKind::Bool, other.kind())),
        }
    }

    /// Integer view. Integral floats within range are accepted.
    pub fn as_i64(&self, path: &str) -> StorageResult<i64> {
        match self {
            Self::Int(i) => Ok(*i),
            Self::Float(f) if f.fract() == 0.0 && *f >= i64::MIN as f64 && *f < i64::MAX as f64 => {
                Ok(*f as i64)
            }
            other => Err(StorageError::mismatch(path, ValueKind::Int, other.kind())),
        }
    }

    /// Floating-point view. Integers are accepted while they stay exact.
    pub fn as_f64(&self, path: &str) -> StorageResult<f64> {
        match self {
            Self::Float(f) => Ok(*f),
            Self::Int(i) if i.unsigned_abs() <= F64_EXACT_INT.unsigned_abs() => Ok(*i as f64),
            other => Err(StorageError::mismatch(path, ValueKind::Float, other.kind())),
        }
    }

    pub fn as_str(&self, path: &str) -> StorageResult<&str> {
        match self {
            Self::Str(s) => Ok(s),
            other => Err(StorageError::mismatch(path, ValueKind::Str, other.kind())),
        }
    }

    /// Byte view. Base64 text (the flat-file encoding) is decoded.
    pub fn as_bytes(&self, path: &str) -> StorageResult<Vec<u8>> {
        match self {
            Self::Bytes(b) => Ok(b.clone()),
            Self::Str(s) => BASE64
                .decode(s)
                .map_err(|_| StorageError::mismatch(path, ValueKind::Bytes, "non-base64 string")),
            other => Err(StorageError::mismatch(path, ValueKind::Bytes, other.kind())),
        }
    }

    /// Timestamp view. RFC 3339 text and epoch milliseconds are decoded.
    pub fn as_timestamp(&self, path: &str) -> StorageResult<DateTime<Utc>> {
        match self {
            Self::Timestamp(ts) => Ok(*ts),
            Self::Str(s) => DateTime::parse_from_rfc3339(s)
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(|_| StorageError::mismatch(path, ValueKind::Timestamp, "non-RFC 3339 string")),
            Self::Int(millis) => Utc
                .timestamp_millis_opt(*millis)
                .single()
                .ok_or_else(|| StorageError::mismatch(path, ValueKind::Timestamp, "out-of-range millis")),
            other => Err(StorageError::mismatch(path, ValueKind::Timestamp, other.kind())),
        }
    }

    /// Render as a key string (used when a relational key column is read back).
    pub fn to_key_string(&self) -> String {
        match self {
            Self::Null => "null".to_string(),
            Self::Str(s) => s.clone(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Timestamp(ts) => ts.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            Self::Bytes(b) => BASE64.encode(b),
            Self::List(_) | Self::Nested(_) => format!("<{}>", self.kind()),
        }
    }

    /// Ordering used by range predicates. `None` when the kinds are not comparable.
    pub(crate) fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => Some(a.cmp(b)),
            (Self::Int(a), Self::Float(b)) => (*a as f64).partial_cmp(b),
            (Self::Float(a), Self::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Self::Float(a), Self::Float(b)) => a.partial_cmp(b),
            (Self::Str(a), Self::Str(b)) => Some(a.cmp(b)),
            (Self::Bool(a), Self::Bool(b)) => Some(a.cmp(b)),
            (Self::Timestamp(a), Self::Timestamp(b)) => Some(a.cmp(b)),
            (Self::Bytes(a), Self::Bytes(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    // ── tree encoding ────────────────────────────────────────────────

    /// Convert to the document tree used by the flat-file family.
    pub fn to_json(&self) -> StorageResult<serde_json::Value> {
        use serde_json::Value as Json;

        Ok(match self {
            Self::Null => Json::Null,
            Self::Bool(b) => Json::Bool(*b),
            Self::Int(i) => Json::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .ok_or_else(|| StorageError::mismatch("", "finite float", f))?,
            Self::Str(s) => Json::String(s.clone()),
            Self::Bytes(b) => Json::String(BASE64.encode(b)),
            Self::Timestamp(ts) => Json::String(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            Self::List(items) => Json::Array(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| item.to_json().map_err(|e| e.under(&i.to_string())))
                    .collect::<StorageResult<_>>()?,
            ),
            Self::Nested(object) => object.to_json()?,
        })
    }

    /// Convert from a document tree node. JSON `null` is an absent value,
    /// except inside an array where it keeps its position as [`Value::Null`].
    pub fn from_json(json: serde_json::Value) -> Option<Self> {
        use serde_json::Value as Json;

        match json {
            Json::Null => None,
            Json::Bool(b) => Some(Self::Bool(b)),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Some(Self::Int(i)),
                None => n.as_f64().map(Self::Float),
            },
            Json::String(s) => Some(Self::Str(s)),
            Json::Array(items) => Some(Self::List(
                items
                    .into_iter()
                    .map(|item| Self::from_json(item).unwrap_or(Self::Null))
                    .collect(),
            )),
            Json::Object(map) => Some(Self::Nested(DecomposedObject::from_json_map(map))),
        }
    }
}

// ── conversions ──────────────────────────────────────────────────────

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<Blob> for Value {
    fn from(blob: Blob) -> Self {
        Self::Bytes(blob.0)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(ts: DateTime<Utc>) -> Self {
        Self::Timestamp(ts)
    }
}

impl From<DecomposedObject> for Value {
    fn from(object: DecomposedObject) -> Self {
        Self::Nested(object)
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integral_floats_coerce_to_int() {
        assert_eq!(Value::Float(30.0).as_i64("age").unwrap(), 30);
        assert!(Value::Float(30.5).as_i64("age").is_err());
    }

    #[test]
    fn strings_never_coerce_to_numbers() {
        let err = Value::from("high").as_f64("score").unwrap_err();
        match err {
            StorageError::TypeMismatch { path, expected, found } => {
                assert_eq!(path, "score");
                assert_eq!(expected, "float");
                assert_eq!(found, "string");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn large_ints_do_not_become_floats() {
        assert!(Value::Int(F64_EXACT_INT + 1).as_f64("n").is_err());
        assert_eq!(Value::Int(F64_EXACT_INT).as_f64("n").unwrap(), F64_EXACT_INT as f64);
    }

    #[test]
    fn extreme_ints_are_checked_without_overflow() {
        assert!(Value::Int(i64::MIN).as_f64("n").is_err());
        assert!(Value::Int(i64::MAX).as_f64("n").is_err());
        assert_eq!(Value::Int(-F64_EXACT_INT).as_f64("n").unwrap(), -(F64_EXACT_INT as f64));
        assert!(Value::Int(-F64_EXACT_INT - 1).as_f64("n").is_err());
    }

    #[test]
    fn bytes_survive_the_text_encoding() {
        let value = Value::Bytes(vec![0, 1, 2, 254, 255]);
        let json = value.to_json().unwrap();
        assert!(json.is_string());

        let back = Value::from_json(json).unwrap();
        assert_eq!(back.kind(), ValueKind::Str);
        assert_eq!(back.as_bytes("blob").unwrap(), vec![0, 1, 2, 254, 255]);
    }

    #[test]
    fn timestamps_survive_the_text_encoding() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 17, 8, 30, 0).unwrap();
        let back = Value::from_json(Value::Timestamp(ts).to_json().unwrap()).unwrap();
        assert_eq!(back.as_timestamp("at").unwrap(), ts);
        assert_eq!(Value::Int(ts.timestamp_millis()).as_timestamp("at").unwrap(), ts);
    }

    #[test]
    fn non_finite_floats_are_rejected() {
        assert!(matches!(
            Value::Float(f64::NAN).to_json(),
            Err(StorageError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn json_null_is_absent() {
        assert_eq!(Value::from_json(serde_json::Value::Null), None);
    }

    #[test]
    fn null_array_elements_keep_their_position() {
        let back = Value::from_json(serde_json::json!([1, null, 3])).unwrap();
        assert_eq!(back, Value::List(vec![Value::Int(1), Value::Null, Value::Int(3)]));
        assert_eq!(back.to_json().unwrap(), serde_json::json!([1, null, 3]));
    }

    #[test]
    fn mixed_numeric_comparison() {
        assert_eq!(Value::Int(2).compare(&Value::Float(2.5)), Some(Ordering::Less));
        assert_eq!(Value::from("a").compare(&Value::Int(1)), None);
    }
}
