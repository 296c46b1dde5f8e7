//! Tagged value representation for everything that crosses the result cache.
//!
//! Store rows are decoded into [`FieldValue`] at the connector boundary and
//! only ever re-encoded when a backend needs its native form. The cache
//! contract is: a value serializes to exactly the JSON shape its tag implies
//! (`Null` → `null`, `Mapping` → object, ...) and deserializes back by the
//! same rule, so no backend-specific object graph ever lands in the cache.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;

/// A single row retrieved from (or written back to) a collection.
pub type Row = BTreeMap<String, FieldValue>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "JsonValue", into = "JsonValue")]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Sequence(Vec<FieldValue>),
    Mapping(BTreeMap<String, FieldValue>),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Scalar values are usable in equality predicates; sequences and
    /// mappings are not.
    pub fn is_scalar(&self) -> bool {
        !matches!(self, FieldValue::Sequence(_) | FieldValue::Mapping(_))
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => write!(f, "null"),
            FieldValue::Bool(b) => write!(f, "{}", b),
            FieldValue::Int(i) => write!(f, "{}", i),
            FieldValue::Float(x) => write!(f, "{}", x),
            FieldValue::String(s) => write!(f, "{}", s),
            other => write!(f, "{}", JsonValue::from(other.clone())),
        }
    }
}

impl From<JsonValue> for FieldValue {
    fn from(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => FieldValue::Null,
            JsonValue::Bool(b) => FieldValue::Bool(b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    FieldValue::Int(i)
                } else {
                    // u64 beyond i64::MAX or a true float
                    FieldValue::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            JsonValue::String(s) => FieldValue::String(s),
            JsonValue::Array(items) => {
                FieldValue::Sequence(items.into_iter().map(FieldValue::from).collect())
            }
            JsonValue::Object(map) => FieldValue::Mapping(
                map.into_iter().map(|(k, v)| (k, FieldValue::from(v))).collect(),
            ),
        }
    }
}

impl From<FieldValue> for JsonValue {
    fn from(value: FieldValue) -> Self {
        match value {
            FieldValue::Null => JsonValue::Null,
            FieldValue::Bool(b) => JsonValue::Bool(b),
            FieldValue::Int(i) => JsonValue::from(i),
            FieldValue::Float(x) => {
                serde_json::Number::from_f64(x).map(JsonValue::Number).unwrap_or(JsonValue::Null)
            }
            FieldValue::String(s) => JsonValue::String(s),
            FieldValue::Sequence(items) => {
                JsonValue::Array(items.into_iter().map(JsonValue::from).collect())
            }
            FieldValue::Mapping(map) => JsonValue::Object(
                map.into_iter().map(|(k, v)| (k, JsonValue::from(v))).collect(),
            ),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::String(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::String(s)
    }
}

impl From<i64> for FieldValue {
    fn from(i: i64) -> Self {
        FieldValue::Int(i)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Bool(b)
    }
}

/// Encode a node's retrieved rows as a single cacheable value.
pub fn rows_to_value(rows: &[Row]) -> FieldValue {
    FieldValue::Sequence(rows.iter().map(|r| FieldValue::Mapping(r.clone())).collect())
}

/// Decode a cached value back into rows. Non-row entries (anything that is
/// not a mapping) are skipped rather than failing the whole read.
pub fn rows_from_value(value: &FieldValue) -> Vec<Row> {
    match value {
        FieldValue::Sequence(items) => items
            .iter()
            .filter_map(|item| match item {
                FieldValue::Mapping(map) => Some(map.clone()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}
