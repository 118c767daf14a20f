//! Dynamic scalar values used for bound parameters, filters, and decoded rows.
//!
//! A filter is an open mapping of column to literal, and params are
//! normalized at the boundary into `Vec<Value>` rather than propagating the
//! scalar/array union inward.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A SQLite-compatible scalar: integer, float, text, blob, or null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Real(r) => write!(f, "{r}"),
            Value::Text(s) => write!(f, "{s}"),
            Value::Blob(b) => write!(f, "<blob {} bytes>", b.len()),
        }
    }
}

impl Value {
    pub fn from_json(v: &serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Integer(if *b { 1 } else { 0 }),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Integer(i)
                } else {
                    Value::Real(n.as_f64().unwrap_or_default())
                }
            }
            serde_json::Value::String(s) => Value::Text(s.clone()),
            other => Value::Text(other.to_string()),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Integer(i) => serde_json::json!(i),
            Value::Real(r) => serde_json::json!(r),
            Value::Text(s) => serde_json::json!(s),
            Value::Blob(b) => serde_json::json!(b),
        }
    }
}

/// Equality filter: column name -> required literal value.
pub type Filter = BTreeMap<String, Value>;

/// Normalize the polymorphic `params` wire field (scalar or array) into a
/// flat `Vec<Value>`.
pub fn normalize_params(params: Option<serde_json::Value>) -> Vec<Value> {
    match params {
        None => Vec::new(),
        Some(serde_json::Value::Array(items)) => items.iter().map(Value::from_json).collect(),
        Some(scalar) => vec![Value::from_json(&scalar)],
    }
}

/// A decoded row: column name -> value, in column order.
pub type Row = Vec<(String, Value)>;

pub fn row_to_json(row: &Row) -> serde_json::Value {
    serde_json::Value::Object(
        row.iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect(),
    )
}
