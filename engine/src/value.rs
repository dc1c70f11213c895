//! Row and primary-key values.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Column values of a row, keyed by column name.
///
/// A `BTreeMap` keeps column order deterministic when rows are serialized.
pub type Row = BTreeMap<crate::ColumnName, serde_json::Value>;

/// One component of a primary key.
///
/// Key parts must be hashable and totally ordered, so only scalar JSON
/// values are allowed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyValue {
    Int(i64),
    Bool(bool),
    Text(String),
}

impl KeyValue {
    /// Convert a JSON value into a key part. Returns `None` for nulls,
    /// floats, arrays and objects.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(KeyValue::Bool(*b)),
            serde_json::Value::Number(n) => n.as_i64().map(KeyValue::Int),
            serde_json::Value::String(s) => Some(KeyValue::Text(s.clone())),
            _ => None,
        }
    }

    /// Convert this key part back into a JSON value.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            KeyValue::Int(i) => serde_json::Value::from(*i),
            KeyValue::Bool(b) => serde_json::Value::Bool(*b),
            KeyValue::Text(s) => serde_json::Value::String(s.clone()),
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Int(i) => write!(f, "{i}"),
            KeyValue::Bool(b) => write!(f, "{b}"),
            KeyValue::Text(s) => write!(f, "'{s}'"),
        }
    }
}

impl From<i64> for KeyValue {
    fn from(value: i64) -> Self {
        KeyValue::Int(value)
    }
}

impl From<&str> for KeyValue {
    fn from(value: &str) -> Self {
        KeyValue::Text(value.to_string())
    }
}

impl From<String> for KeyValue {
    fn from(value: String) -> Self {
        KeyValue::Text(value)
    }
}

/// An ordered tuple of key values, one per primary-key column in schema order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrimaryKey(pub Vec<KeyValue>);

impl PrimaryKey {
    pub fn new(parts: Vec<KeyValue>) -> Self {
        Self(parts)
    }

    /// Key for a table with a single primary-key column.
    pub fn single(part: impl Into<KeyValue>) -> Self {
        Self(vec![part.into()])
    }

    pub fn parts(&self) -> &[KeyValue] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{part}")?;
        }
        write!(f, ")")
    }
}
