use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::lsn::Lsn;

/// A value from a Postgres row, supporting common types.
///
/// `Bytes` carries binary-encoded column images verbatim; in JSON it
/// degrades to an array of integers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    Object(HashMap<String, Value>),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if let Some(f) = n.as_f64() {
                    Value::Float(f)
                } else {
                    Value::Null
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(arr) => {
                Value::Array(arr.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(obj) => {
                Value::Object(obj.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(v: Value) -> Self {
        match v {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Int(i) => serde_json::Value::Number(i.into()),
            Value::Float(f) => serde_json::Number::from_f64(f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s),
            Value::Array(arr) => {
                serde_json::Value::Array(arr.into_iter().map(serde_json::Value::from).collect())
            }
            Value::Object(obj) => serde_json::Value::Object(
                obj.into_iter()
                    .map(|(k, v)| (k, serde_json::Value::from(v)))
                    .collect(),
            ),
            Value::Bytes(bytes) => serde_json::Value::Array(
                bytes
                    .into_iter()
                    .map(|b| serde_json::Value::Number(b.into()))
                    .collect(),
            ),
        }
    }
}

/// The type of database operation that produced this event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
    Truncate,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Truncate => "truncate",
        }
    }

    /// Parse an operation name as written by log-table triggers;
    /// accepts full names and single-letter codes, case-insensitive.
    pub fn parse(s: &str) -> Option<Operation> {
        match s.to_ascii_lowercase().as_str() {
            "insert" | "i" => Some(Operation::Insert),
            "update" | "u" => Some(Operation::Update),
            "delete" | "d" => Some(Operation::Delete),
            "truncate" | "t" => Some(Operation::Truncate),
            _ => None,
        }
    }
}

/// Where an event entered the pipeline: the live replication stream, or
/// log-table replay during gap recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventOrigin {
    Stream,
    Replay,
}

/// A row map containing column name to value mappings.
pub type RowMap = HashMap<String, Value>;

/// A committed change derived from the Postgres WAL or a log table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// The type of operation (insert, update, delete, truncate).
    pub op: Operation,
    /// The schema name (e.g., "public").
    pub schema: String,
    /// The table name.
    pub table: String,
    /// The new row values (present for insert/update).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new: Option<RowMap>,
    /// The full old row values (update/delete with replica identity full).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<RowMap>,
    /// The replica-identity key values (update/delete without a full old row).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<RowMap>,
    /// The LSN of the commit that made this change visible.
    pub commit_lsn: Lsn,
    /// The commit timestamp (absent for replayed rows that lack one).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_ts: Option<DateTime<Utc>>,
    /// The transaction ID (absent for replayed rows).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xid: Option<u32>,
    /// Whether this event came from the live stream or gap replay.
    pub origin: EventOrigin,
}

impl ChangeEvent {
    /// Get the relevant row data for this event.
    /// For inserts/updates, returns new; for deletes, the old or key image.
    pub fn row(&self) -> Option<&RowMap> {
        match self.op {
            Operation::Insert | Operation::Update => self.new.as_ref(),
            Operation::Delete => self.old.as_ref().or(self.key.as_ref()),
            Operation::Truncate => None,
        }
    }

    /// Get a value from the new row.
    pub fn get_new(&self, column: &str) -> Option<&Value> {
        self.new.as_ref().and_then(|row| row.get(column))
    }

    /// Get a value from the old row (falling back to the key image).
    pub fn get_old(&self, column: &str) -> Option<&Value> {
        self.old
            .as_ref()
            .or(self.key.as_ref())
            .and_then(|row| row.get(column))
    }
}
