//! The four primitive operations of the replicated substrate

use super::horizon::{Horizon, ReplicaId, SeqNum};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Unique identifier for an operation
pub type OpId = Uuid;

/// A value that can be stored in map entries and array elements
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn string(s: impl Into<String>) -> Self {
        Value::String(s.into())
    }

    pub fn int(n: i64) -> Self {
        Value::Int(n)
    }

    pub fn bool(b: bool) -> Self {
        Value::Bool(b)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Short name of the variant, used in diagnostics
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Bytes(bytes)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Total order over operations: Lamport clock, then replica id as tiebreaker.
///
/// Used for last-writer-wins on map entries and as the identity of array
/// elements.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Stamp {
    pub lamport: u64,
    pub replica: ReplicaId,
}

impl Stamp {
    pub fn new(lamport: u64, replica: impl Into<ReplicaId>) -> Self {
        Self {
            lamport,
            replica: replica.into(),
        }
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.lamport, self.replica)
    }
}

/// Identity of an array element: the stamp of the operation that inserted it
pub type ElemId = Stamp;

/// Name of a map or array inside a replica
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContainerId(String);

impl ContainerId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The primitive operations
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    /// Write a map entry (latest stamp wins)
    MapPut {
        container: ContainerId,
        key: String,
        value: Value,
    },

    /// Tombstone a map entry (latest stamp wins)
    MapRemove { container: ContainerId, key: String },

    /// Insert into an array right after `after` (`None` = at the head)
    ArrayInsert {
        container: ContainerId,
        after: Option<ElemId>,
        value: Value,
    },

    /// Tombstone an array element
    ArrayRemove {
        container: ContainerId,
        target: ElemId,
    },
}

impl Operation {
    pub fn container(&self) -> &ContainerId {
        match self {
            Operation::MapPut { container, .. } => container,
            Operation::MapRemove { container, .. } => container,
            Operation::ArrayInsert { container, .. } => container,
            Operation::ArrayRemove { container, .. } => container,
        }
    }

    /// Map key written or removed, if this is a map operation
    pub fn key(&self) -> Option<&str> {
        match self {
            Operation::MapPut { key, .. } | Operation::MapRemove { key, .. } => Some(key),
            _ => None,
        }
    }
}

/// An operation wrapped with metadata for transmission and storage
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpEnvelope {
    pub id: OpId,

    /// Which replica authored this operation
    pub author: ReplicaId,

    /// Sequence number within the author's stream
    pub seq: SeqNum,

    pub lamport: u64,

    /// What the author had seen when it created this operation
    pub horizon: Horizon,

    pub op: Operation,
}

impl OpEnvelope {
    pub fn new(author: ReplicaId, seq: SeqNum, lamport: u64, horizon: Horizon, op: Operation) -> Self {
        Self {
            id: Uuid::new_v4(),
            author,
            seq,
            lamport,
            horizon,
            op,
        }
    }

    pub fn stamp(&self) -> Stamp {
        Stamp::new(self.lamport, self.author.clone())
    }

    /// Check if this operation was informed about another operation
    pub fn had_seen(&self, other: &OpEnvelope) -> bool {
        self.horizon.has_seen(&other.author, other.seq)
    }
}
