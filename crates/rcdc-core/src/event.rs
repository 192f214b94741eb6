//! Change events as delivered by an engine, and records as seen downstream.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::offset::{SourceOffset, SourcePartition};

/// Kind of row-level change carried by a [`ChangeEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Insert,
    Update,
    Delete,
    /// Row read during the initial snapshot
    Snapshot,
    /// DDL observed on the source table
    SchemaChange,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Snapshot => "snapshot",
            Operation::SchemaChange => "schema_change",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded change as pushed by the embedded engine
///
/// Within one partition, offsets are strictly increasing in emission order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub partition: SourcePartition,
    pub offset: SourceOffset,
    #[serde(rename = "op")]
    pub operation: Operation,
    pub key: Value,
    /// New row image; absent for deletes
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(rename = "ts_ms")]
    pub timestamp_ms: i64,
}

impl ChangeEvent {
    pub fn new(
        partition: impl Into<SourcePartition>,
        offset: u64,
        operation: Operation,
        key: Value,
        value: Option<Value>,
        timestamp_ms: i64,
    ) -> Self {
        Self {
            partition: partition.into(),
            offset: SourceOffset(offset),
            operation,
            key,
            value,
            timestamp_ms,
        }
    }
}

/// Operation kind exposed on a [`Record`] as its own tagged field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Insert,
    Update,
    Delete,
    Snapshot,
    SchemaChange,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Insert => "insert",
            RecordKind::Update => "update",
            RecordKind::Delete => "delete",
            RecordKind::Snapshot => "snapshot",
            RecordKind::SchemaChange => "schema_change",
        }
    }
}

impl From<Operation> for RecordKind {
    fn from(op: Operation) -> Self {
        match op {
            Operation::Insert => RecordKind::Insert,
            Operation::Update => RecordKind::Update,
            Operation::Delete => RecordKind::Delete,
            Operation::Snapshot => RecordKind::Snapshot,
            Operation::SchemaChange => RecordKind::SchemaChange,
        }
    }
}

/// Stable identity of a record, valid across restarts of the same connector
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId {
    pub partition: SourcePartition,
    pub offset: SourceOffset,
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.partition, self.offset)
    }
}

/// The externally visible unit produced from a [`ChangeEvent`]
///
/// `value` is `None` for deletes (tombstone).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: Value,
    pub value: Option<Value>,
    #[serde(rename = "ts_ms")]
    pub timestamp_ms: i64,
    pub partition: SourcePartition,
    pub offset: SourceOffset,
    pub kind: RecordKind,
}

impl Record {
    pub fn id(&self) -> RecordId {
        RecordId {
            partition: self.partition.clone(),
            offset: self.offset,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}
