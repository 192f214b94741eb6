//! Source partitions, source offsets, and the per-partition offset map.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of the originating table or shard of a change
///
/// Each partition is an independent ordering domain: offsets are only
/// comparable within one partition.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourcePartition(String);

impl SourcePartition {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SourcePartition {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for SourcePartition {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl fmt::Display for SourcePartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Position within a source partition
///
/// Engines fold their native position (WAL LSN, binlog sequence and position)
/// into a totally ordered integer.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SourceOffset(pub u64);

impl fmt::Display for SourceOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Latest delivered offset per source partition
///
/// Also records whether the initial snapshot was delivered in full. Until it
/// was, a restart resumes the snapshot from the stored offsets instead of
/// skipping it.
///
/// Serializes as `{"partitions": {"inventory.customers": 100}, "snapshot_complete": true}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionOffsetMap {
    partitions: BTreeMap<SourcePartition, SourceOffset>,
    #[serde(default)]
    snapshot_complete: bool,
}

impl PartitionOffsetMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, partition: &SourcePartition) -> Option<SourceOffset> {
        self.partitions.get(partition).copied()
    }

    /// Raise the offset of `partition` to `offset`.
    ///
    /// Returns `false` and leaves the map untouched when `offset` is not
    /// strictly greater than the tracked one.
    pub fn advance(&mut self, partition: SourcePartition, offset: SourceOffset) -> bool {
        match self.partitions.get_mut(&partition) {
            Some(current) if *current >= offset => false,
            Some(current) => {
                *current = offset;
                true
            }
            None => {
                self.partitions.insert(partition, offset);
                true
            }
        }
    }

    /// Whether an event at `offset` in `partition` was already delivered.
    pub fn covers(&self, partition: &SourcePartition, offset: SourceOffset) -> bool {
        self.get(partition).is_some_and(|current| offset <= current)
    }

    /// Per-partition maximum of `self` and `other`. Snapshot completion is sticky.
    pub fn merge(&mut self, other: &PartitionOffsetMap) {
        for (partition, offset) in other.iter() {
            self.advance(partition.clone(), offset);
        }
        self.snapshot_complete |= other.snapshot_complete;
    }

    pub fn snapshot_complete(&self) -> bool {
        self.snapshot_complete
    }

    /// Record that every snapshot row was delivered.
    pub fn mark_snapshot_complete(&mut self) {
        self.snapshot_complete = true;
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SourcePartition, SourceOffset)> {
        self.partitions.iter().map(|(p, o)| (p, *o))
    }

    /// Number of tracked partitions.
    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    /// No progress of any kind: the cold-start case.
    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty() && !self.snapshot_complete
    }
}

impl FromIterator<(SourcePartition, SourceOffset)> for PartitionOffsetMap {
    fn from_iter<I: IntoIterator<Item = (SourcePartition, SourceOffset)>>(iter: I) -> Self {
        let mut map = PartitionOffsetMap::new();
        for (partition, offset) in iter {
            map.advance(partition, offset);
        }
        map
    }
}
