//! Connector configuration as loaded from the pipeline YAML.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::offset::SourcePartition;
use crate::CdcError;

/// Configuration of one change-data-capture connector
///
/// Resolved once before the reader starts and never mutated afterwards;
/// the reader shares it behind an `Arc`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// Connector id, also the key under which offsets are stored
    pub id: String,

    /// Which embedded engine produces the change events
    pub engine: EngineSpec,

    /// Connection parameters, passed through to the engine untouched
    #[serde(default)]
    pub database: DatabaseSpec,

    /// Allow-list of partitions, either exact (`inventory.customers`)
    /// or database wildcards (`inventory.*`). Empty means everything.
    #[serde(default)]
    pub include: Vec<String>,

    /// Whether a cold start takes a full snapshot first
    #[serde(default)]
    pub snapshot_mode: SnapshotMode,

    /// How often the engine polls its source, in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Capacity of the queue between engine and reader
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// What the producing side does when the queue is full
    #[serde(default)]
    pub backpressure: BackpressureMode,

    /// Bounded wait of a single `advance()` call, in milliseconds
    #[serde(default = "default_advance_timeout_ms")]
    pub advance_timeout_ms: u64,

    /// Silence window after which the connection is declared dead.
    /// `0` disables the check.
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,

    /// Treatment of schema-change events, applied to every table alike
    #[serde(default)]
    pub schema_changes: SchemaChangePolicy,

    /// Where committed offsets live
    #[serde(default)]
    pub offset_store: OffsetStoreSpec,

    /// Records per emitted Arrow batch
    #[serde(default = "default_batch_rows")]
    pub batch_rows: usize,

    /// Emitted batches between two checkpoint commits
    #[serde(default = "default_checkpoint_every_batches")]
    pub checkpoint_every_batches: usize,
}

impl ConnectorConfig {
    /// A configuration with every optional setting at its default.
    pub fn new(id: impl Into<String>, engine: EngineSpec) -> Self {
        Self {
            id: id.into(),
            engine,
            database: DatabaseSpec::default(),
            include: Vec::new(),
            snapshot_mode: SnapshotMode::default(),
            poll_interval_ms: default_poll_interval_ms(),
            queue_capacity: default_queue_capacity(),
            backpressure: BackpressureMode::default(),
            advance_timeout_ms: default_advance_timeout_ms(),
            stale_after_ms: default_stale_after_ms(),
            schema_changes: SchemaChangePolicy::default(),
            offset_store: OffsetStoreSpec::default(),
            batch_rows: default_batch_rows(),
            checkpoint_every_batches: default_checkpoint_every_batches(),
        }
    }

    pub fn validate(&self) -> Result<(), CdcError> {
        if self.id.trim().is_empty() {
            return Err(CdcError::InvalidConfig("connector id must not be empty".into()));
        }
        if self.queue_capacity == 0 {
            return Err(CdcError::InvalidConfig("queue_capacity must be at least 1".into()));
        }
        if self.batch_rows == 0 {
            return Err(CdcError::InvalidConfig("batch_rows must be at least 1".into()));
        }
        if self.checkpoint_every_batches == 0 {
            return Err(CdcError::InvalidConfig(
                "checkpoint_every_batches must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Whether `partition` passes the allow-list.
    pub fn includes(&self, partition: &SourcePartition) -> bool {
        if self.include.is_empty() {
            return true;
        }
        let name = partition.as_str();
        self.include.iter().any(|pattern| match pattern.strip_suffix(".*") {
            Some(database) => name
                .strip_prefix(database)
                .is_some_and(|rest| rest.starts_with('.')),
            None => pattern == name,
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn advance_timeout(&self) -> Duration {
        Duration::from_millis(self.advance_timeout_ms)
    }

    pub fn stale_after(&self) -> Option<Duration> {
        (self.stale_after_ms > 0).then(|| Duration::from_millis(self.stale_after_ms))
    }
}

/// Engine selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EngineSpec {
    /// Decoded change log kept as JSON lines in `dir`
    #[serde(rename = "jsonl")]
    Jsonl { dir: String },
    /// Engine supplied programmatically by the embedding application
    #[serde(rename = "memory")]
    Memory,
}

/// Opaque connection block handed to the engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseSpec {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Engine-specific pass-through settings
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotMode {
    /// Full snapshot when no offsets are stored, then stream
    #[default]
    Initial,
    /// Never snapshot; only stream from the stored offsets onwards
    Never,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressureMode {
    /// Producer waits for room in the queue
    #[default]
    Block,
    /// A batch that does not fit is refused with `QueueFull`
    Reject,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaChangePolicy {
    /// Drop schema-change events from the record stream
    #[default]
    Skip,
    /// Emit them as records of kind `schema_change`
    Forward,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OffsetStoreSpec {
    #[default]
    #[serde(rename = "memory")]
    Memory,
    #[serde(rename = "file")]
    File { dir: String },
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_advance_timeout_ms() -> u64 {
    100
}

fn default_stale_after_ms() -> u64 {
    60_000
}

fn default_batch_rows() -> usize {
    1024
}

fn default_checkpoint_every_batches() -> usize {
    1
}
