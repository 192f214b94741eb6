//! # RCDC Core - Rust Change Data Capture Core Library
//!
//! This crate provides the foundational types, traits, and abstractions for exposing
//! database change streams as a checkpointed, unbounded pipeline source. It defines
//! the change event and record model, per-partition offset bookkeeping, the seams
//! towards the embedded capture engine and the offset store, and the pipeline
//! operator interfaces the source plugs into.
//!
//! ## Key Components
//!
//! - **Change Model**: [`ChangeEvent`] as produced by an engine and [`Record`] as seen downstream
//! - **Offsets**: [`PartitionOffsetMap`] tracking the last delivered position per source partition
//! - **Engine Seam**: [`ChangeEngine`] and the [`EngineCallback`] it pushes batches through
//! - **Offset Store Seam**: [`OffsetStore`] for durable restart positions
//! - **Operator Traits**: Source and Sink abstractions for building pipelines
//! - **Configuration**: YAML-based pipeline and connector specification
//! - **Error Handling**: [`CdcError`] separating data-path, checkpoint, and usage faults
//!
//! ## Example Usage
//!
//! ```rust
//! use rcdc_core::{PartitionOffsetMap, SourceOffset, SourcePartition};
//!
//! let mut offsets = PartitionOffsetMap::new();
//! assert!(offsets.advance(SourcePartition::from("inventory.customers"), SourceOffset(100)));
//! // offsets never move backwards
//! assert!(!offsets.advance(SourcePartition::from("inventory.customers"), SourceOffset(90)));
//! ```

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use datafusion::arrow::array::RecordBatch;
use datafusion::arrow::datatypes::SchemaRef;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

pub mod config;
pub mod engine;
pub mod event;
pub mod offset;

pub use config::{
    BackpressureMode, ConnectorConfig, DatabaseSpec, EngineSpec, OffsetStoreSpec,
    SchemaChangePolicy, SnapshotMode,
};
pub use engine::{ChangeEngine, EngineCallback, EngineEvent, Liveness};
pub use event::{ChangeEvent, Operation, Record, RecordId, RecordKind};
pub use offset::{PartitionOffsetMap, SourceOffset, SourcePartition};

/// Type alias for Apache Arrow RecordBatch, representing a batch of columnar data
pub type Batch = RecordBatch;

/// Type alias for the sender side of a message channel between pipeline operators
pub type BatchTx = mpsc::Sender<Message>;

/// Type alias for the receiver side of a message channel between pipeline operators
pub type BatchRx = mpsc::Receiver<Message>;

/// Messages passed between pipeline operators
#[derive(Debug)]
pub enum Message {
    /// A batch of change records in Apache Arrow format
    Batch(Batch),

    /// A watermark indicating event time progress
    ///
    /// The i64 value is the highest event timestamp surfaced so far,
    /// in epoch milliseconds.
    Watermark(i64),

    /// Checkpoint barrier, to be acknowledged once every earlier batch is handled
    Barrier(CheckpointBarrier),

    /// End-of-stream marker
    ///
    /// Sent when the source stops producing, either because the engine
    /// finished or because the pipeline was cancelled.
    Eos,
}

/// Request to acknowledge everything sent before it
///
/// A source places a barrier behind the batches a checkpoint covers and commits
/// that checkpoint only once the barrier is acknowledged. Sinks acknowledge after
/// every batch received ahead of the barrier is written out. A barrier dropped
/// without acknowledgement leaves its checkpoint uncommitted, so those batches
/// are replayed after a restart.
#[derive(Debug)]
pub struct CheckpointBarrier {
    pub checkpoint_id: u64,
    ack: oneshot::Sender<u64>,
}

impl CheckpointBarrier {
    /// A barrier and the receiver its acknowledgement arrives on.
    pub fn new(checkpoint_id: u64) -> (Self, oneshot::Receiver<u64>) {
        let (ack, acked) = oneshot::channel();
        (Self { checkpoint_id, ack }, acked)
    }

    pub fn ack(self) {
        // the source may already be gone; nothing is left to commit then
        let _ = self.ack.send(self.checkpoint_id);
    }
}

/// Errors raised by the offset store
///
/// Commit failures are reported to the caller and never retried inside the store.
#[derive(Debug, thiserror::Error)]
pub enum OffsetStoreError {
    /// Filesystem or other I/O failure while reading or writing offsets
    #[error("offset store I/O: {0}")]
    Io(#[from] std::io::Error),

    /// The persisted document could not be encoded or decoded
    #[error("offset store codec: {0}")]
    Codec(#[from] serde_json::Error),

    /// The backing store refused the operation
    #[error("offset store unavailable: {0}")]
    Unavailable(String),
}

/// Error types for change-data-capture source operations
///
/// Variants fall into three families: data-path faults (see [`CdcError::is_fatal`])
/// that abort the reader task, checkpoint-commit faults that leave the reader
/// running, and usage faults that signal a broken calling contract.
#[derive(Debug, thiserror::Error)]
pub enum CdcError {
    /// The engine could not be opened (bad configuration, unreachable database)
    #[error("engine failed to start: {0}")]
    StartFailed(String),

    /// The engine hit an unrecoverable fault while streaming
    #[error("fatal engine fault: {0}")]
    Fatal(String),

    /// Neither events nor heartbeats arrived within the configured window
    #[error("no events or heartbeats for {0:?}")]
    StaleConnection(Duration),

    /// A batch was rejected because the change queue had no room for it
    #[error("change queue is full")]
    QueueFull,

    /// Delivery was interrupted because the adapter is stopping
    #[error("delivery cancelled by shutdown")]
    Cancelled,

    /// Loading or committing offsets failed
    #[error(transparent)]
    OffsetStore(#[from] OffsetStoreError),

    /// A method was called in a state where it is not allowed
    #[error("usage error: {0}")]
    Usage(&'static str),

    /// The connector configuration is not acceptable
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Channel communication error
    ///
    /// Occurs when a queue between the engine and the reader, or between
    /// pipeline operators, is unexpectedly closed.
    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CdcError {
    /// Whether this error terminates the reader task.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CdcError::StartFailed(_)
                | CdcError::Fatal(_)
                | CdcError::StaleConnection(_)
                | CdcError::ChannelClosed(_)
        )
    }

    pub fn is_usage(&self) -> bool {
        matches!(self, CdcError::Usage(_))
    }
}

/// Result alias used across the crate family
pub type CdcResult<T> = std::result::Result<T, CdcError>;

/// Durable mapping from connector id to its last committed partition offsets
///
/// Implementations must make `commit` atomic with respect to concurrent `load`
/// calls for the same connector id, and serialize concurrent commits for the
/// same connector id. A connector id that was never written loads as an empty map.
#[async_trait]
pub trait OffsetStore: Send + Sync {
    /// Load the committed offsets for `connector_id`; empty on cold start.
    async fn load(&self, connector_id: &str)
        -> std::result::Result<PartitionOffsetMap, OffsetStoreError>;

    /// Persist `offsets` for `connector_id`.
    ///
    /// Stored positions only move forward: each partition keeps the maximum of
    /// the stored and the committed offset.
    async fn commit(
        &self,
        connector_id: &str,
        offsets: &PartitionOffsetMap,
    ) -> std::result::Result<(), OffsetStoreError>;
}

/// Base trait for all pipeline operators
#[async_trait]
pub trait Operator: Send + Sync {
    /// Returns the unique name/identifier of this operator
    fn name(&self) -> &str;

    /// Returns the output schema of this operator
    fn schema(&self) -> SchemaRef;
}

/// Trait for data source operators
///
/// Sources are the entry points of data pipelines, responsible for ingesting data
/// from external systems and converting it into the internal message format.
#[async_trait]
pub trait Source: Operator {
    /// Run the source operator
    ///
    /// # Arguments
    /// * `tx` - Channel sender for publishing messages to downstream operators
    /// * `cancel` - Cancellation token for graceful shutdown
    async fn run(&mut self, tx: BatchTx, cancel: CancellationToken) -> Result<()>;
}

/// Trait for data sink operators
///
/// Sinks are the exit points of data pipelines, responsible for writing processed
/// data to external storage systems or endpoints.
#[async_trait]
pub trait Sink: Operator {
    /// Run the sink operator
    ///
    /// Every [`Message::Barrier`] must be acknowledged only after the batches
    /// received before it are handled.
    ///
    /// # Arguments
    /// * `rx` - Channel receiver for consuming input messages
    /// * `cancel` - Cancellation token for graceful shutdown
    async fn run(&mut self, rx: BatchRx, cancel: CancellationToken) -> Result<()>;
}

/// Complete pipeline specification loaded from YAML configuration
///
/// # Example YAML Configuration
///
/// ```yaml
/// name: "inventory-cdc"
/// sources:
///   - type: cdc
///     id: "db1"
///     engine:
///       type: jsonl
///       dir: "./changelog"
///     include: ["inventory.*"]
///     offset_store:
///       type: file
///       dir: "./offsets"
/// sinks:
///   - type: stdout
///     id: "console"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSpec {
    /// Human-readable name of the pipeline
    pub name: String,

    /// List of data source specifications
    pub sources: Vec<SourceSpec>,

    /// List of data sink specifications
    pub sinks: Vec<SinkSpec>,
}

impl PipelineSpec {
    /// Parse a pipeline from YAML text.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SourceSpec {
    #[serde(rename = "cdc")]
    Cdc(ConnectorConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SinkSpec {
    #[serde(rename = "stdout")]
    Stdout { id: String },
}
