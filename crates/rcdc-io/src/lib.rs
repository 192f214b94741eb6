//! # RCDC I/O - Change Stream Reader, Offset Stores, and Pipeline Operators
//!
//! This crate turns a push-style change-capture engine into a pull-style,
//! checkpoint-resumable source and plugs it into the pipeline.
//!
//! ## Components
//!
//! - **Offset stores**: in-memory and directory-backed [`OffsetStore`](rcdc_core::OffsetStore)s
//! - **Engine adapter**: runs the engine in the background behind a bounded queue
//! - **Record mapper**: change event to record, deterministic
//! - **Checkpoint mark**: offset snapshot committed on finalize
//! - **Unbounded reader**: start / advance / current record / checkpoint / close
//! - **Engines**: a programmatic in-memory engine and a JSON-lines change-log engine
//! - **Operators**: the CDC pipeline source and a stdout sink
//!
//! ## Delivery
//!
//! Delivery is at-least-once. Offsets only reach the store when a
//! checkpoint mark is finalized, so a crash replays everything after the last
//! finalized mark. Downstream deduplication can key on
//! [`Record::id`](rcdc_core::Record::id).
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rcdc_core::{ConnectorConfig, EngineSpec};
//! use rcdc_io::engine_memory::MemoryEngine;
//! use rcdc_io::offset_store::MemoryOffsetStore;
//! use rcdc_io::reader::UnboundedSourceReader;
//!
//! # async fn example() -> Result<(), rcdc_core::CdcError> {
//! let config = ConnectorConfig::new("db1", EngineSpec::Memory);
//! let store = Arc::new(MemoryOffsetStore::new());
//! let mut reader = UnboundedSourceReader::new(config, Box::new(MemoryEngine::new()), store);
//!
//! reader.start().await?;
//! while reader.advance().await? {
//!     println!("{:?}", reader.current_record()?);
//! }
//! reader.checkpoint_mark()?.finalize_checkpoint().await?;
//! reader.close().await;
//! # Ok(())
//! # }
//! ```

/// Durable restart positions
pub mod offset_store;

/// Background engine lifecycle and bounded queue
pub mod engine_adapter;

/// Change event to record mapping
pub mod record_mapper;

/// Checkpoint marks and their finalization
pub mod checkpoint;

/// Pull-facing reader
pub mod reader;

/// In-memory engine
pub mod engine_memory;

/// JSON-lines change-log engine
pub mod engine_jsonl;

/// CDC pipeline source
pub mod source_cdc;

/// Standard output sink for debugging
pub mod sink_stdout;

pub use checkpoint::CheckpointMark;
pub use engine_adapter::{EngineAdapter, Polled};
pub use reader::{ReaderState, UnboundedSourceReader};
pub use record_mapper::RecordMapper;
