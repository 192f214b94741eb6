//! Pull-facing reader driven by the pipeline.
//!
//! State machine:
//!
//! ```text
//! Created ──start()──▶ Started ──advance()──▶ Polling ⇄ Advanced ──checkpoint_mark()──▶ Checkpointed
//!                         │                        │                                        │
//!                         └───── fatal fault ──────┴──────────────▶ Failed ◀────────────────┘
//!                                                                      │
//!                      any state ─────────────── close() ──────────────┴──▶ Closed
//! ```

use std::sync::Arc;
use std::time::Instant;

use rcdc_core::{
    CdcError, ChangeEngine, ConnectorConfig, OffsetStore, PartitionOffsetMap, Record,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::checkpoint::CheckpointMark;
use crate::engine_adapter::{EngineAdapter, Polled};
use crate::record_mapper::RecordMapper;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    Created,
    Started,
    /// Last advance found nothing to surface
    Polling,
    /// Last advance surfaced a record
    Advanced,
    Checkpointed,
    Failed,
    Closed,
}

pub struct UnboundedSourceReader {
    config: Arc<ConnectorConfig>,
    store: Arc<dyn OffsetStore>,
    adapter: EngineAdapter,
    mapper: RecordMapper,
    offsets: PartitionOffsetMap,
    resume_from: Option<PartitionOffsetMap>,
    current: Option<Record>,
    watermark: Option<i64>,
    finished: bool,
    interrupted: bool,
    state: ReaderState,
}

impl UnboundedSourceReader {
    pub fn new(
        config: ConnectorConfig,
        engine: Box<dyn ChangeEngine>,
        store: Arc<dyn OffsetStore>,
    ) -> Self {
        let config = Arc::new(config);
        Self {
            adapter: EngineAdapter::new(engine, config.clone()),
            mapper: RecordMapper::new(config.schema_changes),
            config,
            store,
            offsets: PartitionOffsetMap::new(),
            resume_from: None,
            current: None,
            watermark: None,
            finished: false,
            interrupted: false,
            state: ReaderState::Created,
        }
    }

    /// Resume from a mark held by the pipeline framework as well as from the store.
    /// Each partition starts at the later of the two positions.
    pub fn with_checkpoint(mut self, offsets: PartitionOffsetMap) -> Self {
        self.resume_from = Some(offsets);
        self
    }

    pub async fn start(&mut self) -> Result<(), CdcError> {
        if self.state != ReaderState::Created {
            return Err(CdcError::Usage("start() may only be called once"));
        }
        if let Err(e) = self.config.validate() {
            self.state = ReaderState::Failed;
            return Err(e);
        }

        let mut initial = match self.store.load(&self.config.id).await {
            Ok(offsets) => offsets,
            Err(e) => {
                error!(connector = %self.config.id, error = %e, "could not load offsets");
                self.state = ReaderState::Failed;
                return Err(e.into());
            }
        };
        if let Some(mark) = &self.resume_from {
            initial.merge(mark);
        }

        if let Err(e) = self.adapter.start(&initial).await {
            self.state = ReaderState::Failed;
            return Err(e);
        }
        info!(
            connector = %self.config.id,
            restored_partitions = initial.len(),
            cold_start = initial.is_empty(),
            snapshot_complete = initial.snapshot_complete(),
            "reader started"
        );
        self.offsets = initial;
        self.state = ReaderState::Started;
        Ok(())
    }

    /// Try to surface the next record within `advance_timeout_ms`.
    ///
    /// `Ok(false)` means nothing is available right now; call again later.
    /// Events at or before the tracked offset of their partition are dropped,
    /// and filtered events still move the offset forward.
    pub async fn advance(&mut self) -> Result<bool, CdcError> {
        match self.state {
            ReaderState::Created => return Err(CdcError::Usage("advance() called before start()")),
            ReaderState::Failed => return Err(CdcError::Usage("advance() called on a failed reader")),
            ReaderState::Closed => return Err(CdcError::Usage("advance() called on a closed reader")),
            _ => {}
        }
        self.current = None;
        let deadline = Instant::now() + self.config.advance_timeout();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let polled = match self.adapter.poll(remaining).await {
                Ok(polled) => polled,
                Err(e) => return Err(self.fail(e)),
            };

            let event = match polled {
                Polled::Event(event) => event,
                Polled::Timeout => {
                    self.state = ReaderState::Polling;
                    return Ok(false);
                }
                Polled::SnapshotComplete => {
                    info!(connector = %self.config.id, "initial snapshot delivered");
                    self.offsets.mark_snapshot_complete();
                    continue;
                }
                Polled::Finished => {
                    self.finished = true;
                    self.state = ReaderState::Polling;
                    return Ok(false);
                }
                Polled::Stopped => {
                    self.interrupted = true;
                    self.state = ReaderState::Polling;
                    return Ok(false);
                }
            };

            if self.offsets.covers(&event.partition, event.offset) {
                debug!(
                    partition = %event.partition,
                    offset = %event.offset,
                    "skipping already delivered event"
                );
                continue;
            }

            let mapped = match self.mapper.map(&event) {
                Ok(mapped) => mapped,
                Err(e) => return Err(self.fail(e)),
            };
            self.offsets.advance(event.partition.clone(), event.offset);

            match mapped {
                Some(record) => {
                    self.watermark = Some(self.watermark.map_or(record.timestamp_ms, |w| {
                        w.max(record.timestamp_ms)
                    }));
                    self.current = Some(record);
                    self.state = ReaderState::Advanced;
                    return Ok(true);
                }
                None => {
                    debug!(
                        partition = %event.partition,
                        offset = %event.offset,
                        op = %event.operation,
                        "event filtered from record stream"
                    );
                }
            }
        }
    }

    fn fail(&mut self, e: CdcError) -> CdcError {
        error!(connector = %self.config.id, error = %e, "reader failed");
        self.current = None;
        self.state = ReaderState::Failed;
        e
    }

    /// The record surfaced by the last successful `advance()`.
    pub fn current_record(&self) -> Result<&Record, CdcError> {
        self.current
            .as_ref()
            .ok_or(CdcError::Usage("no current record; advance() has not returned true"))
    }

    pub fn current_timestamp(&self) -> Result<i64, CdcError> {
        self.current_record().map(|r| r.timestamp_ms)
    }

    /// Highest event timestamp surfaced so far.
    pub fn watermark(&self) -> Option<i64> {
        self.watermark
    }

    /// Snapshot the offsets of every record surfaced so far.
    pub fn checkpoint_mark(&mut self) -> Result<CheckpointMark, CdcError> {
        match self.state {
            ReaderState::Created => return Err(CdcError::Usage("checkpoint requested before start()")),
            ReaderState::Failed => return Err(CdcError::Usage("checkpoint requested on a failed reader")),
            ReaderState::Closed => return Err(CdcError::Usage("checkpoint requested on a closed reader")),
            _ => {}
        }
        self.state = ReaderState::Checkpointed;
        debug!(connector = %self.config.id, partitions = self.offsets.len(), "checkpoint mark taken");
        Ok(CheckpointMark::new(
            self.config.id.clone(),
            self.offsets.clone(),
            self.store.clone(),
        ))
    }

    /// Stop the engine and release the queue. Safe to call repeatedly and
    /// from any state, including after a failure.
    pub async fn close(&mut self) {
        if self.state == ReaderState::Closed {
            return;
        }
        self.adapter.stop().await;
        self.current = None;
        self.state = ReaderState::Closed;
        info!(connector = %self.config.id, "reader closed");
    }

    /// Whether the engine ended on its own; no further records will arrive.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Whether the shutdown handle stopped the engine before it finished.
    pub fn is_interrupted(&self) -> bool {
        self.interrupted
    }

    pub fn state(&self) -> ReaderState {
        self.state
    }

    pub fn offsets(&self) -> &PartitionOffsetMap {
        &self.offsets
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    /// Cancelling the returned token interrupts an in-flight `advance()`,
    /// which then returns `Ok(false)`; `close()` is still required.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.adapter.shutdown_handle()
    }
}
