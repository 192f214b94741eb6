use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use datafusion::arrow::array::{ArrayRef, Int64Array, RecordBatch, StringArray, UInt64Array};
use datafusion::arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use rcdc_core::{
    BatchTx, CheckpointBarrier, ConnectorConfig, EngineSpec, Message, Operator, Record, Source,
};
use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::checkpoint::CheckpointMark;
use crate::engine_jsonl::JsonlEngine;
use crate::offset_store;
use crate::reader::UnboundedSourceReader;

/// Arrow schema of the batches emitted by [`CdcSource`]
///
/// `key` and `value` hold the JSON text of the row key and row image;
/// `value` is null for deletes.
pub fn envelope_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("partition", DataType::Utf8, false),
        Field::new("offset", DataType::UInt64, false),
        Field::new("op", DataType::Utf8, false),
        Field::new("ts_ms", DataType::Int64, false),
        Field::new("key", DataType::Utf8, false),
        Field::new("value", DataType::Utf8, true),
    ]))
}

pub fn records_to_batch(schema: &SchemaRef, records: &[Record]) -> Result<RecordBatch> {
    let partition = StringArray::from_iter_values(records.iter().map(|r| r.partition.as_str()));
    let offset = UInt64Array::from_iter_values(records.iter().map(|r| r.offset.0));
    let op = StringArray::from_iter_values(records.iter().map(|r| r.kind.as_str()));
    let ts = Int64Array::from_iter_values(records.iter().map(|r| r.timestamp_ms));
    let key = StringArray::from_iter_values(records.iter().map(|r| r.key.to_string()));
    let value: StringArray = records
        .iter()
        .map(|r| r.value.as_ref().map(|v| v.to_string()))
        .collect();

    let columns: Vec<ArrayRef> = vec![
        Arc::new(partition),
        Arc::new(offset),
        Arc::new(op),
        Arc::new(ts),
        Arc::new(key),
        Arc::new(value),
    ];
    Ok(RecordBatch::try_new(schema.clone(), columns)?)
}

/// A checkpoint waiting for the sink to acknowledge its barrier
struct AwaitingAck {
    checkpoint_id: u64,
    mark: CheckpointMark,
    acked: oneshot::Receiver<u64>,
}

/// Change-data-capture source operator for the pipeline
///
/// Drives an [`UnboundedSourceReader`] and packs surfaced records into Arrow
/// batches. Every `checkpoint_every_batches` batches it sends a
/// [`CheckpointBarrier`] and takes a checkpoint mark. The mark is finalized
/// only after the sink acknowledges that barrier, so batches still in flight
/// when the process dies are replayed on restart.
pub struct CdcSource {
    pub id: String,
    pub schema: SchemaRef,
    reader: UnboundedSourceReader,
    next_checkpoint_id: u64,
    awaiting: VecDeque<AwaitingAck>,
}

impl CdcSource {
    pub fn new(reader: UnboundedSourceReader) -> Self {
        Self {
            id: reader.config().id.clone(),
            schema: envelope_schema(),
            reader,
            next_checkpoint_id: 0,
            awaiting: VecDeque::new(),
        }
    }

    /// Build the reader, its engine, and its offset store from configuration.
    pub fn try_new(config: ConnectorConfig) -> Result<Self> {
        config.validate()?;
        let engine = match &config.engine {
            EngineSpec::Jsonl { dir } => Box::new(JsonlEngine::new(PathBuf::from(dir))),
            EngineSpec::Memory => {
                bail!("connector {}: the memory engine must be supplied programmatically", config.id)
            }
        };
        let store = offset_store::from_spec(&config.offset_store)?;
        Ok(Self::new(UnboundedSourceReader::new(config, engine, store)))
    }

    /// Send `pending` downstream and place a barrier when one is due.
    ///
    /// Returns `false` when the downstream channel is gone.
    async fn flush(
        &mut self,
        tx: &BatchTx,
        pending: &mut Vec<Record>,
        batches_since_barrier: &mut usize,
    ) -> Result<bool> {
        if pending.is_empty() {
            return Ok(true);
        }
        let batch = records_to_batch(&self.schema, pending)?;
        info!(source = %self.id, rows = batch.num_rows(), "emitting batch");
        if tx.send(Message::Batch(batch)).await.is_err() {
            return Ok(false);
        }
        pending.clear();
        if let Some(watermark) = self.reader.watermark() {
            if tx.send(Message::Watermark(watermark)).await.is_err() {
                return Ok(false);
            }
        }

        *batches_since_barrier += 1;
        if *batches_since_barrier >= self.reader.config().checkpoint_every_batches {
            *batches_since_barrier = 0;
            return self.send_barrier(tx).await;
        }
        Ok(true)
    }

    async fn send_barrier(&mut self, tx: &BatchTx) -> Result<bool> {
        let mark = self.reader.checkpoint_mark()?;
        let checkpoint_id = self.next_checkpoint_id;
        self.next_checkpoint_id += 1;
        let (barrier, acked) = CheckpointBarrier::new(checkpoint_id);
        if tx.send(Message::Barrier(barrier)).await.is_err() {
            return Ok(false);
        }
        debug!(source = %self.id, checkpoint_id, "barrier sent");
        self.awaiting.push_back(AwaitingAck {
            checkpoint_id,
            mark,
            acked,
        });
        Ok(true)
    }

    /// Finalize the newest checkpoint whose barrier was acknowledged, without waiting.
    async fn settle_acked(&mut self) {
        let mut ready = None;
        while let Some(front) = self.awaiting.front_mut() {
            match front.acked.try_recv() {
                Ok(_) => ready = self.awaiting.pop_front().map(|a| a.mark),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Closed) => {
                    warn!(source = %self.id, checkpoint_id = front.checkpoint_id, "barrier dropped without ack");
                    self.awaiting.pop_front();
                }
            }
        }
        if let Some(mark) = ready {
            self.finalize(mark).await;
        }
    }

    /// Wait for every outstanding barrier, then finalize the newest acknowledged one.
    async fn await_acks(&mut self) {
        let mut ready = None;
        while let Some(awaiting) = self.awaiting.pop_front() {
            match awaiting.acked.await {
                Ok(_) => ready = Some(awaiting.mark),
                Err(_) => {
                    warn!(source = %self.id, checkpoint_id = awaiting.checkpoint_id, "barrier dropped without ack")
                }
            }
        }
        if let Some(mark) = ready {
            self.finalize(mark).await;
        }
    }

    async fn finalize(&self, mark: CheckpointMark) {
        if let Err(e) = mark.finalize_checkpoint().await {
            // records since the last good commit are replayed on restart
            warn!(source = %self.id, error = %e, "checkpoint not committed");
        }
    }

    async fn drive(&mut self, tx: &BatchTx, cancel: &CancellationToken) -> Result<()> {
        let batch_rows = self.reader.config().batch_rows;
        let mut pending: Vec<Record> = Vec::with_capacity(batch_rows);
        let mut batches_since_barrier = 0usize;

        while !cancel.is_cancelled() {
            self.settle_acked().await;
            if self.reader.advance().await? {
                pending.push(self.reader.current_record()?.clone());
                if pending.len() < batch_rows {
                    continue;
                }
            } else if (self.reader.is_finished() || self.reader.is_interrupted()) && pending.is_empty() {
                break;
            }
            if !self.flush(tx, &mut pending, &mut batches_since_barrier).await? {
                warn!(source = %self.id, "downstream closed, stopping source");
                return Ok(());
            }
        }

        if self.flush(tx, &mut pending, &mut batches_since_barrier).await? && batches_since_barrier > 0 {
            self.send_barrier(tx).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Operator for CdcSource {
    fn name(&self) -> &str {
        &self.id
    }

    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }
}

#[async_trait]
impl Source for CdcSource {
    async fn run(&mut self, tx: BatchTx, cancel: CancellationToken) -> Result<()> {
        self.reader.start().await?;
        let outcome = self.drive(&tx, &cancel).await;
        self.await_acks().await;
        self.reader.close().await;
        let _ = tx.send(Message::Eos).await; // best-effort
        outcome
    }
}
