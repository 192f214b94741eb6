//! The seam towards the embedded change-capture engine.
//!
//! An engine is push-driven: once running it hands decoded batches to an
//! [`EngineCallback`]. The callback owns the producing half of the bounded
//! queue that the reader drains, so backpressure from a slow reader reaches
//! the engine as a pending `deliver` call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use crate::config::{BackpressureMode, ConnectorConfig};
use crate::event::ChangeEvent;
use crate::offset::PartitionOffsetMap;
use crate::CdcError;

/// An embedded change-capture engine
///
/// `open` runs on the caller's task and reports connection or configuration
/// problems as [`CdcError::StartFailed`]. `run` is then moved to a background
/// task and pushes batches until it is cancelled through the callback, runs out
/// of input, or fails. Transient faults are the engine's own business to retry;
/// an `Err` from `run` is terminal.
#[async_trait]
pub trait ChangeEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Prepare to stream from `initial_offsets` onwards; an empty map means
    /// a cold start, where the engine snapshots if `config.snapshot_mode` asks for it.
    async fn open(
        &mut self,
        config: &ConnectorConfig,
        initial_offsets: &PartitionOffsetMap,
    ) -> Result<(), CdcError>;

    async fn run(&mut self, callback: EngineCallback) -> Result<(), CdcError>;
}

/// Item on the queue between the engine and the reader
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Change(ChangeEvent),
    /// Every snapshot row was enqueued ahead of this marker
    SnapshotComplete,
}

/// Last time the engine showed signs of life
#[derive(Debug)]
pub struct Liveness {
    origin: Instant,
    last_ms: AtomicU64,
}

impl Liveness {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    pub fn touch(&self) {
        let elapsed = self.origin.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(elapsed, Ordering::AcqRel);
    }

    /// Time since the last event or heartbeat.
    pub fn idle_for(&self) -> Duration {
        let now = self.origin.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_ms.load(Ordering::Acquire)))
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle through which a running engine pushes change batches
///
/// Not `Clone`: the queue has exactly one producer.
pub struct EngineCallback {
    tx: mpsc::Sender<EngineEvent>,
    mode: BackpressureMode,
    liveness: Arc<Liveness>,
    cancel: CancellationToken,
}

impl EngineCallback {
    pub fn new(
        tx: mpsc::Sender<EngineEvent>,
        mode: BackpressureMode,
        liveness: Arc<Liveness>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            tx,
            mode,
            liveness,
            cancel,
        }
    }

    /// Enqueue a batch in order.
    ///
    /// In [`BackpressureMode::Block`] this waits for room event by event and
    /// fails with [`CdcError::Cancelled`] if shutdown starts while waiting.
    /// In [`BackpressureMode::Reject`] the whole batch is refused with
    /// [`CdcError::QueueFull`] unless it fits entirely.
    pub async fn deliver(&self, batch: Vec<ChangeEvent>) -> Result<(), CdcError> {
        self.enqueue(batch.into_iter().map(EngineEvent::Change).collect()).await
    }

    /// Mark the end of the initial snapshot. Must follow the last snapshot row.
    pub async fn snapshot_complete(&self) -> Result<(), CdcError> {
        self.enqueue(vec![EngineEvent::SnapshotComplete]).await
    }

    async fn enqueue(&self, items: Vec<EngineEvent>) -> Result<(), CdcError> {
        if self.cancel.is_cancelled() {
            return Err(CdcError::Cancelled);
        }
        match self.mode {
            BackpressureMode::Block => {
                for item in items {
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return Err(CdcError::Cancelled),
                        sent = self.tx.send(item) => {
                            sent.map_err(|_| CdcError::ChannelClosed("change queue"))?;
                        }
                    }
                    self.liveness.touch();
                }
            }
            BackpressureMode::Reject => {
                // single producer: free capacity can only grow until we send
                if self.tx.capacity() < items.len() {
                    return Err(CdcError::QueueFull);
                }
                for item in items {
                    self.tx.try_send(item).map_err(|e| match e {
                        TrySendError::Full(_) => CdcError::QueueFull,
                        TrySendError::Closed(_) => CdcError::ChannelClosed("change queue"),
                    })?;
                }
                self.liveness.touch();
            }
        }
        Ok(())
    }

    /// Signal liveness without data.
    pub fn heartbeat(&self) {
        self.liveness.touch();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the adapter asks the engine to stop.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}
