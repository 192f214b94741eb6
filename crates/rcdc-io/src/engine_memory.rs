//! Programmatic engine fed from in-memory event lists.
//!
//! Behaves like an embedded capture engine towards the adapter: it honours the
//! snapshot mode, the allow-list, and the resume offsets, delivers in batches,
//! and can emit heartbeats or fail on purpose. Embedders use it to bridge
//! their own change feeds; the test suites use it to script scenarios.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rcdc_core::{
    CdcError, ChangeEngine, ChangeEvent, ConnectorConfig, EngineCallback, Operation,
    PartitionOffsetMap, SnapshotMode,
};
use tracing::{debug, info};

pub struct MemoryEngine {
    snapshot: Vec<ChangeEvent>,
    changes: Vec<ChangeEvent>,
    batch_size: usize,
    heartbeat: Option<Duration>,
    fail_open: Option<String>,
    fail_after: Option<(usize, String)>,
    finish_when_drained: bool,
    ignore_initial_offsets: bool,
    delivered: Arc<AtomicUsize>,
    /// Snapshot rows still to deliver; `None` when no snapshot phase runs
    snapshot_plan: Option<Vec<ChangeEvent>>,
    change_plan: Vec<ChangeEvent>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self {
            snapshot: Vec::new(),
            changes: Vec::new(),
            batch_size: 64,
            heartbeat: None,
            fail_open: None,
            fail_after: None,
            finish_when_drained: false,
            ignore_initial_offsets: false,
            delivered: Arc::new(AtomicUsize::new(0)),
            snapshot_plan: None,
            change_plan: Vec::new(),
        }
    }

    /// Rows emitted before any change when the snapshot mode is `initial`,
    /// until a committed checkpoint records the snapshot as complete.
    /// Their operation is forced to [`Operation::Snapshot`]. Without rows
    /// the engine has no snapshot phase.
    pub fn with_snapshot(mut self, rows: Vec<ChangeEvent>) -> Self {
        self.snapshot = rows
            .into_iter()
            .map(|mut row| {
                row.operation = Operation::Snapshot;
                row
            })
            .collect();
        self
    }

    /// Live changes streamed after the snapshot.
    pub fn with_changes(mut self, changes: Vec<ChangeEvent>) -> Self {
        self.changes = changes;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Heartbeat at `interval` while idle.
    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat = Some(interval);
        self
    }

    pub fn fail_on_open(mut self, message: impl Into<String>) -> Self {
        self.fail_open = Some(message.into());
        self
    }

    /// Fail with a fatal fault once `events` events have been delivered.
    pub fn fail_after(mut self, events: usize, message: impl Into<String>) -> Self {
        self.fail_after = Some((events, message.into()));
        self
    }

    /// End the run once every event is delivered instead of idling until stopped.
    pub fn finish_when_drained(mut self) -> Self {
        self.finish_when_drained = true;
        self
    }

    /// Resume from the start of the change list regardless of stored offsets,
    /// like an engine whose resume granularity is coarser than one event.
    pub fn ignore_initial_offsets(mut self) -> Self {
        self.ignore_initial_offsets = true;
        self
    }

    /// Number of events accepted by the queue so far.
    pub fn delivered_counter(&self) -> Arc<AtomicUsize> {
        self.delivered.clone()
    }

    /// Returns `false` once the callback was cancelled.
    async fn deliver_all(
        &self,
        events: Vec<ChangeEvent>,
        callback: &EngineCallback,
        sent: &mut usize,
    ) -> Result<bool, CdcError> {
        for chunk in events.chunks(self.batch_size) {
            if callback.is_cancelled() {
                return Ok(false);
            }
            match callback.deliver(chunk.to_vec()).await {
                Ok(()) => {}
                Err(CdcError::Cancelled) => return Ok(false),
                Err(e) => return Err(e),
            }
            *sent += chunk.len();
            self.delivered.fetch_add(chunk.len(), Ordering::SeqCst);

            if let Some((limit, message)) = &self.fail_after {
                if *sent >= *limit {
                    return Err(CdcError::Fatal(message.clone()));
                }
            }
        }
        Ok(true)
    }

    async fn idle(&self, callback: &EngineCallback) {
        match self.heartbeat {
            Some(interval) => loop {
                tokio::select! {
                    _ = callback.cancelled() => return,
                    _ = tokio::time::sleep(interval) => callback.heartbeat(),
                }
            },
            None => callback.cancelled().await,
        }
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChangeEngine for MemoryEngine {
    fn name(&self) -> &str {
        "memory"
    }

    async fn open(
        &mut self,
        config: &ConnectorConfig,
        initial_offsets: &PartitionOffsetMap,
    ) -> Result<(), CdcError> {
        if let Some(message) = &self.fail_open {
            return Err(CdcError::StartFailed(message.clone()));
        }

        let take_snapshot = !self.snapshot.is_empty()
            && config.snapshot_mode == SnapshotMode::Initial
            && !initial_offsets.snapshot_complete();
        let resume_from = if self.ignore_initial_offsets {
            PartitionOffsetMap::new()
        } else {
            initial_offsets.clone()
        };
        let wanted = |ev: &&ChangeEvent| {
            config.includes(&ev.partition) && !resume_from.covers(&ev.partition, ev.offset)
        };

        self.snapshot_plan =
            take_snapshot.then(|| self.snapshot.iter().filter(wanted).cloned().collect());
        self.change_plan = self.changes.iter().filter(wanted).cloned().collect();
        let planned = self.change_plan.len() + self.snapshot_plan.as_ref().map_or(0, Vec::len);

        info!(
            connector = %config.id,
            snapshot = take_snapshot,
            planned,
            "memory engine opened"
        );
        Ok(())
    }

    async fn run(&mut self, callback: EngineCallback) -> Result<(), CdcError> {
        let mut sent = 0usize;

        if let Some(rows) = self.snapshot_plan.take() {
            if !self.deliver_all(rows, &callback, &mut sent).await? {
                return Ok(());
            }
            match callback.snapshot_complete().await {
                Err(CdcError::Cancelled) => return Ok(()),
                other => other?,
            }
            debug!(rows = sent, "memory engine finished its snapshot");
        }
        let changes = std::mem::take(&mut self.change_plan);
        if !self.deliver_all(changes, &callback, &mut sent).await? {
            return Ok(());
        }
        debug!(events = sent, "memory engine drained its plan");

        if let Some((_, message)) = &self.fail_after {
            return Err(CdcError::Fatal(message.clone()));
        }
        if !self.finish_when_drained {
            self.idle(&callback).await;
        }
        Ok(())
    }
}
