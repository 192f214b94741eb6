//! Engine over a directory of already-decoded change events.
//!
//! Layout of the directory:
//!
//! - `snapshot.jsonl`: rows of the initial snapshot, one [`ChangeEvent`] per line
//! - `changes.jsonl`: the live change log, appended to by an external decoder
//!
//! The engine replays the snapshot until a committed checkpoint records it as
//! complete, skipping rows already delivered, then tails the change log
//! every `poll_interval_ms`, heartbeating whenever a poll finds nothing new.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use rcdc_core::{
    CdcError, ChangeEngine, ChangeEvent, ConnectorConfig, EngineCallback, Operation,
    PartitionOffsetMap, SnapshotMode,
};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info};

const SNAPSHOT_FILE: &str = "snapshot.jsonl";
const CHANGES_FILE: &str = "changes.jsonl";
const DELIVERY_BATCH: usize = 256;

pub struct JsonlEngine {
    dir: PathBuf,
    config: Option<ConnectorConfig>,
    resume_from: PartitionOffsetMap,
    take_snapshot: bool,
    /// Byte position of the first unread line in the change log
    position: u64,
    line_no: usize,
}

impl JsonlEngine {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            config: None,
            resume_from: PartitionOffsetMap::new(),
            take_snapshot: false,
            position: 0,
            line_no: 0,
        }
    }

    fn wanted(&self, config: &ConnectorConfig, event: &ChangeEvent) -> bool {
        config.includes(&event.partition) && !self.resume_from.covers(&event.partition, event.offset)
    }

    async fn replay_snapshot(
        &self,
        config: &ConnectorConfig,
        callback: &EngineCallback,
    ) -> Result<(), CdcError> {
        let path = self.dir.join(SNAPSHOT_FILE);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(connector = %config.id, "no snapshot file, streaming changes only");
                return Ok(());
            }
            Err(e) => return Err(CdcError::Fatal(format!("{}: {e}", path.display()))),
        };

        let mut batch = Vec::with_capacity(DELIVERY_BATCH);
        let mut rows = 0usize;
        for (idx, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let mut event = parse_line(SNAPSHOT_FILE, idx + 1, line)?;
            event.operation = Operation::Snapshot;
            if !self.wanted(config, &event) {
                continue;
            }
            batch.push(event);
            rows += 1;
            if batch.len() == DELIVERY_BATCH {
                callback.deliver(std::mem::take(&mut batch)).await?;
            }
        }
        if !batch.is_empty() {
            callback.deliver(batch).await?;
        }
        info!(connector = %config.id, rows, "snapshot complete");
        Ok(())
    }

    /// Read the complete lines appended since the last call.
    async fn read_new_changes(&mut self, config: &ConnectorConfig) -> Result<Vec<ChangeEvent>, CdcError> {
        let path = self.dir.join(CHANGES_FILE);
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CdcError::Fatal(format!("{}: {e}", path.display()))),
        };
        let io_fault = |e: std::io::Error| CdcError::Fatal(format!("{}: {e}", path.display()));

        file.seek(SeekFrom::Start(self.position)).await.map_err(io_fault)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await.map_err(io_fault)?;

        // a trailing partial line is left for the next poll
        let complete = match buf.iter().rposition(|b| *b == b'\n') {
            Some(last) => last + 1,
            None => return Ok(Vec::new()),
        };
        let text = std::str::from_utf8(&buf[..complete])
            .map_err(|e| CdcError::Fatal(format!("{CHANGES_FILE}: {e}")))?;

        let mut events = Vec::new();
        for line in text.lines() {
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            let event = parse_line(CHANGES_FILE, self.line_no, line)?;
            if self.wanted(config, &event) {
                events.push(event);
            }
        }
        self.position += complete as u64;
        Ok(events)
    }
}

fn parse_line(file: &str, line_no: usize, line: &str) -> Result<ChangeEvent, CdcError> {
    serde_json::from_str(line).map_err(|e| CdcError::Fatal(format!("{file}:{line_no}: {e}")))
}

#[async_trait]
impl ChangeEngine for JsonlEngine {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn open(
        &mut self,
        config: &ConnectorConfig,
        initial_offsets: &PartitionOffsetMap,
    ) -> Result<(), CdcError> {
        let meta = tokio::fs::metadata(&self.dir).await.map_err(|e| {
            CdcError::StartFailed(format!("change log directory {}: {e}", self.dir.display()))
        })?;
        if !meta.is_dir() {
            return Err(CdcError::StartFailed(format!(
                "{} is not a directory",
                self.dir.display()
            )));
        }
        self.take_snapshot =
            config.snapshot_mode == SnapshotMode::Initial && !initial_offsets.snapshot_complete();
        self.resume_from = initial_offsets.clone();
        self.config = Some(config.clone());
        info!(
            connector = %config.id,
            dir = %self.dir.display(),
            snapshot = self.take_snapshot,
            "jsonl engine opened"
        );
        Ok(())
    }

    async fn run(&mut self, callback: EngineCallback) -> Result<(), CdcError> {
        let config = self
            .config
            .take()
            .ok_or(CdcError::Usage("jsonl engine run before open"))?;
        let poll_interval = config.poll_interval().max(Duration::from_millis(1));

        if self.take_snapshot {
            match self.replay_snapshot(&config, &callback).await {
                Ok(()) => {}
                Err(CdcError::Cancelled) => return Ok(()),
                Err(e) => return Err(e),
            }
            match callback.snapshot_complete().await {
                Err(CdcError::Cancelled) => return Ok(()),
                other => other?,
            }
        }

        loop {
            if callback.is_cancelled() {
                return Ok(());
            }
            let events = self.read_new_changes(&config).await?;
            if events.is_empty() {
                callback.heartbeat();
            } else {
                debug!(connector = %config.id, events = events.len(), "change log advanced");
                for chunk in events.chunks(DELIVERY_BATCH) {
                    match callback.deliver(chunk.to_vec()).await {
                        Err(CdcError::Cancelled) => return Ok(()),
                        other => other?,
                    }
                }
            }
            tokio::select! {
                _ = callback.cancelled() => return Ok(()),
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }
}
