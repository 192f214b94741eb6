//! Bridge from a push-style [`ChangeEngine`] to pull-style polling.
//!
//! ```text
//!  engine task ──deliver()──▶ [bounded mpsc, queue_capacity] ──poll()──▶ reader
//!       ▲                                                              │
//!       └──────────────── CancellationToken (stop) ◀───────────────────┘
//! ```
//!
//! The adapter owns the engine task, the receiving half of the queue, and the
//! cancellation token. Nothing here is shared with other adapters.

use std::sync::Arc;
use std::time::Duration;

use rcdc_core::{
    CdcError, ChangeEngine, ChangeEvent, ConnectorConfig, EngineCallback, EngineEvent, Liveness,
    PartitionOffsetMap,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcome of a single [`EngineAdapter::poll`]
#[derive(Debug)]
pub enum Polled {
    Event(ChangeEvent),
    /// The engine delivered its whole initial snapshot
    SnapshotComplete,
    /// Nothing arrived within the timeout; the engine is still running
    Timeout,
    /// The engine ran out of input and exited on its own
    Finished,
    /// The adapter was stopped or its shutdown handle cancelled
    Stopped,
}

enum Wake {
    Received(Option<EngineEvent>),
    Cancelled,
    TimedOut,
}

pub struct EngineAdapter {
    config: Arc<ConnectorConfig>,
    engine: Option<Box<dyn ChangeEngine>>,
    rx: Option<mpsc::Receiver<EngineEvent>>,
    worker: Option<JoinHandle<Result<(), CdcError>>>,
    liveness: Arc<Liveness>,
    cancel: CancellationToken,
    finished: bool,
}

impl EngineAdapter {
    pub fn new(engine: Box<dyn ChangeEngine>, config: Arc<ConnectorConfig>) -> Self {
        Self {
            config,
            engine: Some(engine),
            rx: None,
            worker: None,
            liveness: Arc::new(Liveness::new()),
            cancel: CancellationToken::new(),
            finished: false,
        }
    }

    /// Open the engine at `initial_offsets` and launch it in the background.
    ///
    /// Any failure before the engine task exists is reported as
    /// [`CdcError::StartFailed`]; the adapter can still be stopped afterwards.
    pub async fn start(&mut self, initial_offsets: &PartitionOffsetMap) -> Result<(), CdcError> {
        let mut engine = self
            .engine
            .take()
            .ok_or(CdcError::Usage("engine adapter can only be started once"))?;
        let connector = self.config.id.clone();

        if let Err(e) = engine.open(&self.config, initial_offsets).await {
            error!(connector = %connector, engine = engine.name(), error = %e, "engine failed to open");
            return Err(match e {
                CdcError::StartFailed(_) => e,
                other => CdcError::StartFailed(other.to_string()),
            });
        }

        let (tx, rx) = mpsc::channel(self.config.queue_capacity);
        let callback = EngineCallback::new(
            tx,
            self.config.backpressure,
            self.liveness.clone(),
            self.cancel.clone(),
        );
        self.liveness.touch();

        let name = engine.name().to_string();
        info!(
            connector = %connector,
            engine = %name,
            partitions = initial_offsets.len(),
            queue_capacity = self.config.queue_capacity,
            "engine started"
        );
        self.worker = Some(tokio::spawn(async move {
            let result = engine.run(callback).await;
            debug!(connector = %connector, engine = %name, ok = result.is_ok(), "engine task exited");
            result
        }));
        self.rx = Some(rx);
        Ok(())
    }

    /// Wait up to `timeout` for the next event.
    ///
    /// Queued events are handed out before an engine failure is reported.
    /// A failure, or a silence longer than the stale window, stops the adapter
    /// and comes back as a fatal error.
    pub async fn poll(&mut self, timeout: Duration) -> Result<Polled, CdcError> {
        let Some(rx) = self.rx.as_mut() else {
            return Ok(if self.finished { Polled::Finished } else { Polled::Stopped });
        };

        let wake = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Wake::Cancelled,
            received = rx.recv() => Wake::Received(received),
            _ = tokio::time::sleep(timeout) => Wake::TimedOut,
        };

        match wake {
            Wake::Received(Some(EngineEvent::Change(event))) => Ok(Polled::Event(event)),
            Wake::Received(Some(EngineEvent::SnapshotComplete)) => Ok(Polled::SnapshotComplete),
            Wake::Received(None) => self.engine_exited().await,
            Wake::Cancelled => Ok(Polled::Stopped),
            Wake::TimedOut => {
                if let Some(window) = self.config.stale_after() {
                    let idle = self.liveness.idle_for();
                    if idle > window {
                        warn!(
                            connector = %self.config.id,
                            idle_ms = idle.as_millis() as u64,
                            "no events or heartbeats within stale window"
                        );
                        self.stop().await;
                        return Err(CdcError::StaleConnection(idle));
                    }
                }
                Ok(Polled::Timeout)
            }
        }
    }

    async fn engine_exited(&mut self) -> Result<Polled, CdcError> {
        self.rx = None;
        let Some(worker) = self.worker.take() else {
            return Ok(Polled::Stopped);
        };
        match worker.await {
            Ok(Ok(())) if !self.cancel.is_cancelled() => {
                info!(connector = %self.config.id, "engine finished");
                self.finished = true;
                Ok(Polled::Finished)
            }
            Ok(Ok(())) | Ok(Err(CdcError::Cancelled)) => Ok(Polled::Stopped),
            Ok(Err(e)) => {
                error!(connector = %self.config.id, error = %e, "engine failed");
                self.cancel.cancel();
                Err(if e.is_fatal() { e } else { CdcError::Fatal(e.to_string()) })
            }
            Err(join) => {
                error!(connector = %self.config.id, error = %join, "engine task aborted");
                self.cancel.cancel();
                Err(CdcError::Fatal(join.to_string()))
            }
        }
    }

    /// Stop the engine and wait for its task to end.
    ///
    /// Idempotent, and a no-op when the adapter never started.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        // a producer parked on a full queue fails fast once the receiver is gone
        self.rx = None;
        self.engine = None;
        let Some(worker) = self.worker.take() else {
            return;
        };
        match worker.await {
            Ok(Ok(())) | Ok(Err(CdcError::Cancelled)) | Ok(Err(CdcError::ChannelClosed(_))) => {}
            Ok(Err(e)) => warn!(connector = %self.config.id, error = %e, "engine reported an error while stopping"),
            Err(e) => warn!(connector = %self.config.id, error = %e, "engine task did not exit cleanly"),
        }
        info!(connector = %self.config.id, "engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Token that, when cancelled, makes an in-flight `poll` return
    /// [`Polled::Stopped`] and asks the engine to wind down.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for EngineAdapter {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
