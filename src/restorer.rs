//! Periodic snapshot persistence for memory-based storage.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::metrics::ServerMetrics;
use crate::storage::file::write_snapshot;
use crate::storage::{Storage, StorageError};

const EMPTY_SNAPSHOT: &[u8] = br#"{"GaugeMetrics":{},"CounterMetrics":{}}"#;

pub struct Restorer {
    storage: Arc<dyn Storage>,
    path: PathBuf,
    interval: Duration,
    metrics: Option<ServerMetrics>,
}

impl Restorer {
    pub fn new(storage: Arc<dyn Storage>, path: PathBuf, interval: Duration) -> Self {
        Self {
            storage,
            path,
            interval,
            metrics: None,
        }
    }

    /// Records dump counts and durations in the collector registry.
    pub fn with_metrics(mut self, metrics: ServerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the snapshot file into storage at startup.
    ///
    /// A missing file is created empty. An unreadable or corrupt file is
    /// logged and the store starts empty.
    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub async fn load(&self) -> Result<(), StorageError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No snapshot file, creating an empty one");
                write_snapshot(&self.path, EMPTY_SNAPSHOT).await?;
                return Ok(());
            }
            Err(e) => {
                warn!(error = %e, "Snapshot file unreadable, starting empty");
                return Ok(());
            }
        };

        match self.storage.restore(&bytes).await {
            Ok(()) => {
                let restored = self.storage.list_all().await.map(|s| s.len()).unwrap_or(0);
                info!(series = restored, "Snapshot restored");
                Ok(())
            }
            Err(e @ StorageError::Unsupported(_)) => Err(e),
            Err(e) => {
                warn!(error = %e, "Snapshot file corrupt, starting empty");
                Ok(())
            }
        }
    }

    /// Writes one snapshot of the current storage contents.
    pub async fn dump(&self) -> Result<(), StorageError> {
        let start = Instant::now();
        let bytes = self.storage.snapshot_bytes().await?;
        write_snapshot(&self.path, &bytes).await?;

        let elapsed = start.elapsed().as_secs_f64();
        if let Some(m) = &self.metrics {
            m.snapshot_dumps.inc();
            m.snapshot_duration.set(elapsed);
        }
        debug!(bytes = bytes.len(), elapsed, "Snapshot dumped");
        Ok(())
    }

    /// Dumps every `interval` until `shutdown` fires, then dumps once more.
    ///
    /// A failed periodic dump is logged and the next tick tries again.
    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub async fn run(self, shutdown: CancellationToken) {
        if self.interval.is_zero() {
            shutdown.cancelled().await;
        } else {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            info!(interval = ?self.interval, "Snapshot restorer started");

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.dump().await {
                            error!(error = %e, "Periodic snapshot dump failed");
                        }
                    }
                }
            }
        }

        match self.dump().await {
            Ok(()) => info!("Final snapshot written"),
            Err(e) => error!(error = %e, "Final snapshot dump failed"),
        }
    }
}
