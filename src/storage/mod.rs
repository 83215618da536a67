//! Storage engine for collected series.
//!
//! Every backend implements [`Storage`]. Callers only ever merge values in
//! (gauges overwrite, counters accumulate) and read rendered values out; the
//! underlying maps or tables are never exposed.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::metric::{MetricError, MetricKind, MetricValue, Metrics};
use crate::snapshot::MetricSnapshot;

pub mod file;
pub mod memory;
pub mod postgres;

pub use file::FileStorage;
pub use memory::MemStorage;
pub use postgres::PgStorage;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Invalid(#[from] MetricError),

    #[error("counter {0} would overflow")]
    Overflow(String),

    #[error("metric not found")]
    NotFound,

    #[error("{0} storage does not support snapshots")]
    Unsupported(&'static str),

    #[error("snapshot: {0}")]
    Snapshot(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("database: {0}")]
    Database(#[from] sqlx::Error),
}

impl StorageError {
    /// True when the error was caused by the caller's input.
    pub fn is_client_error(&self) -> bool {
        matches!(self, StorageError::Invalid(_) | StorageError::Overflow(_))
    }
}

#[async_trait]
pub trait Storage: Send + Sync {
    /// Short backend name used in logs.
    fn name(&self) -> &'static str;

    /// Merges one typed value into the series `(value.kind(), name)`.
    async fn apply(&self, name: &str, value: MetricValue) -> Result<(), StorageError>;

    /// Current value of a series, if present.
    async fn get(&self, kind: MetricKind, name: &str) -> Result<Option<MetricValue>, StorageError>;

    /// Every series with values rendered, names sorted.
    async fn list_all(&self) -> Result<MetricSnapshot, StorageError>;

    async fn ping(&self) -> Result<(), StorageError>;

    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }

    /// Serializes the whole store as `{"GaugeMetrics":{..},"CounterMetrics":{..}}`.
    async fn snapshot_bytes(&self) -> Result<Vec<u8>, StorageError> {
        Err(StorageError::Unsupported(self.name()))
    }

    /// Replaces the whole store with a snapshot produced by [`Storage::snapshot_bytes`].
    async fn restore(&self, _bytes: &[u8]) -> Result<(), StorageError> {
        Err(StorageError::Unsupported(self.name()))
    }

    /// Parses `raw` according to `kind` and merges it.
    async fn set_value(&self, kind: MetricKind, name: &str, raw: &str) -> Result<(), StorageError> {
        if name.is_empty() {
            return Err(MetricError::IdMissing.into());
        }
        let value = MetricValue::parse(kind, raw)?;
        self.apply(name, value).await
    }

    async fn set_metric(&self, metric: &Metrics) -> Result<(), StorageError> {
        let value = metric.typed_value()?;
        self.apply(&metric.id, value).await
    }

    /// Applies a batch in order. Not atomic: items before the first invalid
    /// one stay committed.
    async fn set_metrics(&self, batch: &[Metrics]) -> Result<(), StorageError> {
        for metric in batch {
            self.set_metric(metric).await?;
        }
        Ok(())
    }

    async fn get_value(&self, kind: MetricKind, name: &str) -> Result<String, StorageError> {
        self.get(kind, name)
            .await?
            .map(|v| v.to_string())
            .ok_or(StorageError::NotFound)
    }

    async fn get_metric(&self, kind: MetricKind, name: &str) -> Result<Metrics, StorageError> {
        match self.get(kind, name).await? {
            Some(MetricValue::Gauge(v)) => Ok(Metrics::gauge(name, v)),
            Some(MetricValue::Counter(d)) => Ok(Metrics::counter(name, d)),
            None => Err(StorageError::NotFound),
        }
    }
}

/// Backend selection inputs.
#[derive(Debug, Clone, Default)]
pub struct StorageSettings {
    pub database_dsn: Option<String>,
    pub file_path: Option<PathBuf>,
    /// Zero means every write is persisted synchronously.
    pub store_interval: Duration,
}

impl StorageSettings {
    pub fn dsn(&self) -> Option<&str> {
        self.database_dsn.as_deref().filter(|d| !d.is_empty())
    }

    /// Snapshot file of a memory-based backend, if one is used.
    pub fn snapshot_path(&self) -> Option<&PathBuf> {
        if self.dsn().is_some() {
            return None;
        }
        self.file_path
            .as_ref()
            .filter(|p| !p.as_os_str().is_empty())
    }
}

/// Opens the backend chosen by `settings`: a DSN selects PostgreSQL, else a
/// file path selects the file-backed store, else plain memory.
pub async fn open(settings: &StorageSettings) -> Result<Arc<dyn Storage>, StorageError> {
    let storage: Arc<dyn Storage> = if let Some(dsn) = settings.dsn() {
        Arc::new(PgStorage::connect(dsn).await?)
    } else if let Some(path) = settings.snapshot_path() {
        Arc::new(FileStorage::new(
            path.clone(),
            settings.store_interval.is_zero(),
        ))
    } else {
        Arc::new(MemStorage::new())
    };
    info!(backend = storage.name(), "Storage opened");
    Ok(storage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_prefer_dsn_over_file() {
        let settings = StorageSettings {
            database_dsn: Some("postgres://localhost/metrics".into()),
            file_path: Some(PathBuf::from("/tmp/metrics-db.json")),
            store_interval: Duration::from_secs(300),
        };
        assert!(settings.dsn().is_some());
        assert!(settings.snapshot_path().is_none());

        let settings = StorageSettings {
            database_dsn: Some(String::new()),
            ..settings
        };
        assert!(settings.dsn().is_none());
        assert_eq!(
            settings.snapshot_path(),
            Some(&PathBuf::from("/tmp/metrics-db.json"))
        );
    }

    #[tokio::test]
    async fn test_open_picks_memory_without_path() {
        let storage = open(&StorageSettings::default()).await.unwrap();
        assert_eq!(storage.name(), "memory");
    }

    #[tokio::test]
    async fn test_open_picks_file_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open(&StorageSettings {
            file_path: Some(dir.path().join("db.json")),
            ..Default::default()
        })
        .await
        .unwrap();
        assert_eq!(storage.name(), "file");
    }
}
