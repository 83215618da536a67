//! Memory backend mirrored to a JSON snapshot file.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use super::{MemStorage, Storage, StorageError};
use crate::metric::{MetricKind, MetricValue};
use crate::snapshot::MetricSnapshot;

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Writes `bytes` to `path` through a temporary sibling and a rename, so
/// readers never observe a partially written snapshot.
pub async fn write_snapshot(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(
        ".{}.{}.tmp",
        std::process::id(),
        TMP_SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    let tmp = PathBuf::from(tmp);

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir).await?;
    }
    if let Err(e) = tokio::fs::write(&tmp, bytes).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    tokio::fs::rename(&tmp, path).await
}

#[derive(Debug)]
pub struct FileStorage {
    inner: MemStorage,
    path: PathBuf,
    sync_writes: bool,
    dump_lock: Mutex<()>,
}

impl FileStorage {
    /// With `sync_writes` every successful write is followed by a dump.
    pub fn new(path: PathBuf, sync_writes: bool) -> Self {
        Self {
            inner: MemStorage::new(),
            path,
            sync_writes,
            dump_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Dumps the current contents to the snapshot file.
    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub async fn dump(&self) -> Result<(), StorageError> {
        let _guard = self.dump_lock.lock().await;
        let bytes = self.inner.snapshot_bytes().await?;
        write_snapshot(&self.path, &bytes).await?;
        debug!(bytes = bytes.len(), "Snapshot written");
        Ok(())
    }
}

#[async_trait]
impl Storage for FileStorage {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn apply(&self, name: &str, value: MetricValue) -> Result<(), StorageError> {
        self.inner.apply(name, value).await?;
        if self.sync_writes {
            self.dump().await?;
        }
        Ok(())
    }

    async fn get(&self, kind: MetricKind, name: &str) -> Result<Option<MetricValue>, StorageError> {
        self.inner.get(kind, name).await
    }

    async fn list_all(&self) -> Result<MetricSnapshot, StorageError> {
        self.inner.list_all().await
    }

    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.dump().await
    }

    async fn snapshot_bytes(&self) -> Result<Vec<u8>, StorageError> {
        self.inner.snapshot_bytes().await
    }

    async fn restore(&self, bytes: &[u8]) -> Result<(), StorageError> {
        self.inner.restore(bytes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sync_writes_dump_every_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics-db.json");
        let s = FileStorage::new(path.clone(), true);

        s.set_value(MetricKind::Counter, "hits", "5").await.unwrap();
        let on_disk: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(on_disk["CounterMetrics"]["hits"], 5);

        s.set_value(MetricKind::Gauge, "temp", "20.5").await.unwrap();
        let on_disk: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(on_disk["GaugeMetrics"]["temp"], 20.5);
    }

    #[tokio::test]
    async fn test_deferred_writes_touch_nothing_until_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics-db.json");
        let s = FileStorage::new(path.clone(), false);

        s.set_value(MetricKind::Counter, "hits", "1").await.unwrap();
        assert!(!path.exists());

        s.close().await.unwrap();
        let other = MemStorage::new();
        other.restore(&std::fs::read(&path).unwrap()).await.unwrap();
        assert_eq!(other.get_value(MetricKind::Counter, "hits").await.unwrap(), "1");
    }

    #[tokio::test]
    async fn test_write_snapshot_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("db.json");
        write_snapshot(&path, b"{}").await.unwrap();
        write_snapshot(&path, b"{\"GaugeMetrics\":{}}").await.unwrap();

        let entries: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("db.json")]);
    }
}
