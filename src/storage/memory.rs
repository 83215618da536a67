//! In-memory backend.

use std::sync::{Mutex, MutexGuard};

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{Storage, StorageError};
use crate::metric::{MetricError, MetricKind, MetricValue};
use crate::snapshot::MetricSnapshot;

/// Persisted shape of the store.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(rename = "GaugeMetrics", default)]
    pub gauges: HashMap<String, f64>,
    #[serde(rename = "CounterMetrics", default)]
    pub counters: HashMap<String, i64>,
}

impl Record {
    fn merge(&mut self, name: &str, value: MetricValue) -> Result<(), StorageError> {
        match value {
            MetricValue::Gauge(v) => {
                self.gauges.insert(name.to_string(), v);
            }
            MetricValue::Counter(delta) => {
                let slot = self.counters.entry(name.to_string()).or_insert(0);
                *slot = slot
                    .checked_add(delta)
                    .ok_or_else(|| StorageError::Overflow(name.to_string()))?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemStorage {
    record: Mutex<Record>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Record> {
        // A panic while holding the lock cannot leave a half-applied merge.
        self.record.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Storage for MemStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn apply(&self, name: &str, value: MetricValue) -> Result<(), StorageError> {
        self.lock().merge(name, value)
    }

    async fn get(&self, kind: MetricKind, name: &str) -> Result<Option<MetricValue>, StorageError> {
        let record = self.lock();
        Ok(match kind {
            MetricKind::Gauge => record.gauges.get(name).copied().map(MetricValue::Gauge),
            MetricKind::Counter => record.counters.get(name).copied().map(MetricValue::Counter),
        })
    }

    async fn list_all(&self) -> Result<MetricSnapshot, StorageError> {
        let record = self.lock();
        let mut snapshot = MetricSnapshot::new();
        for (name, v) in &record.gauges {
            snapshot.set_gauge(name.clone(), *v);
        }
        for (name, v) in &record.counters {
            snapshot.set_counter(name.clone(), *v);
        }
        Ok(snapshot)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn snapshot_bytes(&self) -> Result<Vec<u8>, StorageError> {
        let record = self.lock().clone();
        Ok(serde_json::to_vec(&record)?)
    }

    async fn restore(&self, bytes: &[u8]) -> Result<(), StorageError> {
        let restored: Record = serde_json::from_slice(bytes)?;
        if let Some(bad) = restored.gauges.iter().find(|(_, v)| !v.is_finite()) {
            return Err(StorageError::Invalid(MetricError::InvalidValue {
                kind: MetricKind::Gauge,
                raw: bad.1.to_string(),
            }));
        }
        *self.lock() = restored;
        Ok(())
    }
}
