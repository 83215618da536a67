//! Metric snapshot shared between the poller and the report path.
//!
//! This module provides the `MetricSnapshot` structure: a two-level mapping of
//! series kind to series name to string-encoded value. Both kind partitions
//! always exist, even when empty.

use std::collections::BTreeMap;
use std::time::Instant;

use crate::metric::{format_gauge, MetricKind};

/// Values of one kind, keyed by series name.
pub type Partition = BTreeMap<String, String>;

/// Point-in-time copy of every polled series.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricSnapshot {
    gauges: Partition,
    counters: Partition,
}

impl MetricSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn partition(&self, kind: MetricKind) -> &Partition {
        match kind {
            MetricKind::Gauge => &self.gauges,
            MetricKind::Counter => &self.counters,
        }
    }

    fn partition_mut(&mut self, kind: MetricKind) -> &mut Partition {
        match kind {
            MetricKind::Gauge => &mut self.gauges,
            MetricKind::Counter => &mut self.counters,
        }
    }

    /// Stores an already encoded value.
    pub fn insert_raw(&mut self, kind: MetricKind, name: impl Into<String>, raw: impl Into<String>) {
        self.partition_mut(kind).insert(name.into(), raw.into());
    }

    pub fn set_gauge(&mut self, name: impl Into<String>, value: f64) {
        self.insert_raw(MetricKind::Gauge, name, format_gauge(value));
    }

    pub fn set_counter(&mut self, name: impl Into<String>, value: i64) {
        self.insert_raw(MetricKind::Counter, name, value.to_string());
    }

    pub fn get(&self, kind: MetricKind, name: &str) -> Option<&str> {
        self.partition(kind).get(name).map(String::as_str)
    }

    /// Copies every series of `other` over this snapshot.
    pub fn merge(&mut self, other: MetricSnapshot) {
        self.gauges.extend(other.gauges);
        self.counters.extend(other.counters);
    }

    /// Iterates `(kind, name, value)` triples, gauges first.
    pub fn iter(&self) -> impl Iterator<Item = (MetricKind, &str, &str)> {
        MetricKind::ALL.into_iter().flat_map(move |kind| {
            self.partition(kind)
                .iter()
                .map(move |(name, value)| (kind, name.as_str(), value.as_str()))
        })
    }

    pub fn len(&self) -> usize {
        self.gauges.len() + self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Snapshot state with update timing information.
#[derive(Debug, Clone, Default)]
pub struct SnapshotCache {
    pub snapshot: MetricSnapshot,
    pub last_updated: Option<Instant>,
    pub update_duration_seconds: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_snapshot_has_both_partitions() {
        let s = MetricSnapshot::new();
        assert!(s.partition(MetricKind::Gauge).is_empty());
        assert!(s.partition(MetricKind::Counter).is_empty());
        assert!(s.is_empty());
    }

    #[test]
    fn test_iter_and_merge() {
        let mut a = MetricSnapshot::new();
        a.set_gauge("Alloc", 12.0);
        a.set_counter("PollCount", 3);

        let mut b = MetricSnapshot::new();
        b.set_gauge("Alloc", 4.5);
        b.set_gauge("Sys", 1.0);
        a.merge(b);

        let triples: Vec<_> = a.iter().collect();
        assert_eq!(
            triples,
            vec![
                (MetricKind::Gauge, "Alloc", "4.5"),
                (MetricKind::Gauge, "Sys", "1"),
                (MetricKind::Counter, "PollCount", "3"),
            ]
        );
    }
}
