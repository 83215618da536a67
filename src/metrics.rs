//! Prometheus self-telemetry of the collector.
//!
//! This module defines the counters and gauges the collector keeps about its
//! own ingestion and persistence, exported at `/metrics`.

use prometheus::{Gauge, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry};

use crate::metric::MetricKind;
use crate::snapshot::MetricSnapshot;

/// Collection of collector self-metrics.
#[derive(Clone)]
pub struct ServerMetrics {
    pub ingested: IntCounterVec,
    pub rejected: IntCounterVec,
    pub snapshot_dumps: IntCounter,
    pub snapshot_duration: Gauge,
    pub stored_series: IntGaugeVec,
}

impl ServerMetrics {
    /// Creates and registers all metrics with the registry.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let ingested = IntCounterVec::new(
            Opts::new(
                "metric_collector_ingested_total",
                "Series values merged into storage, by kind",
            ),
            &["kind"],
        )?;
        let rejected = IntCounterVec::new(
            Opts::new(
                "metric_collector_rejected_total",
                "Requests rejected by the collector, by reason",
            ),
            &["reason"],
        )?;
        let snapshot_dumps = IntCounter::new(
            "metric_collector_snapshot_dumps_total",
            "Snapshot files written",
        )?;
        let snapshot_duration = Gauge::new(
            "metric_collector_snapshot_duration_seconds",
            "Time spent writing the last snapshot file",
        )?;
        let stored_series = IntGaugeVec::new(
            Opts::new(
                "metric_collector_stored_series",
                "Series currently held by storage, by kind",
            ),
            &["kind"],
        )?;

        registry.register(Box::new(ingested.clone()))?;
        registry.register(Box::new(rejected.clone()))?;
        registry.register(Box::new(snapshot_dumps.clone()))?;
        registry.register(Box::new(snapshot_duration.clone()))?;
        registry.register(Box::new(stored_series.clone()))?;

        Ok(Self {
            ingested,
            rejected,
            snapshot_dumps,
            snapshot_duration,
            stored_series,
        })
    }

    pub fn record_ingested(&self, kind: MetricKind) {
        self.ingested.with_label_values(&[kind.as_str()]).inc();
    }

    pub fn record_rejected(&self, reason: &str) {
        self.rejected.with_label_values(&[reason]).inc();
    }

    /// Refreshes the stored-series gauges from a storage listing.
    pub fn observe_listing(&self, listing: &MetricSnapshot) {
        for kind in MetricKind::ALL {
            self.stored_series
                .with_label_values(&[kind.as_str()])
                .set(listing.partition(kind).len() as i64);
        }
    }
}
