//! Periodic collection of process and host statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use rand::Rng;
use tracing::{debug, instrument, warn};

use crate::snapshot::{MetricSnapshot, SnapshotCache};
use crate::system::{self, CpuStatsCache};

/// Reads `/proc/self/status` and `getrusage` into a partial snapshot.
///
/// A failed status read is logged; the rusage gauges are published anyway.
pub fn read_process_stats() -> MetricSnapshot {
    let mut out = MetricSnapshot::new();

    match system::read_process_status() {
        Ok(status) => {
            out.set_gauge("VirtualMemory", status.vm_size as f64);
            out.set_gauge("PeakVirtualMemory", status.vm_peak as f64);
            out.set_gauge("ResidentMemory", status.vm_rss as f64);
            out.set_gauge("PeakResidentMemory", status.vm_hwm as f64);
            out.set_gauge("DataSegment", status.vm_data as f64);
            out.set_gauge("StackSize", status.vm_stk as f64);
            out.set_gauge("SwapUsage", status.vm_swap as f64);
            out.set_gauge("Threads", status.threads as f64);
        }
        Err(e) => warn!("Process status read failed: {}", e),
    }

    match system::read_resource_usage() {
        Ok(usage) => {
            out.set_gauge("MaxResidentMemory", usage.max_rss_bytes as f64);
            out.set_gauge("MinorFaults", usage.minor_faults as f64);
            out.set_gauge("MajorFaults", usage.major_faults as f64);
            out.set_gauge("VoluntaryContextSwitches", usage.voluntary_switches as f64);
            out.set_gauge("InvoluntaryContextSwitches", usage.involuntary_switches as f64);
            out.set_gauge("UserCpuSeconds", usage.user_seconds);
            out.set_gauge("SystemCpuSeconds", usage.system_seconds);
        }
        Err(e) => warn!("Resource usage read failed: {}", e),
    }

    out.set_gauge("RandomValue", rand::thread_rng().gen::<f64>());
    out
}

/// Reads host memory and per-core CPU utilization.
pub fn read_host_stats(cpu: &CpuStatsCache) -> Result<MetricSnapshot, String> {
    let mem = system::read_extended_memory_info()?;
    let cores = cpu.core_utilization()?;

    let mut out = MetricSnapshot::new();
    out.set_gauge("TotalMemory", mem.total_bytes as f64);
    out.set_gauge("FreeMemory", mem.available_bytes as f64);
    for (core, percent) in cores {
        out.set_gauge(format!("CPUutilization{core}"), percent);
    }
    Ok(out)
}

/// Owns the current snapshot and the poll tick counter.
pub struct Poller {
    cache: Mutex<SnapshotCache>,
    ticks: AtomicU64,
    cpu: Arc<CpuStatsCache>,
}

impl Default for Poller {
    fn default() -> Self {
        Self::new()
    }
}

impl Poller {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(SnapshotCache::default()),
            ticks: AtomicU64::new(0),
            cpu: Arc::new(CpuStatsCache::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SnapshotCache> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Runs both reads concurrently and merges their results.
    #[instrument(skip(self))]
    pub async fn refresh(&self) {
        let start = Instant::now();
        let cpu = Arc::clone(&self.cpu);

        let (process, host) = tokio::join!(
            tokio::task::spawn_blocking(read_process_stats),
            tokio::task::spawn_blocking(move || read_host_stats(&cpu)),
        );

        let mut fresh = MetricSnapshot::new();
        match process {
            Ok(stats) => fresh.merge(stats),
            Err(e) => warn!("Process stats task failed: {}", e),
        }
        match host {
            Ok(Ok(stats)) => fresh.merge(stats),
            Ok(Err(e)) => warn!("Host stats read failed: {}", e),
            Err(e) => warn!("Host stats task failed: {}", e),
        }
        self.publish(fresh, start);
    }

    /// Merges `fresh` into the snapshot and counts one tick.
    pub fn publish(&self, fresh: MetricSnapshot, started: Instant) {
        let series = fresh.len();
        {
            let mut cache = self.lock();
            cache.snapshot.merge(fresh);
            cache.last_updated = Some(Instant::now());
            cache.update_duration_seconds = started.elapsed().as_secs_f64();
        }
        let tick = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(tick, series, "Poll complete");
    }

    /// Copy of the current snapshot.
    pub fn snapshot(&self) -> MetricSnapshot {
        self.lock().snapshot.clone()
    }

    /// Number of completed ticks since start.
    pub fn poll_count(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::MetricKind;

    #[test]
    fn test_process_stats_always_has_random_value() {
        let stats = read_process_stats();
        let raw = stats.get(MetricKind::Gauge, "RandomValue").unwrap();
        let v: f64 = raw.parse().unwrap();
        assert!((0.0..1.0).contains(&v));
        assert!(stats.partition(MetricKind::Counter).is_empty());
    }

    #[tokio::test]
    async fn test_refresh_counts_ticks_and_publishes() {
        let poller = Poller::new();
        assert_eq!(poller.poll_count(), 0);
        assert!(poller.snapshot().is_empty());

        poller.refresh().await;
        poller.refresh().await;
        assert_eq!(poller.poll_count(), 2);
        assert!(poller
            .snapshot()
            .get(MetricKind::Gauge, "RandomValue")
            .is_some());
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let poller = Poller::new();
        let mut fresh = MetricSnapshot::new();
        fresh.set_gauge("Alloc", 1.0);
        poller.publish(fresh, Instant::now());

        let mut copy = poller.snapshot();
        copy.set_gauge("Alloc", 99.0);
        assert_eq!(poller.snapshot().get(MetricKind::Gauge, "Alloc"), Some("1"));
    }
}
