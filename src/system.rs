//! Process and host statistics from the /proc filesystem.
//!
//! This module provides functions to read host memory and per-core CPU usage
//! as well as the agent's own memory and scheduling counters.

use std::collections::HashMap;
use std::fs;
use std::sync::RwLock;

/// Host memory information in bytes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtendedMemoryInfo {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

/// CPU statistics for calculating usage ratios.
#[derive(Debug, Clone, Copy)]
pub struct CpuStat {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
}

impl CpuStat {
    /// Calculate total CPU time (all fields).
    pub fn total(&self) -> u64 {
        self.user + self.nice + self.system + self.idle + self.iowait + self.irq + self.softirq + self.steal
    }

    /// Calculate non-active time (idle + iowait).
    pub fn idle_total(&self) -> u64 {
        self.idle + self.iowait
    }
}

/// Memory figures of the current process from /proc/self/status, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProcessStatus {
    pub vm_size: u64,
    pub vm_peak: u64,
    pub vm_rss: u64,
    pub vm_hwm: u64,
    pub vm_data: u64,
    pub vm_stk: u64,
    pub vm_swap: u64,
    pub threads: u64,
}

/// Resource usage of the current process from getrusage(2).
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceUsage {
    pub max_rss_bytes: u64,
    pub minor_faults: u64,
    pub major_faults: u64,
    pub voluntary_switches: u64,
    pub involuntary_switches: u64,
    pub user_seconds: f64,
    pub system_seconds: f64,
}

fn parse_kb_field(line: &str) -> Option<u64> {
    // Format: "MemTotal:       16384000 kB"
    line.split_whitespace().nth(1)?.parse::<u64>().ok()
}

/// Reads extended memory information from /proc/meminfo including MemAvailable.
pub fn read_extended_memory_info() -> Result<ExtendedMemoryInfo, String> {
    let content = fs::read_to_string("/proc/meminfo")
        .map_err(|e| format!("Failed to read /proc/meminfo: {}", e))?;
    parse_extended_memory_info(&content)
}

/// Parses MemTotal and MemAvailable out of /proc/meminfo content.
pub fn parse_extended_memory_info(content: &str) -> Result<ExtendedMemoryInfo, String> {
    let mut total_bytes: Option<u64> = None;
    let mut available_bytes: Option<u64> = None;

    for line in content.lines() {
        if line.starts_with("MemTotal:") {
            total_bytes = parse_kb_field(line).map(|kb| kb * 1024);
        } else if line.starts_with("MemAvailable:") {
            available_bytes = parse_kb_field(line).map(|kb| kb * 1024);
        }

        if total_bytes.is_some() && available_bytes.is_some() {
            break;
        }
    }

    match (total_bytes, available_bytes) {
        (Some(total), Some(available)) => Ok(ExtendedMemoryInfo {
            total_bytes: total,
            available_bytes: available,
        }),
        _ => Err("Failed to parse MemTotal or MemAvailable from /proc/meminfo".to_string()),
    }
}

/// Reads CPU statistics from /proc/stat.
///
/// "cpu" is the total across all cores, "cpu0", "cpu1", etc. are individual cores.
pub fn read_cpu_stats() -> Result<HashMap<String, CpuStat>, String> {
    let content = fs::read_to_string("/proc/stat")
        .map_err(|e| format!("Failed to read /proc/stat: {}", e))?;
    parse_cpu_stats(&content)
}

/// Parses the `cpu*` lines of /proc/stat content.
pub fn parse_cpu_stats(content: &str) -> Result<HashMap<String, CpuStat>, String> {
    let mut stats = HashMap::new();

    for line in content.lines() {
        if !line.starts_with("cpu") {
            continue;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 8 {
            continue;
        }

        let field = |i: usize| parts.get(i).and_then(|v| v.parse::<u64>().ok()).unwrap_or(0);
        stats.insert(
            parts[0].to_string(),
            CpuStat {
                user: field(1),
                nice: field(2),
                system: field(3),
                idle: field(4),
                iowait: field(5),
                irq: field(6),
                softirq: field(7),
                steal: field(8),
            },
        );
    }

    if stats.is_empty() {
        return Err("No CPU statistics found in /proc/stat".to_string());
    }

    Ok(stats)
}

/// CPU statistics cache for calculating deltas between ticks.
pub struct CpuStatsCache {
    previous: RwLock<Option<HashMap<String, CpuStat>>>,
}

impl Default for CpuStatsCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuStatsCache {
    pub fn new() -> Self {
        Self {
            previous: RwLock::new(None),
        }
    }

    /// Calculates per-core utilization in percent against the previous call.
    ///
    /// Returns `(core_index, percent)` pairs sorted by core index; the
    /// aggregate "cpu" line is skipped. The first call only primes the cache.
    pub fn core_utilization(&self) -> Result<Vec<(usize, f64)>, String> {
        let current = read_cpu_stats()?;
        self.core_utilization_from(current)
    }

    pub fn core_utilization_from(
        &self,
        current: HashMap<String, CpuStat>,
    ) -> Result<Vec<(usize, f64)>, String> {
        let mut guard = self
            .previous
            .write()
            .map_err(|e| format!("Failed to acquire write lock: {}", e))?;

        let mut usage = Vec::new();
        if let Some(prev_stats) = guard.as_ref() {
            for (cpu_name, cur) in &current {
                let Some(index) = cpu_name
                    .strip_prefix("cpu")
                    .and_then(|i| i.parse::<usize>().ok())
                else {
                    continue;
                };
                if let Some(prev) = prev_stats.get(cpu_name) {
                    let delta_total = cur.total().saturating_sub(prev.total());
                    let delta_idle = cur.idle_total().saturating_sub(prev.idle_total());
                    let percent = if delta_total > 0 {
                        (delta_total.saturating_sub(delta_idle)) as f64 / delta_total as f64 * 100.0
                    } else {
                        0.0
                    };
                    usage.push((index, percent));
                }
            }
        }
        usage.sort_by_key(|(i, _)| *i);

        *guard = Some(current);
        Ok(usage)
    }
}

/// Reads the memory section of /proc/self/status.
pub fn read_process_status() -> Result<ProcessStatus, String> {
    let content = fs::read_to_string("/proc/self/status")
        .map_err(|e| format!("Failed to read /proc/self/status: {}", e))?;
    Ok(parse_process_status(&content))
}

/// Parses Vm* and Threads lines of /proc/<pid>/status content.
pub fn parse_process_status(content: &str) -> ProcessStatus {
    let mut status = ProcessStatus::default();
    for line in content.lines() {
        let Some((key, _)) = line.split_once(':') else {
            continue;
        };
        let slot = match key {
            "VmSize" => &mut status.vm_size,
            "VmPeak" => &mut status.vm_peak,
            "VmRSS" => &mut status.vm_rss,
            "VmHWM" => &mut status.vm_hwm,
            "VmData" => &mut status.vm_data,
            "VmStk" => &mut status.vm_stk,
            "VmSwap" => &mut status.vm_swap,
            "Threads" => {
                status.threads = parse_kb_field(line).unwrap_or(0);
                continue;
            }
            _ => continue,
        };
        *slot = parse_kb_field(line).unwrap_or(0) * 1024;
    }
    status
}

/// Reads resource usage of the calling process.
pub fn read_resource_usage() -> Result<ResourceUsage, String> {
    // SAFETY: getrusage only writes into the zeroed struct we hand it.
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) };
    if rc != 0 {
        return Err(format!(
            "getrusage failed: {}",
            std::io::Error::last_os_error()
        ));
    }

    let seconds = |tv: libc::timeval| tv.tv_sec as f64 + tv.tv_usec as f64 / 1_000_000.0;

    Ok(ResourceUsage {
        // Linux reports ru_maxrss in kilobytes.
        max_rss_bytes: (usage.ru_maxrss.max(0) as u64) * 1024,
        minor_faults: usage.ru_minflt.max(0) as u64,
        major_faults: usage.ru_majflt.max(0) as u64,
        voluntary_switches: usage.ru_nvcsw.max(0) as u64,
        involuntary_switches: usage.ru_nivcsw.max(0) as u64,
        user_seconds: seconds(usage.ru_utime),
        system_seconds: seconds(usage.ru_stime),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT: &str = "cpu  100 0 100 800 0 0 0 0 0 0\n\
                        cpu0 50 0 50 400 0 0 0 0 0 0\n\
                        cpu1 50 0 50 400 0 0 0 0 0 0\n\
                        intr 12345\n";

    #[test]
    fn test_parse_extended_memory_info() {
        let meminfo = "MemTotal:       16384000 kB\nMemFree:        8192000 kB\nMemAvailable:   10000000 kB\n";
        let mem = parse_extended_memory_info(meminfo).unwrap();
        assert_eq!(mem.total_bytes, 16384000 * 1024);
        assert_eq!(mem.available_bytes, 10000000 * 1024);
    }

    #[test]
    fn test_parse_extended_memory_info_missing_fields() {
        let meminfo = "MemFree:        8192000 kB\nSwapFree:        2048000 kB\n";
        assert!(parse_extended_memory_info(meminfo).is_err());
    }

    #[test]
    fn test_core_utilization_needs_two_samples() {
        let cache = CpuStatsCache::new();
        let first = cache
            .core_utilization_from(parse_cpu_stats(STAT).unwrap())
            .unwrap();
        assert!(first.is_empty());

        // cpu0 busy for 75 of 100 new jiffies, cpu1 idle the whole time.
        let next = "cpu  175 0 100 825 0 0 0 0\n\
                    cpu0 125 0 50 425 0 0 0 0\n\
                    cpu1 50 0 50 500 0 0 0 0\n";
        let usage = cache
            .core_utilization_from(parse_cpu_stats(next).unwrap())
            .unwrap();
        assert_eq!(usage.len(), 2);
        assert_eq!(usage[0].0, 0);
        assert!((usage[0].1 - 75.0).abs() < 1e-9);
        assert_eq!(usage[1], (1, 0.0));
    }

    #[test]
    fn test_parse_process_status() {
        let status = "Name:\tagent\nVmPeak:\t  2000 kB\nVmSize:\t  1500 kB\nVmHWM:\t  300 kB\n\
                      VmRSS:\t  250 kB\nVmData:\t  100 kB\nVmStk:\t  132 kB\nVmSwap:\t 0 kB\nThreads:\t4\n";
        let parsed = parse_process_status(status);
        assert_eq!(parsed.vm_peak, 2000 * 1024);
        assert_eq!(parsed.vm_rss, 250 * 1024);
        assert_eq!(parsed.vm_stk, 132 * 1024);
        assert_eq!(parsed.threads, 4);
    }

    #[test]
    fn test_read_resource_usage() {
        let usage = read_resource_usage().unwrap();
        assert!(usage.user_seconds >= 0.0);
    }
}
