//! Daemon Metrics
//!
//! Session counters and latency for the `status` command.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Monotonic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Value that moves both ways
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Session latency distribution
#[derive(Debug)]
pub struct Histogram {
    /// Upper bucket bounds, microseconds
    buckets: Vec<u64>,
    counts: Vec<AtomicU64>,
    overflow: AtomicU64,
    sum: AtomicU64,
    count: AtomicU64,
    max: AtomicU64,
}

impl Histogram {
    /// Buckets from 1 ms to 60 s
    pub fn new_latency() -> Self {
        let buckets = vec![
            1_000, 10_000, 50_000, 100_000, 500_000, 1_000_000, 5_000_000, 30_000_000, 60_000_000,
        ];
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            overflow: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
            max: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, duration: Duration) {
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        self.sum.fetch_add(micros, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.max.fetch_max(micros, Ordering::Relaxed);

        match self.buckets.iter().position(|&b| micros <= b) {
            Some(i) => self.counts[i].fetch_add(1, Ordering::Relaxed),
            None => self.overflow.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn mean_ms(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            return 0.0;
        }
        self.sum.load(Ordering::Relaxed) as f64 / count as f64 / 1000.0
    }

    pub fn max_ms(&self) -> f64 {
        self.max.load(Ordering::Relaxed) as f64 / 1000.0
    }

    /// Non-cumulative counts per bucket, then the overflow count
    pub fn bucket_counts(&self) -> Vec<u64> {
        self.counts
            .iter()
            .chain(std::iter::once(&self.overflow))
            .map(|c| c.load(Ordering::Relaxed))
            .collect()
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new_latency()
    }
}

#[derive(Debug, Default)]
pub struct DaemonMetrics {
    pub connections_total: Counter,
    pub active_connections: Gauge,

    pub sessions_total: Counter,
    pub sessions_failed: Counter,
    pub sessions_dropped: Counter,
    pub sessions_timed_out: Counter,
    pub unknown_commands: Counter,
    pub session_latency: Histogram,

    pub memory_usage_bytes: Gauge,
}

impl DaemonMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.get(),
            active_connections: self.active_connections.get(),
            sessions_total: self.sessions_total.get(),
            sessions_failed: self.sessions_failed.get(),
            sessions_dropped: self.sessions_dropped.get(),
            sessions_timed_out: self.sessions_timed_out.get(),
            unknown_commands: self.unknown_commands.get(),
            session_latency_ms: self.session_latency.mean_ms(),
            session_latency_max_ms: self.session_latency.max_ms(),
            memory_usage_bytes: self.memory_usage_bytes.get(),
        }
    }

    pub fn update_memory_usage(&self) {
        if let Some(usage) = get_memory_usage() {
            self.memory_usage_bytes.set(usage);
        }
    }
}

/// Point-in-time copy of the daemon metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub active_connections: u64,
    pub sessions_total: u64,
    pub sessions_failed: u64,
    pub sessions_dropped: u64,
    pub sessions_timed_out: u64,
    pub unknown_commands: u64,
    pub session_latency_ms: f64,
    pub session_latency_max_ms: f64,
    pub memory_usage_bytes: u64,
}

/// Measures one session
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Record to `histogram` and return the elapsed time
    pub fn record(self, histogram: &Histogram) -> Duration {
        let elapsed = self.elapsed();
        histogram.observe(elapsed);
        elapsed
    }
}

/// Resident set size of this process, Linux only
fn get_memory_usage() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let content = std::fs::read_to_string("/proc/self/statm").ok()?;
        let pages: u64 = content.split_whitespace().nth(1)?.parse().ok()?;
        // SAFETY: sysconf has no preconditions
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        return Some(pages * u64::try_from(page_size).unwrap_or(4096));
    }
    #[allow(unreachable_code)]
    None
}
