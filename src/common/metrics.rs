//! Prometheus-compatible metrics for the coordinator
//!
//! Counters for transaction outcomes and membership churn, a live-participant
//! gauge, and a latency histogram for mutating requests.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Histogram bucket boundaries for latency measurements (in milliseconds)
const LATENCY_BUCKETS: [f64; 11] = [
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0,
];

/// A simple histogram implementation for latency tracking
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    boundaries: Vec<f64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    /// Create a new histogram with default latency buckets
    pub fn new() -> Self {
        Self::with_buckets(&LATENCY_BUCKETS)
    }

    pub fn with_buckets(boundaries: &[f64]) -> Self {
        let buckets = (0..=boundaries.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            boundaries: boundaries.to_vec(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        let bucket_idx = self
            .boundaries
            .iter()
            .position(|&boundary| value <= boundary)
            .unwrap_or(self.boundaries.len());

        self.buckets[bucket_idx].fetch_add(1, Ordering::Relaxed);
        // sum kept in microseconds
        self.sum
            .fetch_add((value * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Cumulative `(upper bound, count)` pairs, ending with `+Inf`.
    pub fn get_buckets(&self) -> Vec<(f64, u64)> {
        let mut cumulative = 0u64;
        let mut result = Vec::with_capacity(self.boundaries.len() + 1);

        for (i, &boundary) in self.boundaries.iter().enumerate() {
            cumulative += self.buckets[i].load(Ordering::Relaxed);
            result.push((boundary, cumulative));
        }

        cumulative += self.buckets[self.boundaries.len()].load(Ordering::Relaxed);
        result.push((f64::INFINITY, cumulative));

        result
    }

    pub fn sum(&self) -> f64 {
        self.sum.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Metrics owned by one coordinator instance
#[derive(Debug)]
pub struct TxnMetrics {
    pub commits: Counter,
    pub aborts: Counter,
    /// requests answered with the error sentinel
    pub failures: Counter,
    pub reads: Counter,
    pub evictions: Counter,
    pub admissions: Counter,
    pub resyncs: Counter,
    pub live_participants: Gauge,
    pub txn_latency: Histogram,
    start_time: Instant,
}

impl TxnMetrics {
    pub fn new() -> Self {
        Self {
            commits: Counter::new(),
            aborts: Counter::new(),
            failures: Counter::new(),
            reads: Counter::new(),
            evictions: Counter::new(),
            admissions: Counter::new(),
            resyncs: Counter::new(),
            live_participants: Gauge::new(),
            txn_latency: Histogram::new(),
            start_time: Instant::now(),
        }
    }

    pub fn observe_txn(&self, elapsed: Duration) {
        self.txn_latency.observe(elapsed.as_secs_f64() * 1000.0);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-compatible metrics output
    pub fn to_prometheus(&self, next_id: u32) -> String {
        let mut out = String::new();

        let counters = [
            ("kv2pc_commits_total", "Committed transactions", &self.commits),
            ("kv2pc_aborts_total", "Aborted transactions", &self.aborts),
            (
                "kv2pc_failures_total",
                "Requests answered with an error",
                &self.failures,
            ),
            ("kv2pc_reads_total", "GET requests served", &self.reads),
            (
                "kv2pc_evictions_total",
                "Participants evicted from the live set",
                &self.evictions,
            ),
            (
                "kv2pc_admissions_total",
                "Participants admitted to the live set",
                &self.admissions,
            ),
            (
                "kv2pc_resyncs_total",
                "Snapshot resynchronisations",
                &self.resyncs,
            ),
        ];
        for (name, help, counter) in counters {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} counter", name);
            let _ = writeln!(out, "{} {}", name, counter.get());
        }

        out.push_str("# HELP kv2pc_live_participants Participants in the live set\n");
        out.push_str("# TYPE kv2pc_live_participants gauge\n");
        let _ = writeln!(
            out,
            "kv2pc_live_participants {}",
            self.live_participants.get()
        );

        out.push_str("# HELP kv2pc_next_id Next sequence id to assign\n");
        out.push_str("# TYPE kv2pc_next_id gauge\n");
        let _ = writeln!(out, "kv2pc_next_id {}", next_id);

        out.push_str("# HELP kv2pc_uptime_seconds Coordinator uptime in seconds\n");
        out.push_str("# TYPE kv2pc_uptime_seconds gauge\n");
        let _ = writeln!(out, "kv2pc_uptime_seconds {}", self.uptime_seconds());

        out.push_str("# HELP kv2pc_txn_duration_ms Mutating request duration in milliseconds\n");
        out.push_str("# TYPE kv2pc_txn_duration_ms histogram\n");
        for (le, count) in self.txn_latency.get_buckets() {
            if le.is_infinite() {
                let _ = writeln!(out, "kv2pc_txn_duration_ms_bucket{{le=\"+Inf\"}} {}", count);
            } else {
                let _ = writeln!(out, "kv2pc_txn_duration_ms_bucket{{le=\"{}\"}} {}", le, count);
            }
        }
        let _ = writeln!(out, "kv2pc_txn_duration_ms_sum {}", self.txn_latency.sum());
        let _ = writeln!(
            out,
            "kv2pc_txn_duration_ms_count {}",
            self.txn_latency.count()
        );

        out
    }
}

impl Default for TxnMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram() {
        let hist = Histogram::new();

        hist.observe(5.0);
        hist.observe(50.0);
        hist.observe(50_000.0);

        assert_eq!(hist.count(), 3);
        let buckets = hist.get_buckets();
        assert_eq!(buckets.first(), Some(&(1.0, 0)));
        assert_eq!(buckets[1], (5.0, 1));
        assert_eq!(buckets.last(), Some(&(f64::INFINITY, 3)));
    }

    #[test]
    fn test_counter_and_gauge() {
        let counter = Counter::new();
        counter.inc();
        counter.inc();
        assert_eq!(counter.get(), 2);

        let gauge = Gauge::new();
        gauge.set(3);
        assert_eq!(gauge.get(), 3);
    }

    #[test]
    fn test_prometheus_output() {
        let metrics = TxnMetrics::new();
        metrics.commits.inc();
        metrics.live_participants.set(2);
        metrics.observe_txn(Duration::from_millis(12));

        let text = metrics.to_prometheus(42);
        assert!(text.contains("kv2pc_commits_total 1"));
        assert!(text.contains("kv2pc_aborts_total 0"));
        assert!(text.contains("kv2pc_live_participants 2"));
        assert!(text.contains("kv2pc_next_id 42"));
        assert!(text.contains("kv2pc_txn_duration_ms_bucket{le=\"25\"} 1"));
        assert!(text.contains("kv2pc_txn_duration_ms_count 1"));
    }
}
