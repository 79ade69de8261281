//! Report Metrics
//!
//! In-process counters for report runs:
//! - Batches and records fetched, fetch failures
//! - Per-batch fetch latency percentiles
//! - Reports generated and rows written
//!
//! Everything is lock-free so fetch workers can record from any task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Monotonic counter
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Upper bounds of the latency buckets, in milliseconds
const LATENCY_BOUNDS_MS: [u64; 12] = [5, 10, 25, 50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000, 30_000];

/// Fetch latency distribution.
///
/// Each observation lands in exactly one bucket; anything slower than the
/// last bound goes to the overflow slot.
#[derive(Debug, Default)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; LATENCY_BOUNDS_MS.len() + 1],
    total_micros: AtomicU64,
    count: AtomicU64,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&self, elapsed: Duration) {
        let millis = elapsed.as_millis() as u64;
        let slot = LATENCY_BOUNDS_MS
            .iter()
            .position(|bound| millis <= *bound)
            .unwrap_or(LATENCY_BOUNDS_MS.len());

        self.buckets[slot].fetch_add(1, Ordering::Relaxed);
        self.total_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn mean(&self) -> Option<Duration> {
        let count = self.count();
        (count > 0).then(|| Duration::from_micros(self.total_micros.load(Ordering::Relaxed) / count))
    }

    /// Bucket bound at or above the `p`th percentile; `None` when empty.
    ///
    /// Observations past the last bound report that bound.
    pub fn percentile(&self, p: f64) -> Option<Duration> {
        let count = self.count();
        if count == 0 {
            return None;
        }

        let rank = ((count as f64) * p / 100.0).ceil().max(1.0) as u64;
        let mut seen = 0;
        for (slot, bucket) in self.buckets.iter().enumerate() {
            seen += bucket.load(Ordering::Relaxed);
            if seen >= rank {
                let bound = LATENCY_BOUNDS_MS[slot.min(LATENCY_BOUNDS_MS.len() - 1)];
                return Some(Duration::from_millis(bound));
            }
        }
        LATENCY_BOUNDS_MS.last().map(|ms| Duration::from_millis(*ms))
    }

    pub fn percentiles(&self) -> LatencyPercentiles {
        let millis = |p| self.percentile(p).map(|d| d.as_millis() as u64);
        LatencyPercentiles {
            p50_ms: millis(50.0),
            p90_ms: millis(90.0),
            p99_ms: millis(99.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LatencyPercentiles {
    pub p50_ms: Option<u64>,
    pub p90_ms: Option<u64>,
    pub p99_ms: Option<u64>,
}

/// Metrics shared by the fetcher and the report pipeline
#[derive(Debug, Default)]
pub struct ReportMetrics {
    pub batches_fetched: Counter,
    pub records_fetched: Counter,
    pub fetch_failures: Counter,
    pub batch_fetch_latency: LatencyHistogram,

    pub reports_generated: Counter,
    pub rows_written: Counter,
}

impl ReportMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one successfully fetched batch
    pub fn record_batch(&self, records: usize, elapsed: Duration) {
        self.batches_fetched.inc();
        self.records_fetched.add(records as u64);
        self.batch_fetch_latency.observe(elapsed);
    }

    pub fn record_failure(&self) {
        self.fetch_failures.inc();
    }

    pub fn record_report(&self, rows: usize) {
        self.reports_generated.inc();
        self.rows_written.add(rows as u64);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            batches_fetched: self.batches_fetched.get(),
            records_fetched: self.records_fetched.get(),
            fetch_failures: self.fetch_failures.get(),
            reports_generated: self.reports_generated.get(),
            rows_written: self.rows_written.get(),
            fetch_latency: self.batch_fetch_latency.percentiles(),
        }
    }
}

/// Point-in-time copy of [`ReportMetrics`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub batches_fetched: u64,
    pub records_fetched: u64,
    pub fetch_failures: u64,
    pub reports_generated: u64,
    pub rows_written: u64,
    pub fetch_latency: LatencyPercentiles,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::default();
        counter.inc();
        counter.add(4);
        assert_eq!(counter.get(), 5);
    }

    #[test]
    fn test_latency_percentiles() {
        let histogram = LatencyHistogram::new();
        assert!(histogram.percentile(50.0).is_none());
        assert!(histogram.mean().is_none());

        for ms in [8, 20, 30, 40, 2_000] {
            histogram.observe(Duration::from_millis(ms));
        }

        assert_eq!(histogram.count(), 5);
        assert_eq!(histogram.mean(), Some(Duration::from_micros(419_600)));
        assert_eq!(histogram.percentile(50.0), Some(Duration::from_millis(50)));
        assert_eq!(histogram.percentile(20.0), Some(Duration::from_millis(10)));
        assert_eq!(histogram.percentile(99.0), Some(Duration::from_millis(2_500)));
    }

    #[test]
    fn test_overflow_reports_last_bound() {
        let histogram = LatencyHistogram::new();
        histogram.observe(Duration::from_secs(90));
        assert_eq!(histogram.percentile(50.0), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_report_metrics_snapshot() {
        let metrics = ReportMetrics::new();
        metrics.record_batch(10, Duration::from_millis(30));
        metrics.record_batch(5, Duration::from_millis(60));
        metrics.record_failure();
        metrics.record_report(12);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.batches_fetched, 2);
        assert_eq!(snapshot.records_fetched, 15);
        assert_eq!(snapshot.fetch_failures, 1);
        assert_eq!(snapshot.reports_generated, 1);
        assert_eq!(snapshot.rows_written, 12);
        assert_eq!(snapshot.fetch_latency.p50_ms, Some(50));
        assert_eq!(snapshot.fetch_latency.p99_ms, Some(100));
    }
}
