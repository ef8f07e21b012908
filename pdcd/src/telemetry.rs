//! Rolling request metrics for a single rollout target.
//!
//! One accumulator exists per target (canary and baseline). The record
//! path is called from many request-handling contexts concurrently, so
//! the counters are atomics and the sample buffer sits behind a
//! short-held lock; only the controller's decision loop reads the
//! derived rates.

use pdc_common::MetricsSnapshot;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// Hard cap on retained latency samples.
const SAMPLE_CAP: usize = 10_000;

/// Samples kept (most recent) when the cap is exceeded.
const SAMPLE_KEEP: usize = 5_000;

/// Thread-safe rolling counters of requests, errors, and latency.
#[derive(Debug, Default)]
pub struct MetricsAccumulator {
    requests_total: AtomicU64,
    errors_total: AtomicU64,
    /// Sum of latencies in microseconds; avoids a float atomic.
    latency_sum_us: AtomicU64,
    samples: RwLock<Vec<f64>>,
}

impl MetricsAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one request outcome. O(1) amortized; safe for unbounded
    /// concurrent callers.
    pub fn record_request(&self, success: bool, latency_ms: f64) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.errors_total.fetch_add(1, Ordering::Relaxed);
        }
        let micros = (latency_ms.max(0.0) * 1000.0) as u64;
        self.latency_sum_us.fetch_add(micros, Ordering::Relaxed);

        let mut samples = self.samples.write().unwrap_or_else(|e| e.into_inner());
        samples.push(latency_ms);
        if samples.len() > SAMPLE_CAP {
            let excess = samples.len() - SAMPLE_KEEP;
            samples.drain(..excess);
        }
    }

    pub fn requests_total(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    pub fn errors_total(&self) -> u64 {
        self.errors_total.load(Ordering::Relaxed)
    }

    /// Fraction of recorded requests that failed, 0.0 when empty.
    pub fn error_rate(&self) -> f64 {
        let requests = self.requests_total();
        if requests == 0 {
            return 0.0;
        }
        self.errors_total() as f64 / requests as f64
    }

    /// Mean latency in milliseconds, 0.0 when empty.
    pub fn mean_latency_ms(&self) -> f64 {
        let requests = self.requests_total();
        if requests == 0 {
            return 0.0;
        }
        self.latency_sum_us.load(Ordering::Relaxed) as f64 / 1000.0 / requests as f64
    }

    /// P95 latency by nearest rank over the retained sample buffer.
    ///
    /// Sorting the buffer per call is acceptable given the sample cap;
    /// the only caller is the low-frequency decision loop.
    pub fn p95_latency_ms(&self) -> f64 {
        let samples = self.samples.read().unwrap_or_else(|e| e.into_inner());
        if samples.is_empty() {
            return 0.0;
        }
        let mut sorted = samples.clone();
        drop(samples);
        sorted.sort_by(f64::total_cmp);
        let idx = (sorted.len() as f64 * 0.95) as usize;
        sorted[idx.min(sorted.len() - 1)]
    }

    /// Point-in-time view of the derived metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.requests_total(),
            errors_total: self.errors_total(),
            error_rate: self.error_rate(),
            mean_latency_ms: self.mean_latency_ms(),
            p95_latency_ms: self.p95_latency_ms(),
        }
    }

    /// Clear all counters for a fresh measurement window.
    ///
    /// Invoked once per phase transition, after the router weight has
    /// already moved; a few late samples from the prior phase landing in
    /// the new window are accepted measurement noise.
    pub fn reset(&self) {
        self.requests_total.store(0, Ordering::Relaxed);
        self.errors_total.store(0, Ordering::Relaxed);
        self.latency_sum_us.store(0, Ordering::Relaxed);
        self.samples
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn empty_accumulator_reads_zero() {
        let acc = MetricsAccumulator::new();
        assert_eq!(acc.requests_total(), 0);
        assert_eq!(acc.error_rate(), 0.0);
        assert_eq!(acc.mean_latency_ms(), 0.0);
        assert_eq!(acc.p95_latency_ms(), 0.0);
    }

    #[test]
    fn error_rate_counts_failures() {
        let acc = MetricsAccumulator::new();
        for _ in 0..55 {
            acc.record_request(true, 100.0);
        }
        for _ in 0..5 {
            acc.record_request(false, 100.0);
        }
        assert_eq!(acc.requests_total(), 60);
        assert_eq!(acc.errors_total(), 5);
        assert!((acc.error_rate() - 5.0 / 60.0).abs() < 1e-9);
    }

    #[test]
    fn mean_latency_averages_samples() {
        let acc = MetricsAccumulator::new();
        acc.record_request(true, 100.0);
        acc.record_request(true, 300.0);
        assert!((acc.mean_latency_ms() - 200.0).abs() < 1e-6);
    }

    #[test]
    fn p95_uses_nearest_rank() {
        let acc = MetricsAccumulator::new();
        // 1..=100 ms: rank index floor(100 * 0.95) = 95 -> 96 ms.
        for ms in 1..=100 {
            acc.record_request(true, ms as f64);
        }
        assert_eq!(acc.p95_latency_ms(), 96.0);
    }

    #[test]
    fn p95_single_sample_is_that_sample() {
        let acc = MetricsAccumulator::new();
        acc.record_request(true, 42.0);
        assert_eq!(acc.p95_latency_ms(), 42.0);
    }

    #[test]
    fn sample_buffer_trims_past_cap() {
        let acc = MetricsAccumulator::new();
        for i in 0..(SAMPLE_CAP + 1) {
            acc.record_request(true, i as f64);
        }
        let samples = acc.samples.read().unwrap();
        assert_eq!(samples.len(), SAMPLE_KEEP);
        // The most recent samples survive the trim.
        assert_eq!(*samples.last().unwrap(), SAMPLE_CAP as f64);
        // Counters are unaffected by trimming.
        drop(samples);
        assert_eq!(acc.requests_total(), (SAMPLE_CAP + 1) as u64);
    }

    #[test]
    fn reset_clears_everything() {
        let acc = MetricsAccumulator::new();
        acc.record_request(false, 500.0);
        acc.reset();
        assert_eq!(acc.snapshot(), MetricsSnapshot::default());
    }

    #[tokio::test]
    async fn concurrent_recording_loses_nothing() {
        let acc = Arc::new(MetricsAccumulator::new());

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let acc = Arc::clone(&acc);
                tokio::spawn(async move {
                    for _ in 0..100 {
                        acc.record_request(true, 10.0);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(acc.requests_total(), 1000);
        assert_eq!(acc.errors_total(), 0);
    }
}
