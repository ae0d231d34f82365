//! Atomic request counters and infer-latency samples.
//!
//! All updates are lock-free; any connection task may record outcomes
//! concurrently. The `/metrics` endpoint renders a snapshot as plaintext.

use std::sync::atomic::{AtomicU64, Ordering};

/// Gateway-wide request accounting.
#[derive(Debug)]
pub struct GatewayMetrics {
    requests_ok: AtomicU64,
    requests_err: AtomicU64,
    latency: LatencyStats,
}

/// Running latency aggregate in milliseconds.
#[derive(Debug)]
struct LatencyStats {
    count: AtomicU64,
    sum_ms: AtomicU64,
    min_ms: AtomicU64,
    peak_ms: AtomicU64,
}

impl GatewayMetrics {
    pub const fn new() -> Self {
        Self {
            requests_ok: AtomicU64::new(0),
            requests_err: AtomicU64::new(0),
            latency: LatencyStats {
                count: AtomicU64::new(0),
                sum_ms: AtomicU64::new(0),
                min_ms: AtomicU64::new(u64::MAX),
                peak_ms: AtomicU64::new(0),
            },
        }
    }

    /// Records a successful request and its infer latency.
    /// Returns the new success count.
    pub fn record_ok(&self, latency_ms: u64) -> u64 {
        self.latency.count.fetch_add(1, Ordering::Relaxed);
        self.latency.sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.latency.min_ms.fetch_min(latency_ms, Ordering::Relaxed);
        self.latency.peak_ms.fetch_max(latency_ms, Ordering::Relaxed);
        self.requests_ok.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Records a failed request (any terminal non-zero status, timeout,
    /// or write failure).
    pub fn record_err(&self) {
        self.requests_err.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let count = self.latency.count.load(Ordering::Relaxed);
        let sum = self.latency.sum_ms.load(Ordering::Relaxed);
        let min = self.latency.min_ms.load(Ordering::Relaxed);
        MetricsSnapshot {
            requests_ok: self.requests_ok.load(Ordering::Relaxed),
            requests_err: self.requests_err.load(Ordering::Relaxed),
            avg_latency_ms: if count > 0 { sum / count } else { 0 },
            min_latency_ms: if count > 0 { min } else { 0 },
            peak_latency_ms: self.latency.peak_ms.load(Ordering::Relaxed),
        }
    }

    /// Plaintext exposition for the `/metrics` endpoint.
    pub fn render(&self) -> String {
        let snap = self.snapshot();
        format!(
            "eig_requests_total {}\n\
             eig_errors_total {}\n\
             eig_infer_latency_ms_avg {}\n\
             eig_infer_latency_ms_peak {}\n",
            snap.requests_ok, snap.requests_err, snap.avg_latency_ms, snap.peak_latency_ms
        )
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of the counters.
#[derive(Clone, Copy, Debug)]
pub struct MetricsSnapshot {
    pub requests_ok: u64,
    pub requests_err: u64,
    pub avg_latency_ms: u64,
    pub min_latency_ms: u64,
    pub peak_latency_ms: u64,
}
