//! Probe run-time histogram.
//!
//! Probes are short straight-line programs, so the buckets are tuned for
//! sub-microsecond to tens-of-microseconds runs.

use core::sync::atomic::{AtomicU64, Ordering};

/// Number of buckets.
pub const NR_BUCKETS: usize = 8;

/// Exclusive upper bound of each bucket in nanoseconds.
pub const BUCKET_BOUNDS_NS: [u64; NR_BUCKETS] = [
    100,      // 0: <100ns
    250,      // 1: 100-250ns
    500,      // 2: 250-500ns
    1_000,    // 3: 500ns-1us
    5_000,    // 4: 1-5us
    10_000,   // 5: 5-10us
    100_000,  // 6: 10-100us
    u64::MAX, // 7: >100us
];

/// Bucket labels for display.
pub const BUCKET_LABELS: [&str; NR_BUCKETS] = [
    "   <100ns",
    "100-250ns",
    "250-500ns",
    " 500ns-1us",
    "   1-5us ",
    "  5-10us ",
    " 10-100us",
    "  >100us ",
];

/// Lock-free run-time histogram.
#[derive(Debug)]
pub struct RunHistogram {
    buckets: [AtomicU64; NR_BUCKETS],
}

impl RunHistogram {
    pub const fn new() -> Self {
        Self {
            buckets: [const { AtomicU64::new(0) }; NR_BUCKETS],
        }
    }

    /// Record one run.
    pub fn record(&self, duration_ns: u64) {
        self.buckets[bucket_index(duration_ns)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        let mut buckets = [0u64; NR_BUCKETS];
        for (slot, bucket) in buckets.iter_mut().zip(&self.buckets) {
            *slot = bucket.load(Ordering::Relaxed);
        }
        let total = buckets.iter().sum();

        HistogramSnapshot {
            buckets,
            total,
            p50_ns: percentile(&buckets, total, 50),
            p90_ns: percentile(&buckets, total, 90),
            p99_ns: percentile(&buckets, total, 99),
        }
    }

    pub fn reset(&self) {
        for bucket in &self.buckets {
            bucket.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for RunHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Bucket a duration falls into.
pub fn bucket_index(duration_ns: u64) -> usize {
    BUCKET_BOUNDS_NS
        .iter()
        .position(|&bound| duration_ns < bound)
        .unwrap_or(NR_BUCKETS - 1)
}

/// Upper bound of the bucket holding the `pct`-th percentile.
fn percentile(buckets: &[u64; NR_BUCKETS], total: u64, pct: u64) -> u64 {
    if total == 0 {
        return 0;
    }
    let target = (total * pct).div_ceil(100);
    let mut cumulative = 0;
    for (count, bound) in buckets.iter().zip(BUCKET_BOUNDS_NS) {
        cumulative += count;
        if cumulative >= target {
            return bound;
        }
    }
    BUCKET_BOUNDS_NS[NR_BUCKETS - 1]
}

/// Point-in-time copy of a [`RunHistogram`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistogramSnapshot {
    pub buckets: [u64; NR_BUCKETS],
    pub total: u64,
    /// Approximate percentiles, reported as bucket upper bounds.
    pub p50_ns: u64,
    pub p90_ns: u64,
    pub p99_ns: u64,
}
