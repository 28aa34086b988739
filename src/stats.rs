//! Per-probe run statistics.
//!
//! Updated from probe context with relaxed atomics only; readers get a
//! consistent-enough [`StatsSnapshot`] without stopping dispatch.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::histogram::{HistogramSnapshot, RunHistogram};

/// Counters kept for one installed probe.
#[derive(Debug)]
pub struct ProbeStats {
    runs: AtomicU64,
    faults: AtomicU64,
    last_ret: AtomicU64,
    last_run_ns: AtomicU64,
    total_ns: AtomicU64,
    min_ns: AtomicU64,
    max_ns: AtomicU64,
    histogram: RunHistogram,
}

impl ProbeStats {
    pub const fn new() -> Self {
        Self {
            runs: AtomicU64::new(0),
            faults: AtomicU64::new(0),
            last_ret: AtomicU64::new(0),
            last_run_ns: AtomicU64::new(0),
            total_ns: AtomicU64::new(0),
            min_ns: AtomicU64::new(u64::MAX),
            max_ns: AtomicU64::new(0),
            histogram: RunHistogram::new(),
        }
    }

    /// Record a run that returned `ret`.
    pub fn record_run(&self, timestamp: u64, duration_ns: u64, ret: u64) {
        self.last_ret.store(ret, Ordering::Relaxed);
        self.record(timestamp, duration_ns);
    }

    /// Record a run that faulted.
    pub fn record_fault(&self, timestamp: u64, duration_ns: u64) {
        self.faults.fetch_add(1, Ordering::Relaxed);
        self.record(timestamp, duration_ns);
    }

    fn record(&self, timestamp: u64, duration_ns: u64) {
        self.runs.fetch_add(1, Ordering::Relaxed);
        self.total_ns.fetch_add(duration_ns, Ordering::Relaxed);
        self.last_run_ns.store(timestamp, Ordering::Relaxed);
        self.min_ns.fetch_min(duration_ns, Ordering::Relaxed);
        self.max_ns.fetch_max(duration_ns, Ordering::Relaxed);
        self.histogram.record(duration_ns);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let runs = self.runs.load(Ordering::Relaxed);
        let total_ns = self.total_ns.load(Ordering::Relaxed);
        let min_ns = self.min_ns.load(Ordering::Relaxed);

        StatsSnapshot {
            runs,
            faults: self.faults.load(Ordering::Relaxed),
            last_ret: self.last_ret.load(Ordering::Relaxed),
            last_run_ns: self.last_run_ns.load(Ordering::Relaxed),
            total_ns,
            min_ns: if min_ns == u64::MAX { 0 } else { min_ns },
            max_ns: self.max_ns.load(Ordering::Relaxed),
            avg_ns: total_ns.checked_div(runs).unwrap_or(0),
        }
    }

    pub fn histogram_snapshot(&self) -> HistogramSnapshot {
        self.histogram.snapshot()
    }

    pub fn reset(&self) {
        self.runs.store(0, Ordering::Relaxed);
        self.faults.store(0, Ordering::Relaxed);
        self.last_ret.store(0, Ordering::Relaxed);
        self.last_run_ns.store(0, Ordering::Relaxed);
        self.total_ns.store(0, Ordering::Relaxed);
        self.min_ns.store(u64::MAX, Ordering::Relaxed);
        self.max_ns.store(0, Ordering::Relaxed);
        self.histogram.reset();
    }
}

impl Default for ProbeStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable copy of [`ProbeStats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Invocations, including faulted ones.
    pub runs: u64,
    pub faults: u64,
    /// `r0` of the last successful run.
    pub last_ret: u64,
    /// Timestamp of the last run.
    pub last_run_ns: u64,
    pub total_ns: u64,
    pub min_ns: u64,
    pub max_ns: u64,
    pub avg_ns: u64,
}
