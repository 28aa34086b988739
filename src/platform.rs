//! Time and CPU identity for the probe path.
//!
//! Kernel builds with the `axhal` feature read the hardware clock and the
//! per-CPU id. Every other build, the test suite included, reads the values
//! held in [`mock`].

/// When and where an event was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stamp {
    pub timestamp_ns: u64,
    pub cpu_id: u32,
}

/// Read the clock and the current CPU together.
#[inline]
pub fn stamp() -> Stamp {
    Stamp {
        timestamp_ns: source::now_ns(),
        cpu_id: source::cpu_id(),
    }
}

/// Monotonic time in nanoseconds.
#[inline]
pub fn now_ns() -> u64 {
    source::now_ns()
}

/// Id of the CPU running the caller.
#[inline]
pub fn cpu_id() -> u32 {
    source::cpu_id()
}

#[cfg(all(not(test), feature = "axhal"))]
mod source {
    pub fn now_ns() -> u64 {
        axhal::time::monotonic_time().as_nanos() as u64
    }

    pub fn cpu_id() -> u32 {
        axhal::percpu::this_cpu_id() as u32
    }
}

#[cfg(any(test, not(feature = "axhal")))]
use mock as source;

/// Settable clock and CPU id used when no hardware source is compiled in.
pub mod mock {
    use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

    static NOW_NS: AtomicU64 = AtomicU64::new(1_000_000_000);
    static CPU: AtomicU32 = AtomicU32::new(0);

    pub fn set_time(ns: u64) {
        NOW_NS.store(ns, Ordering::Relaxed);
    }

    pub fn advance(ns: u64) {
        NOW_NS.fetch_add(ns, Ordering::Relaxed);
    }

    pub fn set_cpu(id: u32) {
        CPU.store(id, Ordering::Relaxed);
    }

    pub fn now_ns() -> u64 {
        NOW_NS.load(Ordering::Relaxed)
    }

    pub fn cpu_id() -> u32 {
        CPU.load(Ordering::Relaxed)
    }
}
