//! Runtime configuration.

use core::fmt;

use crate::ringbuf::{MIN_CAPACITY, RingBufError};
use crate::verifier::MAX_INSNS;

/// Default trace ring size in bytes.
pub const DEFAULT_RING_CAPACITY: usize = 64 * 1024;

/// Settings for a [`crate::runtime::ProbeRuntime`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Ring buffer capacity in bytes; a power of two.
    pub ring_capacity: usize,
    /// Longest program accepted at load time.
    pub max_insns: usize,
    /// Log every probe invocation at info level.
    pub verbose: bool,
}

impl RuntimeConfig {
    pub fn with_ring_capacity_kb(mut self, kb: usize) -> Self {
        self.ring_capacity = kb * 1024;
        self
    }

    pub fn with_max_insns(mut self, max_insns: usize) -> Self {
        self.max_insns = max_insns;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.ring_capacity.is_power_of_two() {
            return Err(ConfigError::RingCapacity(RingBufError::NotPowerOfTwo(
                self.ring_capacity,
            )));
        }
        if self.ring_capacity < MIN_CAPACITY {
            return Err(ConfigError::RingCapacity(RingBufError::TooSmall(
                self.ring_capacity,
            )));
        }
        if self.max_insns == 0 || self.max_insns > MAX_INSNS {
            return Err(ConfigError::MaxInsns(self.max_insns));
        }
        Ok(())
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            ring_capacity: DEFAULT_RING_CAPACITY,
            max_insns: MAX_INSNS,
            verbose: false,
        }
    }
}

/// Invalid [`RuntimeConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    RingCapacity(RingBufError),
    /// `max_insns` outside `1..=MAX_INSNS`.
    MaxInsns(usize),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RingCapacity(e) => write!(f, "Invalid ring capacity: {}", e),
            Self::MaxInsns(n) => write!(f, "max_insns must be in 1..={}, got {}", MAX_INSNS, n),
        }
    }
}

impl core::error::Error for ConfigError {}

impl From<RingBufError> for ConfigError {
    fn from(e: RingBufError) -> Self {
        Self::RingCapacity(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert_eq!(RuntimeConfig::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_odd_ring_and_zero_insns() {
        let cfg = RuntimeConfig::default().with_ring_capacity_kb(3);
        assert!(matches!(cfg.validate(), Err(ConfigError::RingCapacity(_))));
        let cfg = RuntimeConfig::default().with_max_insns(0);
        assert_eq!(cfg.validate(), Err(ConfigError::MaxInsns(0)));
    }
}
