//! Probe runtime.
//!
//! Ties the verifier, registry, executor and trace ring together. The
//! instrumented code calls [`ProbeRuntime::dispatch`] at an attachment point;
//! user space loads probes with [`ProbeRuntime::load`] and drains events with
//! [`ProbeRuntime::read_events`].

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Once;

use crate::config::{ConfigError, RuntimeConfig};
use crate::context::{AttachmentKey, TrapContext};
use crate::event::{DecodeError, TraceEvent};
use crate::executor::{self, ExecEnv};
use crate::helpers::HelperTable;
use crate::platform;
use crate::registry::{ProbeId, ProbeRegistry};
use crate::ringbuf::{Records, RingBuffer};
use crate::histogram::HistogramSnapshot;
use crate::stats::StatsSnapshot;
use crate::verifier::{ProbeProgram, VerificationError, Verifier};

/// Outcome of one [`ProbeRuntime::dispatch`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Probes run.
    pub invoked: usize,
    /// Probes aborted by a fault.
    pub faulted: usize,
}

impl DispatchReport {
    pub fn succeeded(&self) -> usize {
        self.invoked - self.faulted
    }
}

/// Summary of an installed probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeInfo {
    pub id: ProbeId,
    pub key: AttachmentKey,
    pub insn_count: usize,
    pub stack_depth: usize,
}

/// Probe engine instance.
pub struct ProbeRuntime {
    config: RuntimeConfig,
    helpers: HelperTable,
    registry: ProbeRegistry,
    ring: RingBuffer,
    verbose: AtomicBool,
}

impl ProbeRuntime {
    /// Runtime with the standard helper table.
    pub fn new(config: RuntimeConfig) -> Result<Self, ConfigError> {
        Self::with_helpers(config, HelperTable::standard())
    }

    pub fn with_helpers(config: RuntimeConfig, helpers: HelperTable) -> Result<Self, ConfigError> {
        config.validate()?;
        let ring = RingBuffer::new(config.ring_capacity)?;
        Ok(Self {
            verbose: AtomicBool::new(config.verbose),
            config,
            helpers,
            registry: ProbeRegistry::new(),
            ring,
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn helpers(&self) -> &HelperTable {
        &self.helpers
    }

    pub fn ring(&self) -> &RingBuffer {
        &self.ring
    }

    /// Enable or disable per-invocation logging.
    pub fn set_verbose(&self, enabled: bool) {
        self.verbose.store(enabled, Ordering::Relaxed);
        info!(
            "Probe verbose mode: {}",
            if enabled { "enabled" } else { "disabled" }
        );
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose.load(Ordering::Relaxed)
    }

    fn verifier(&self) -> Verifier<'_> {
        Verifier::new(&self.helpers).with_max_insns(self.config.max_insns)
    }

    /// Verify raw bytecode against this runtime's helpers and limits.
    pub fn verify(
        &self,
        bytes: &[u8],
        key: AttachmentKey,
    ) -> Result<ProbeProgram, VerificationError> {
        self.verifier().verify_bytes(bytes, key)
    }

    /// Verify and install a probe.
    pub fn load(&self, bytes: &[u8], key: AttachmentKey) -> Result<ProbeId, VerificationError> {
        let program = self.verify(bytes, key).inspect_err(|e| {
            warn!("Rejected probe for {}: {}", key, e);
        })?;
        Ok(self.insert(program))
    }

    /// Install a program verified elsewhere.
    ///
    /// The program is checked again against this runtime's helper table and
    /// instruction limit, which may be stricter than the ones it was first
    /// verified with.
    pub fn install(&self, program: ProbeProgram) -> Result<ProbeId, VerificationError> {
        let key = program.key();
        let program = self.verifier().verify(program.into_insns(), key).inspect_err(|e| {
            warn!("Rejected probe for {}: {}", key, e);
        })?;
        Ok(self.insert(program))
    }

    fn insert(&self, program: ProbeProgram) -> ProbeId {
        let key = program.key();
        let len = program.len();
        let id = self.registry.install(program);
        info!("Installed {} at {} ({} insns)", id, key, len);
        id
    }

    /// Detach probe `id`; `false` if it was not installed.
    ///
    /// Invocations already running finish on their own snapshot.
    pub fn detach(&self, id: ProbeId) -> bool {
        let removed = self.registry.detach(id);
        if removed {
            info!("Detached {}", id);
        }
        removed
    }

    /// Run every probe attached at `key`, in installation order.
    ///
    /// Never fails and never allocates: a faulting probe is logged, counted
    /// and skipped, and the remaining probes still run.
    pub fn dispatch(&self, key: AttachmentKey, trap: &TrapContext) -> DispatchReport {
        let mut report = DispatchReport::default();
        let Some(probes) = self.registry.lookup(&key) else {
            return report;
        };

        let env = ExecEnv::new(&self.helpers, &self.ring);
        for probe in probes.iter() {
            let start = platform::now_ns();
            let result = executor::run(&probe.program, trap, &env);
            let end = platform::now_ns();
            let elapsed = end.saturating_sub(start);

            report.invoked += 1;
            match result {
                Ok(ret) => {
                    probe.stats.record_run(end, elapsed, ret);
                    if self.is_verbose() {
                        info!("{} at {} returned {:#x}", probe.id, key, ret);
                    }
                }
                Err(fault) => {
                    report.faulted += 1;
                    probe.stats.record_fault(end, elapsed);
                    warn!("{} at {} aborted: {}", probe.id, key, fault);
                }
            }
        }
        report
    }

    /// Drain and decode pending trace events.
    pub fn read_events(&self) -> EventReader<'_> {
        EventReader {
            records: self.ring.read(),
        }
    }

    /// Events dropped because the ring was full.
    pub fn dropped_events(&self) -> u64 {
        self.ring.dropped()
    }

    /// Installed probes by ascending id.
    pub fn list_probes(&self) -> Vec<ProbeInfo> {
        self.registry
            .probes()
            .iter()
            .map(|p| ProbeInfo {
                id: p.id,
                key: p.program.key(),
                insn_count: p.program.len(),
                stack_depth: p.program.stack_depth(),
            })
            .collect()
    }

    pub fn probe_count(&self) -> usize {
        self.registry.len()
    }

    pub fn probe_stats(&self, id: ProbeId) -> Option<StatsSnapshot> {
        self.registry.get(id).map(|p| p.stats.snapshot())
    }

    /// Run-time distribution of probe `id`.
    pub fn probe_histogram(&self, id: ProbeId) -> Option<HistogramSnapshot> {
        self.registry.get(id).map(|p| p.stats.histogram_snapshot())
    }

    /// Clear the counters and histogram of probe `id`; `false` if it is not
    /// installed.
    pub fn reset_stats(&self, id: ProbeId) -> bool {
        match self.registry.get(id) {
            Some(probe) => {
                probe.stats.reset();
                debug!("Reset stats of {}", id);
                true
            }
            None => false,
        }
    }
}

/// Decoded view over [`RingBuffer::read`].
pub struct EventReader<'a> {
    records: Records<'a>,
}

impl Iterator for EventReader<'_> {
    type Item = Result<TraceEvent, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.records.next().map(|raw| TraceEvent::decode(&raw))
    }
}

// =============================================================================
// Global instance
// =============================================================================

static RUNTIME: Once<ProbeRuntime> = Once::new();

/// Build the process-wide runtime.
///
/// Later calls leave the first runtime in place and return it.
pub fn init(config: RuntimeConfig) -> Result<&'static ProbeRuntime, ConfigError> {
    if let Some(rt) = RUNTIME.get() {
        warn!("Probe runtime already initialized");
        return Ok(rt);
    }
    let rt = ProbeRuntime::new(config)?;
    Ok(RUNTIME.call_once(|| rt))
}

/// The process-wide runtime, if [`init`] has run.
pub fn global() -> Option<&'static ProbeRuntime> {
    RUNTIME.get()
}
