//! Probetrace: verified bytecode probes for kernel tracing.
//!
//! Small eBPF-style programs are checked once at load time, attached to a
//! syscall, kprobe or uprobe key, and run on every hit of that key against a
//! read-only snapshot of the trapped registers. Probes report through
//! helpers that encode fixed-size events into a lock-free ring buffer, which
//! user space drains and decodes.
//!
//! # Modules
//!
//! - [`verifier`] - load-time safety checks, producing a [`ProbeProgram`]
//! - [`executor`] - bounds-checked interpreter
//! - [`helpers`] - helper table and standard helpers
//! - [`registry`] - key to probe-list map with atomic updates
//! - [`ringbuf`] - multi-producer trace ring
//! - [`event`] - event wire format
//! - [`runtime`] - everything above behind one handle
//!
//! # Quick Start
//!
//! ```ignore
//! use probetrace::{AttachmentKey, RuntimeConfig, TrapContext};
//!
//! let rt = probetrace::init(RuntimeConfig::default())?;
//! let id = rt.load(&bytecode, AttachmentKey::Syscall(0))?;
//!
//! // In the syscall entry path:
//! rt.dispatch(AttachmentKey::Syscall(nr), &trap);
//!
//! // In the reader:
//! for event in rt.read_events() {
//!     println!("{}", event?);
//! }
//! ```

#![no_std]

extern crate alloc;

#[macro_use]
extern crate log;

// =============================================================================
// Platform Abstraction (for testing support)
// =============================================================================

pub mod platform;

// =============================================================================
// Program Format and Loading
// =============================================================================

pub mod context;
pub mod insn;
pub mod verifier;

// =============================================================================
// Execution
// =============================================================================

pub mod executor;
pub mod helpers;

// =============================================================================
// Transport
// =============================================================================

pub mod event;
pub mod ringbuf;

// =============================================================================
// Runtime
// =============================================================================

pub mod config;
pub mod histogram;
pub mod registry;
pub mod runtime;
pub mod stats;
pub mod syscall;

pub use config::{ConfigError, RuntimeConfig};
pub use context::{AttachClass, AttachmentKey, TrapContext};
pub use event::{DecodeError, TraceEvent};
pub use executor::{ExecutionFault, FaultKind};
pub use helpers::{HelperDef, HelperTable};
pub use registry::ProbeId;
pub use ringbuf::{EventSink, RingBuffer};
pub use runtime::{DispatchReport, ProbeInfo, ProbeRuntime};
pub use verifier::{ProbeProgram, Reason, VerificationError};

// =============================================================================
// Initialization
// =============================================================================

/// Initialize the global probe runtime.
///
/// Call once after the memory allocator is ready. Later calls return the
/// runtime built by the first one.
pub fn init(config: RuntimeConfig) -> Result<&'static ProbeRuntime, ConfigError> {
    info!("Initializing probetrace...");
    info!("  - ring buffer: {} bytes", config.ring_capacity);
    info!("  - max program length: {} insns", config.max_insns);

    let rt = runtime::init(config)?;
    info!(
        "  - helpers: {} standard functions",
        helpers::SUPPORTED_HELPERS.len()
    );

    info!("probetrace initialization complete");
    Ok(rt)
}
