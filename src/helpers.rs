//! Probe helper functions.
//!
//! Helpers are the only way a probe reaches outside its registers, stack and
//! trap context. They live in a fixed-size table indexed by helper id; each
//! entry carries an argument prototype, checked by the verifier at load time,
//! and an allow-list of attachment classes, checked by both the verifier and
//! the executor. Hosts extend the table with [`HelperTable::register`].
//!
//! Standard ids follow the Linux BPF numbering where one exists.

use core::fmt;

use crate::context::{AttachClass, AttachmentKey, syscall_name};
use crate::event::{self, EncodedEvent, MAX_FIELDS, MAX_PAYLOAD, PRINTK_EVENT_KIND};
use crate::platform;
use crate::ringbuf::EventSink;

/// Number of slots in a helper table; valid ids are `0..HELPER_TABLE_SIZE`.
pub const HELPER_TABLE_SIZE: usize = 32;

/// Number of helper arguments (`r1`..`r5`).
pub const MAX_HELPER_ARGS: usize = 5;

/// Negative errno returned when the ring buffer had no room.
pub const ERR_NOSPC: u64 = -28i64 as u64;

/// Negative errno returned when a lookup found nothing.
pub const ERR_NOENT: u64 = -2i64 as u64;

/// Standard helper ids.
pub mod id {
    /// emit_event(kind, fields, fields_size, payload, payload_size) -> 0 or -ENOSPC
    pub const EMIT_EVENT: u32 = 1;
    /// ktime_get_ns() -> nanoseconds
    pub const KTIME_GET_NS: u32 = 5;
    /// trace_printk(fmt, fmt_size, p1, p2, p3) -> bytes recorded or -ENOSPC
    pub const TRACE_PRINTK: u32 = 6;
    /// get_smp_processor_id() -> CPU id
    pub const GET_SMP_PROCESSOR_ID: u32 = 8;
    /// get_syscall_name(buf, size) -> name length or -ENOENT (syscall probes only)
    pub const GET_SYSCALL_NAME: u32 = 9;
}

/// List of standard helper ids.
pub const SUPPORTED_HELPERS: &[u32] = &[
    id::EMIT_EVENT,
    id::KTIME_GET_NS,
    id::TRACE_PRINTK,
    id::GET_SMP_PROCESSOR_ID,
    id::GET_SYSCALL_NAME,
];

/// Shape of one helper argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    /// Argument not used; the register is not checked.
    Unused,
    /// Any initialized scalar.
    Scalar,
    /// Readable memory (context or stack); size in the next argument.
    Mem,
    /// Like `Mem`, or the constant 0 together with a size of 0.
    MemOrNull,
    /// Writable stack memory; size in the next argument.
    WritableMem,
    /// Constant byte count for the previous memory argument: at most `max`
    /// and a multiple of `align`.
    Size { max: usize, align: usize },
}

impl ArgType {
    /// Size argument without an upper bound.
    pub const ANY_SIZE: ArgType = ArgType::Size {
        max: usize::MAX,
        align: 1,
    };

    pub fn is_mem(self) -> bool {
        matches!(self, Self::Mem | Self::MemOrNull | Self::WritableMem)
    }
}

/// Set of attachment classes a helper may be called from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassMask(u8);

impl ClassMask {
    pub const ALL: ClassMask = ClassMask(
        AttachClass::Syscall.bit() | AttachClass::Kprobe.bit() | AttachClass::Uprobe.bit(),
    );

    pub const fn only(class: AttachClass) -> Self {
        Self(class.bit())
    }

    pub const fn with(self, class: AttachClass) -> Self {
        Self(self.0 | class.bit())
    }

    pub const fn contains(self, class: AttachClass) -> bool {
        self.0 & class.bit() != 0
    }
}

/// Which region a resolved memory argument points into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Context,
    Stack,
}

/// Memory argument resolved and bounds-checked by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRange {
    pub region: Region,
    pub start: usize,
    pub len: usize,
}

/// Failure reported by a helper; aborts the current invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperFault {
    /// Argument `arg` was expected to be memory but was not resolved.
    NotMemory { arg: usize },
    /// Argument `arg` points to memory the probe may not write.
    NotWritable { arg: usize },
    /// Size argument `arg` is not a whole number of elements.
    Misaligned { arg: usize, len: usize },
}

impl fmt::Display for HelperFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotMemory { arg } => write!(f, "argument {} is not a memory region", arg + 1),
            Self::NotWritable { arg } => write!(f, "argument {} is not writable", arg + 1),
            Self::Misaligned { arg, len } => {
                write!(f, "argument {} size {} is not a whole number of elements", arg + 1, len)
            }
        }
    }
}

/// Arguments and environment of one helper invocation.
pub struct HelperCall<'a> {
    args: [u64; MAX_HELPER_ARGS],
    ranges: [Option<MemRange>; MAX_HELPER_ARGS],
    ctx: &'a [u8],
    stack: &'a mut [u8],
    key: AttachmentKey,
    sink: &'a dyn EventSink,
}

impl<'a> HelperCall<'a> {
    pub(crate) fn new(
        args: [u64; MAX_HELPER_ARGS],
        ranges: [Option<MemRange>; MAX_HELPER_ARGS],
        ctx: &'a [u8],
        stack: &'a mut [u8],
        key: AttachmentKey,
        sink: &'a dyn EventSink,
    ) -> Self {
        Self {
            args,
            ranges,
            ctx,
            stack,
            key,
            sink,
        }
    }

    /// Raw value of argument `idx` (0-based, `r1` is 0).
    pub fn arg(&self, idx: usize) -> u64 {
        self.args[idx]
    }

    /// Attachment the running probe is bound to.
    pub fn key(&self) -> AttachmentKey {
        self.key
    }

    /// Bytes of memory argument `idx`; empty for a null argument.
    pub fn bytes(&self, idx: usize) -> &[u8] {
        match self.ranges[idx] {
            Some(MemRange {
                region: Region::Context,
                start,
                len,
            }) => &self.ctx[start..start + len],
            Some(MemRange {
                region: Region::Stack,
                start,
                len,
            }) => &self.stack[start..start + len],
            None => &[],
        }
    }

    /// Writable bytes of memory argument `idx`.
    pub fn bytes_mut(&mut self, idx: usize) -> Result<&mut [u8], HelperFault> {
        match self.ranges[idx] {
            Some(MemRange {
                region: Region::Stack,
                start,
                len,
            }) => Ok(&mut self.stack[start..start + len]),
            Some(_) => Err(HelperFault::NotWritable { arg: idx }),
            None => Err(HelperFault::NotMemory { arg: idx }),
        }
    }

    /// Push an encoded event to the sink.
    pub fn emit(&self, event: &EncodedEvent) -> bool {
        self.sink.try_write(event.as_bytes())
    }
}

/// Helper function signature.
pub type HelperFn = fn(&mut HelperCall<'_>) -> Result<u64, HelperFault>;

/// One helper table entry.
#[derive(Clone, Copy)]
pub struct HelperDef {
    pub name: &'static str,
    pub args: [ArgType; MAX_HELPER_ARGS],
    pub classes: ClassMask,
    pub func: HelperFn,
}

impl HelperDef {
    /// Every memory argument is followed by its size, every size follows a
    /// memory argument, and size alignments are powers of two.
    pub fn is_well_formed(&self) -> bool {
        self.args.iter().enumerate().all(|(i, arg)| match arg {
            a if a.is_mem() => matches!(self.args.get(i + 1), Some(ArgType::Size { .. })),
            ArgType::Size { align, .. } => {
                i > 0 && self.args[i - 1].is_mem() && align.is_power_of_two()
            }
            _ => true,
        })
    }
}

impl fmt::Debug for HelperDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HelperDef")
            .field("name", &self.name)
            .field("args", &self.args)
            .field("classes", &self.classes)
            .finish()
    }
}

/// Errors from helper table registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperError {
    /// Id does not fit in the table.
    IdOutOfRange(u32),
    /// Slot already taken.
    AlreadyRegistered(u32),
    /// Prototype pairs memory and size arguments incorrectly.
    InvalidPrototype(u32),
}

impl fmt::Display for HelperError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IdOutOfRange(id) => write!(f, "Helper id {} out of range", id),
            Self::AlreadyRegistered(id) => write!(f, "Helper {} already registered", id),
            Self::InvalidPrototype(id) => write!(f, "Helper {} has an invalid prototype", id),
        }
    }
}

impl core::error::Error for HelperError {}

/// Fixed jump table of helpers, indexed by id.
#[derive(Clone)]
pub struct HelperTable {
    slots: [Option<HelperDef>; HELPER_TABLE_SIZE],
}

impl HelperTable {
    /// Table with no helpers.
    pub const fn empty() -> Self {
        Self {
            slots: [None; HELPER_TABLE_SIZE],
        }
    }

    /// Table with the standard helpers installed.
    pub fn standard() -> Self {
        let mut table = Self::empty();
        for &id in SUPPORTED_HELPERS {
            if let Some(def) = standard_helper(id)
                && let Err(e) = table.register(id, def)
            {
                log::warn!("Failed to register helper {}: {}", id, e);
            }
        }
        log::debug!("Registered {} helpers", table.len());
        table
    }

    /// Install a helper at `id`.
    pub fn register(&mut self, id: u32, def: HelperDef) -> Result<(), HelperError> {
        let slot = self
            .slots
            .get_mut(id as usize)
            .ok_or(HelperError::IdOutOfRange(id))?;
        if slot.is_some() {
            return Err(HelperError::AlreadyRegistered(id));
        }
        if !def.is_well_formed() {
            return Err(HelperError::InvalidPrototype(id));
        }
        *slot = Some(def);
        Ok(())
    }

    /// Look up a helper by id.
    pub fn get(&self, id: u32) -> Option<&HelperDef> {
        self.slots.get(id as usize)?.as_ref()
    }

    /// Number of installed helpers.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of installed helpers, ascending.
    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| i as u32))
    }
}

impl Default for HelperTable {
    fn default() -> Self {
        Self::standard()
    }
}

impl fmt::Debug for HelperTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(
                self.slots
                    .iter()
                    .enumerate()
                    .filter_map(|(i, s)| s.as_ref().map(|d| (i, d.name))),
            )
            .finish()
    }
}

// =============================================================================
// Standard helpers
// =============================================================================

/// emit_event - encode one trace event and push it to the ring buffer.
///
/// r1 = kind, r2/r3 = fields and their size in bytes (whole u64s),
/// r4/r5 = optional payload and its size (truncated to `MAX_PAYLOAD`).
fn helper_emit_event(call: &mut HelperCall<'_>) -> Result<u64, HelperFault> {
    let raw_fields = call.bytes(1);
    if raw_fields.len() % 8 != 0 {
        return Err(HelperFault::Misaligned {
            arg: 2,
            len: raw_fields.len(),
        });
    }

    let mut fields = [0u64; MAX_FIELDS];
    let mut nr_fields = 0;
    for (slot, chunk) in fields.iter_mut().zip(raw_fields.chunks_exact(8)) {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(chunk);
        *slot = u64::from_ne_bytes(raw);
        nr_fields += 1;
    }

    let encoded = event::encode(call.arg(0) as u32, &fields[..nr_fields], Some(call.bytes(3)));
    Ok(if call.emit(&encoded) { 0 } else { ERR_NOSPC })
}

/// ktime_get_ns - current monotonic time in nanoseconds.
fn helper_ktime_get_ns(_call: &mut HelperCall<'_>) -> Result<u64, HelperFault> {
    Ok(platform::now_ns())
}

/// trace_printk - record a format string and three arguments.
///
/// The format is a C string: bytes up to the first NUL (or the whole buffer,
/// capped at `MAX_PAYLOAD`) become the payload of a `PRINTK_EVENT_KIND` event
/// whose fields are p1, p2, p3. Formatting happens in the consumer.
fn helper_trace_printk(call: &mut HelperCall<'_>) -> Result<u64, HelperFault> {
    let fmt = call.bytes(0);
    let end = fmt.iter().position(|&b| b == 0).unwrap_or(fmt.len());
    let fmt = &fmt[..end.min(MAX_PAYLOAD)];

    let params = [call.arg(2), call.arg(3), call.arg(4)];
    log::debug!(
        "[probe_printk] {} {:?}",
        core::str::from_utf8(fmt).unwrap_or("<binary>"),
        params
    );

    let encoded = event::encode(PRINTK_EVENT_KIND, &params, Some(fmt));
    Ok(if call.emit(&encoded) {
        fmt.len() as u64
    } else {
        ERR_NOSPC
    })
}

/// get_smp_processor_id - CPU that took the trap.
fn helper_get_smp_processor_id(_call: &mut HelperCall<'_>) -> Result<u64, HelperFault> {
    Ok(platform::cpu_id() as u64)
}

/// get_syscall_name - write the attached syscall's name into `buf`.
///
/// The buffer is zero-filled first; names longer than the buffer are cut.
fn helper_get_syscall_name(call: &mut HelperCall<'_>) -> Result<u64, HelperFault> {
    let name = match call.key() {
        AttachmentKey::Syscall(nr) => syscall_name(nr),
        _ => None,
    };

    let buf = call.bytes_mut(0)?;
    buf.fill(0);
    let Some(name) = name else {
        return Ok(ERR_NOENT);
    };
    let len = name.len().min(buf.len());
    buf[..len].copy_from_slice(&name.as_bytes()[..len]);
    Ok(name.len() as u64)
}

/// Definition of a standard helper by id.
pub fn standard_helper(id: u32) -> Option<HelperDef> {
    use ArgType::*;

    let def = match id {
        id::EMIT_EVENT => HelperDef {
            name: "emit_event",
            args: [
                Scalar,
                MemOrNull,
                Size {
                    max: MAX_FIELDS * 8,
                    align: 8,
                },
                MemOrNull,
                ArgType::ANY_SIZE,
            ],
            classes: ClassMask::ALL,
            func: helper_emit_event,
        },
        id::KTIME_GET_NS => HelperDef {
            name: "ktime_get_ns",
            args: [Unused; MAX_HELPER_ARGS],
            classes: ClassMask::ALL,
            func: helper_ktime_get_ns,
        },
        id::TRACE_PRINTK => HelperDef {
            name: "trace_printk",
            args: [Mem, ArgType::ANY_SIZE, Scalar, Scalar, Scalar],
            classes: ClassMask::ALL,
            func: helper_trace_printk,
        },
        id::GET_SMP_PROCESSOR_ID => HelperDef {
            name: "get_smp_processor_id",
            args: [Unused; MAX_HELPER_ARGS],
            classes: ClassMask::ALL,
            func: helper_get_smp_processor_id,
        },
        id::GET_SYSCALL_NAME => HelperDef {
            name: "get_syscall_name",
            args: [WritableMem, ArgType::ANY_SIZE, Unused, Unused, Unused],
            classes: ClassMask::only(AttachClass::Syscall),
            func: helper_get_syscall_name,
        },
        _ => return None,
    };
    Some(def)
}
