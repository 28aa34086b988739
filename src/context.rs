//! Trap context handed to probes and the keys probes attach to.

use core::fmt;

/// Number of general-purpose registers captured in a [`TrapContext`].
pub const NR_GENERAL_REGS: usize = 32;

/// Snapshot of machine state at the moment a trap was intercepted.
///
/// The host builds this value from its own trap frame and passes it by
/// reference to [`crate::runtime::ProbeRuntime::dispatch`]. Probes see it as a
/// read-only byte region whose layout is fixed by `#[repr(C)]`; use the
/// `*_OFFSET` constants when writing bytecode that reads it.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrapContext {
    /// General-purpose registers, in the host's architectural order.
    pub regs: [u64; NR_GENERAL_REGS],
    /// Program counter of the trapping instruction.
    pub pc: u64,
    /// Status/flags register.
    pub status: u64,
    /// Trap class or number (syscall number for syscall traps).
    pub trap_num: u64,
}

const _: () = assert!(core::mem::size_of::<TrapContext>() == TrapContext::SIZE);

impl TrapContext {
    /// Size of the context region visible to probes.
    pub const SIZE: usize = (NR_GENERAL_REGS + 3) * 8;
    /// Offset of `pc` inside the context region.
    pub const PC_OFFSET: usize = NR_GENERAL_REGS * 8;
    /// Offset of `status` inside the context region.
    pub const STATUS_OFFSET: usize = Self::PC_OFFSET + 8;
    /// Offset of `trap_num` inside the context region.
    pub const TRAP_NUM_OFFSET: usize = Self::STATUS_OFFSET + 8;

    /// Create an all-zero context for the given trap number.
    pub const fn new(trap_num: u64) -> Self {
        Self {
            regs: [0; NR_GENERAL_REGS],
            pc: 0,
            status: 0,
            trap_num,
        }
    }

    /// Offset of general register `idx` inside the context region.
    pub const fn reg_offset(idx: usize) -> usize {
        idx * 8
    }

    /// Set one general register.
    pub fn with_reg(mut self, idx: usize, value: u64) -> Self {
        if let Some(slot) = self.regs.get_mut(idx) {
            *slot = value;
        }
        self
    }

    /// Set the program counter.
    pub fn with_pc(mut self, pc: u64) -> Self {
        self.pc = pc;
        self
    }

    /// Set the status register.
    pub fn with_status(mut self, status: u64) -> Self {
        self.status = status;
        self
    }

    /// View the snapshot as the byte region probes read from.
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: `TrapContext` is `repr(C)` and made only of `u64`s, so it has
        // no padding and every byte is initialized.
        unsafe { core::slice::from_raw_parts(self as *const Self as *const u8, Self::SIZE) }
    }
}

impl Default for TrapContext {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Class of attachment point; selects the helper allow-list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AttachClass {
    /// System call entry.
    Syscall,
    /// Kernel instruction address.
    Kprobe,
    /// User-space instruction address.
    Uprobe,
}

impl AttachClass {
    /// Bit used for this class in a [`crate::helpers::ClassMask`].
    pub const fn bit(self) -> u8 {
        match self {
            Self::Syscall => 1 << 0,
            Self::Kprobe => 1 << 1,
            Self::Uprobe => 1 << 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Syscall => "syscall",
            Self::Kprobe => "kprobe",
            Self::Uprobe => "uprobe",
        }
    }
}

/// Identifier of the place a probe is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AttachmentKey {
    /// Syscall number.
    Syscall(u32),
    /// Kernel address.
    Kprobe(u64),
    /// User address.
    Uprobe(u64),
}

impl AttachmentKey {
    pub fn class(&self) -> AttachClass {
        match self {
            Self::Syscall(_) => AttachClass::Syscall,
            Self::Kprobe(_) => AttachClass::Kprobe,
            Self::Uprobe(_) => AttachClass::Uprobe,
        }
    }
}

impl fmt::Display for AttachmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Syscall(nr) => match syscall_name(*nr) {
                Some(name) => write!(f, "syscall:{}", name),
                None => write!(f, "syscall:{}", nr),
            },
            Self::Kprobe(addr) => write!(f, "kprobe:{:#x}", addr),
            Self::Uprobe(addr) => write!(f, "uprobe:{:#x}", addr),
        }
    }
}

/// Names of the syscalls probes are most often attached to, by number.
const SYSCALL_NAMES: &[&str] = &[
    "read", "write", "open", "close", "stat", "fstat", "lstat", "poll", "lseek", "mmap",
];

/// Name of syscall `nr`, if known.
pub fn syscall_name(nr: u32) -> Option<&'static str> {
    SYSCALL_NAMES.get(nr as usize).copied()
}
