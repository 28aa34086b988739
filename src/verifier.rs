//! Load-time probe verifier.
//!
//! A probe is accepted only if it can be shown, without running it, that
//!
//! 1. it has between 1 and `max_insns` instructions,
//! 2. every instruction is one the executor implements, and every jump goes
//!    strictly forward to an instruction inside the program (so every run
//!    terminates in at most `len` steps),
//! 3. every load and store hits the trap context or the probe's stack at an
//!    offset known at load time, and the context is never written,
//! 4. every helper call names a helper allowed for the probe's attachment
//!    class, with arguments matching the helper's prototype,
//! 5. no instruction is unreachable, no path falls off the end, and `r0` is
//!    an initialized scalar at every `exit`.
//!
//! Because the control-flow graph is acyclic, a single forward pass that
//! merges register types at join points visits every path.
//!
//! The structural and dataflow passes both run before a verdict, and the
//! violation with the lowest instruction index is the one reported.

use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use crate::context::{AttachClass, AttachmentKey, TrapContext};
use crate::helpers::{ArgType, HELPER_TABLE_SIZE, HelperTable, MAX_HELPER_ARGS};
use crate::insn::{self, *};

/// Hard upper bound on program length.
pub const MAX_INSNS: usize = 4096;

/// Size of the per-invocation probe stack in bytes.
pub const STACK_SIZE: usize = 512;

/// Largest pointer offset tracked before a pointer is considered unbounded.
const MAX_PTR_OFFSET: i64 = 1 << 29;

/// Largest size argument considered before it is rejected outright.
const MAX_ACCESS_SIZE: u64 = 1 << 20;

const _: () = assert!(HELPER_TABLE_SIZE <= 32);

/// Why a program was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    /// Program has no instructions.
    Empty,
    /// Program is longer than the configured maximum.
    TooManyInstructions { count: usize, max: usize },
    /// Bytecode length is not a multiple of 8.
    TrailingBytes { len: usize },
    /// Opcode is not implemented.
    UnknownOpcode(u8),
    /// Register number above `r10`.
    InvalidRegister(u8),
    /// Instruction writes the frame pointer.
    FrameRegisterWrite,
    /// `LD_DW_IMM` without a valid second slot.
    MalformedImm64,
    /// Call to something other than a helper.
    UnsupportedCall,
    /// Jump to this or an earlier instruction.
    BackEdge { target: isize },
    /// Jump outside the program.
    JumpOutOfRange { target: isize },
    /// Jump into the second slot of an `LD_DW_IMM`.
    JumpIntoImm64 { target: usize },
    /// Execution can run past the last instruction.
    FallsOffEnd,
    /// No path reaches this instruction.
    Unreachable,
    /// Register read before it was written.
    UninitRegister(u8),
    /// Memory access through a register that is not a pointer.
    InvalidMemoryBase(u8),
    /// Memory access outside the context or stack.
    OutOfBounds { offset: i64, width: usize },
    /// Store into the read-only trap context.
    ContextWrite,
    /// Pointer offset cannot be bounded at load time.
    UnboundedPointer,
    /// ALU operation not permitted on pointers.
    PointerArithmetic,
    /// Conditional jump on a pointer.
    PointerComparison,
    /// `exit` with a pointer in `r0`.
    ReturnsPointer,
    /// Helper id not in the table.
    UnknownHelper(u32),
    /// Helper not allowed for this attachment class.
    HelperNotAllowed { helper: u32, class: AttachClass },
    /// Argument register has the wrong type (`arg` is 0-based).
    HelperArgType { arg: usize },
    /// Size argument is not a load-time constant.
    HelperSizeNotConst { arg: usize },
    /// Size argument exceeds the helper's maximum.
    HelperSizeTooLarge { arg: usize, size: u64, max: usize },
    /// Size argument is not a multiple of the helper's element size.
    HelperSizeMisaligned { arg: usize, size: u64, align: usize },
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty program"),
            Self::TooManyInstructions { count, max } => {
                write!(f, "{} instructions exceed the limit of {}", count, max)
            }
            Self::TrailingBytes { len } => {
                write!(f, "bytecode length {} is not a multiple of 8", len)
            }
            Self::UnknownOpcode(opc) => write!(f, "unknown opcode {:#04x}", opc),
            Self::InvalidRegister(r) => write!(f, "invalid register r{}", r),
            Self::FrameRegisterWrite => write!(f, "frame pointer r10 is read-only"),
            Self::MalformedImm64 => write!(f, "malformed lddw"),
            Self::UnsupportedCall => write!(f, "only helper calls are supported"),
            Self::BackEdge { target } => write!(f, "backward jump to {}", target),
            Self::JumpOutOfRange { target } => write!(f, "jump target {} out of range", target),
            Self::JumpIntoImm64 { target } => write!(f, "jump into the middle of lddw at {}", target),
            Self::FallsOffEnd => write!(f, "execution falls off the end of the program"),
            Self::Unreachable => write!(f, "unreachable instruction"),
            Self::UninitRegister(r) => write!(f, "r{} read before write", r),
            Self::InvalidMemoryBase(r) => write!(f, "r{} is not a pointer", r),
            Self::OutOfBounds { offset, width } => {
                write!(f, "access of {} bytes at offset {} is out of bounds", width, offset)
            }
            Self::ContextWrite => write!(f, "trap context is read-only"),
            Self::UnboundedPointer => write!(f, "pointer offset is not bounded"),
            Self::PointerArithmetic => write!(f, "prohibited pointer arithmetic"),
            Self::PointerComparison => write!(f, "pointer comparison"),
            Self::ReturnsPointer => write!(f, "r0 holds a pointer at exit"),
            Self::UnknownHelper(id) => write!(f, "unknown helper {}", id),
            Self::HelperNotAllowed { helper, class } => {
                write!(f, "helper {} not allowed for {} probes", helper, class.as_str())
            }
            Self::HelperArgType { arg } => write!(f, "helper argument {} has the wrong type", arg + 1),
            Self::HelperSizeNotConst { arg } => {
                write!(f, "helper argument {} must be a constant size", arg + 1)
            }
            Self::HelperSizeTooLarge { arg, size, max } => write!(
                f,
                "helper argument {} size {} exceeds maximum {}",
                arg + 1,
                size,
                max
            ),
            Self::HelperSizeMisaligned { arg, size, align } => write!(
                f,
                "helper argument {} size {} is not a multiple of {}",
                arg + 1,
                size,
                align
            ),
        }
    }
}

/// Rejection of a program at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerificationError {
    /// Index of the first violating instruction.
    pub index: usize,
    pub reason: Reason,
}

impl fmt::Display for VerificationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "verification failed at insn {}: {}", self.index, self.reason)
    }
}

impl core::error::Error for VerificationError {}

/// A verified probe, ready to install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeProgram {
    insns: Vec<Insn>,
    key: AttachmentKey,
    stack_depth: usize,
    helper_mask: u32,
}

impl ProbeProgram {
    /// Build a program without verifying it.
    ///
    /// The executor still bounds-checks every access of such a program
    /// against `stack_depth` and rejects helpers outside `helper_ids`.
    /// [`ProbeRuntime::install`](crate::ProbeRuntime::install) re-verifies
    /// whatever it is handed, so such a program can only reach the executor
    /// directly.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn from_raw_parts(
        insns: Vec<Insn>,
        key: AttachmentKey,
        stack_depth: usize,
        helper_ids: &[u32],
    ) -> Self {
        let helper_mask = helper_ids
            .iter()
            .filter(|&&id| (id as usize) < HELPER_TABLE_SIZE)
            .fold(0, |mask, &id| mask | (1 << id));
        Self {
            insns,
            key,
            stack_depth: stack_depth.min(STACK_SIZE),
            helper_mask,
        }
    }

    pub fn insns(&self) -> &[Insn] {
        &self.insns
    }

    pub fn into_insns(self) -> Vec<Insn> {
        self.insns
    }

    pub fn len(&self) -> usize {
        self.insns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insns.is_empty()
    }

    /// Attachment point this program was verified for.
    pub fn key(&self) -> AttachmentKey {
        self.key
    }

    /// Deepest stack byte the program touches, rounded up to 8.
    pub fn stack_depth(&self) -> usize {
        self.stack_depth
    }

    /// Number of 8-byte stack slots in use.
    pub fn stack_slots(&self) -> usize {
        self.stack_depth / 8
    }

    /// Whether the program calls helper `id`.
    pub fn uses_helper(&self, id: u32) -> bool {
        (id as usize) < HELPER_TABLE_SIZE && self.helper_mask & (1 << id) != 0
    }

    /// Helper ids the program calls, ascending.
    pub fn helper_ids(&self) -> impl Iterator<Item = u32> + '_ {
        (0..HELPER_TABLE_SIZE as u32).filter(|&id| self.uses_helper(id))
    }
}

/// Abstract value of a register during verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegType {
    Uninit,
    /// Integer, with its value when known.
    Scalar(Option<u64>),
    /// Pointer into the trap context at the given offset.
    Ctx(i64),
    /// Pointer relative to the frame pointer (`r10` is `Stack(0)`).
    Stack(i64),
}

impl RegType {
    fn merge(self, other: RegType) -> RegType {
        match (self, other) {
            (a, b) if a == b => a,
            (RegType::Scalar(_), RegType::Scalar(_)) => RegType::Scalar(None),
            _ => RegType::Uninit,
        }
    }

    fn is_pointer(self) -> bool {
        matches!(self, RegType::Ctx(_) | RegType::Stack(_))
    }

    fn with_offset(self, offset: i64) -> RegType {
        match self {
            RegType::Ctx(_) => RegType::Ctx(offset),
            RegType::Stack(_) => RegType::Stack(offset),
            other => other,
        }
    }

    fn offset(self) -> Option<i64> {
        match self {
            RegType::Ctx(off) | RegType::Stack(off) => Some(off),
            _ => None,
        }
    }
}

type RegState = [RegType; NR_REGS];

/// Probe verifier bound to a helper table.
pub struct Verifier<'a> {
    helpers: &'a HelperTable,
    max_insns: usize,
}

impl<'a> Verifier<'a> {
    pub fn new(helpers: &'a HelperTable) -> Self {
        Self {
            helpers,
            max_insns: MAX_INSNS,
        }
    }

    /// Lower the instruction limit (it never exceeds [`MAX_INSNS`]).
    pub fn with_max_insns(mut self, max_insns: usize) -> Self {
        self.max_insns = max_insns.min(MAX_INSNS);
        self
    }

    /// Decode raw bytecode and verify it.
    pub fn verify_bytes(
        &self,
        bytes: &[u8],
        key: AttachmentKey,
    ) -> Result<ProbeProgram, VerificationError> {
        let insns = insn::decode(bytes).map_err(|e| VerificationError {
            index: bytes.len() / INSN_SIZE,
            reason: Reason::TrailingBytes { len: e.len },
        })?;
        self.verify(insns, key)
    }

    /// Verify decoded instructions for attachment at `key`.
    pub fn verify(
        &self,
        insns: Vec<Insn>,
        key: AttachmentKey,
    ) -> Result<ProbeProgram, VerificationError> {
        if insns.is_empty() {
            return Err(VerificationError {
                index: 0,
                reason: Reason::Empty,
            });
        }
        if insns.len() > self.max_insns {
            return Err(VerificationError {
                index: self.max_insns,
                reason: Reason::TooManyInstructions {
                    count: insns.len(),
                    max: self.max_insns,
                },
            });
        }

        // The dataflow pass stops at the first structural violation; any
        // error it finds before that point has the lower index.
        let (imm_slots, structural) = check_structure(&insns);
        let limit = structural.map_or(insns.len(), |e| e.index);
        let (stack_depth, helper_mask) = self.check_dataflow(&insns, &imm_slots, limit, key)?;
        if let Some(err) = structural {
            return Err(err);
        }

        log::debug!(
            "verified probe for {}: {} insns, stack {} bytes, helper mask {:#x}",
            key,
            insns.len(),
            stack_depth,
            helper_mask
        );

        Ok(ProbeProgram {
            insns,
            key,
            stack_depth,
            helper_mask,
        })
    }

    fn check_dataflow(
        &self,
        insns: &[Insn],
        imm_slots: &[bool],
        limit: usize,
        key: AttachmentKey,
    ) -> Result<(usize, u32), VerificationError> {
        let n = insns.len();
        let mut states: Vec<Option<RegState>> = vec![None; n];

        let mut entry = [RegType::Uninit; NR_REGS];
        entry[1] = RegType::Ctx(0);
        entry[FRAME_REG as usize] = RegType::Stack(0);
        states[0] = Some(entry);

        let mut walk = Walk {
            helpers: self.helpers,
            key,
            depth: 0,
            helper_mask: 0,
        };

        for pc in 0..limit {
            if imm_slots[pc] {
                continue;
            }
            let regs = states[pc].ok_or(VerificationError {
                index: pc,
                reason: Reason::Unreachable,
            })?;
            let successors = walk.step(pc, &insns[pc], insns.get(pc + 1), regs).map_err(
                |reason| VerificationError { index: pc, reason },
            )?;

            for (target, out) in successors.into_iter().flatten() {
                if target >= n {
                    return Err(VerificationError {
                        index: pc,
                        reason: Reason::FallsOffEnd,
                    });
                }
                let slot = &mut states[target];
                *slot = Some(match slot {
                    Some(existing) => merge_states(existing, &out),
                    None => out,
                });
            }
        }

        let depth = walk.depth.div_ceil(8) * 8;
        Ok((depth.min(STACK_SIZE), walk.helper_mask))
    }
}

/// Verify `insns` for attachment at `key` against `helpers`.
pub fn verify(
    insns: Vec<Insn>,
    key: AttachmentKey,
    helpers: &HelperTable,
) -> Result<ProbeProgram, VerificationError> {
    Verifier::new(helpers).verify(insns, key)
}

fn merge_states(a: &RegState, b: &RegState) -> RegState {
    let mut out = *a;
    for (slot, other) in out.iter_mut().zip(b.iter()) {
        *slot = slot.merge(*other);
    }
    out
}

/// Structural pass: opcodes, registers, `LD_DW_IMM` pairing and jump targets.
///
/// Returns which slots hold the upper half of an `LD_DW_IMM`, and the
/// lowest-indexed violation if there is one. Slots past that violation are
/// not classified.
fn check_structure(insns: &[Insn]) -> (Vec<bool>, Option<VerificationError>) {
    let mut imm_slots = vec![false; insns.len()];
    let encoding = check_encoding(insns, &mut imm_slots).err();
    let limit = encoding.map_or(insns.len(), |e| e.index);

    // Targets below `limit` were range-checked by `check_encoding`.
    let into_imm = insns[..limit]
        .iter()
        .enumerate()
        .filter(|&(pc, _)| !imm_slots[pc])
        .find_map(|(pc, insn)| {
            let target = insn.jump_target(pc)? as usize;
            imm_slots[target].then_some(VerificationError {
                index: pc,
                reason: Reason::JumpIntoImm64 { target },
            })
        });

    (imm_slots, into_imm.or(encoding))
}

fn check_encoding(insns: &[Insn], imm_slots: &mut [bool]) -> Result<(), VerificationError> {
    let n = insns.len();

    let mut pc = 0;
    while pc < n {
        let insn = &insns[pc];
        let fail = |reason| Err(VerificationError { index: pc, reason });

        if insn.dst as usize >= NR_REGS {
            return fail(Reason::InvalidRegister(insn.dst));
        }
        if insn.src as usize >= NR_REGS {
            return fail(Reason::InvalidRegister(insn.src));
        }

        match insn.class() {
            BPF_LD => {
                if insn.opc != LD_DW_IMM {
                    return fail(Reason::UnknownOpcode(insn.opc));
                }
                if insn.dst == FRAME_REG {
                    return fail(Reason::FrameRegisterWrite);
                }
                let well_formed = insn.src == 0
                    && insns
                        .get(pc + 1)
                        .is_some_and(|next| next.opc == 0 && next.dst == 0 && next.src == 0 && next.off == 0);
                if !well_formed {
                    return fail(Reason::MalformedImm64);
                }
                imm_slots[pc + 1] = true;
                pc += 2;
                continue;
            }
            BPF_LDX => {
                if insn.mem_width().is_none() {
                    return fail(Reason::UnknownOpcode(insn.opc));
                }
                if insn.dst == FRAME_REG {
                    return fail(Reason::FrameRegisterWrite);
                }
            }
            BPF_ST | BPF_STX => {
                if insn.mem_width().is_none() {
                    return fail(Reason::UnknownOpcode(insn.opc));
                }
            }
            BPF_ALU | BPF_ALU64 => {
                if !is_alu_op(insn.op()) || (insn.op() == BPF_NEG && insn.uses_src_reg()) {
                    return fail(Reason::UnknownOpcode(insn.opc));
                }
                if insn.dst == FRAME_REG {
                    return fail(Reason::FrameRegisterWrite);
                }
            }
            BPF_JMP => match insn.op() {
                BPF_EXIT if insn.opc == EXIT => {}
                BPF_CALL if insn.opc == CALL => {
                    if insn.src != 0 {
                        return fail(Reason::UnsupportedCall);
                    }
                }
                BPF_JA if !insn.uses_src_reg() => {}
                op if is_cond_jump(op) => {}
                _ => return fail(Reason::UnknownOpcode(insn.opc)),
            },
            _ => return fail(Reason::UnknownOpcode(insn.opc)),
        }

        if let Some(target) = insn.jump_target(pc) {
            if target <= pc as isize {
                return fail(Reason::BackEdge { target });
            }
            if target >= n as isize {
                return fail(Reason::JumpOutOfRange { target });
            }
        }
        pc += 1;
    }

    Ok(())
}

/// Per-program state of the dataflow pass.
struct Walk<'a> {
    helpers: &'a HelperTable,
    key: AttachmentKey,
    depth: usize,
    helper_mask: u32,
}

/// Up to two successors of one instruction.
type Successors = [Option<(usize, RegState)>; 2];

impl Walk<'_> {
    fn step(
        &mut self,
        pc: usize,
        insn: &Insn,
        next: Option<&Insn>,
        mut regs: RegState,
    ) -> Result<Successors, Reason> {
        let dst = insn.dst as usize;
        let src = insn.src as usize;

        match insn.class() {
            BPF_LD => {
                let hi = next.map_or(0, |n| n.imm as u32 as u64);
                regs[dst] = RegType::Scalar(Some((insn.imm as u32 as u64) | (hi << 32)));
                return Ok([Some((pc + 2, regs)), None]);
            }
            BPF_LDX => {
                let width = insn.mem_width().unwrap_or(8);
                self.check_access(regs[src], insn.src, insn.off as i64, width as u64, false)?;
                regs[dst] = RegType::Scalar(None);
            }
            BPF_ST => {
                let width = insn.mem_width().unwrap_or(8);
                self.check_access(regs[dst], insn.dst, insn.off as i64, width as u64, true)?;
            }
            BPF_STX => {
                let width = insn.mem_width().unwrap_or(8);
                if regs[src] == RegType::Uninit {
                    return Err(Reason::UninitRegister(insn.src));
                }
                self.check_access(regs[dst], insn.dst, insn.off as i64, width as u64, true)?;
            }
            BPF_ALU | BPF_ALU64 => {
                regs[dst] = alu_result(insn, &regs)?;
            }
            _ => match insn.op() {
                BPF_EXIT => {
                    return match regs[0] {
                        RegType::Scalar(_) => Ok([None, None]),
                        RegType::Uninit => Err(Reason::UninitRegister(0)),
                        _ => Err(Reason::ReturnsPointer),
                    };
                }
                BPF_CALL => {
                    self.check_call(insn.imm as u32, &regs)?;
                    regs[0] = RegType::Scalar(None);
                    for reg in regs.iter_mut().take(MAX_HELPER_ARGS + 1).skip(1) {
                        *reg = RegType::Uninit;
                    }
                }
                BPF_JA => {
                    let target = (pc as isize + 1 + insn.off as isize) as usize;
                    return Ok([Some((target, regs)), None]);
                }
                _ => {
                    let lhs = read(&regs, insn.dst)?;
                    let rhs = if insn.uses_src_reg() {
                        read(&regs, insn.src)?
                    } else {
                        RegType::Scalar(Some(insn.imm as i64 as u64))
                    };
                    if lhs.is_pointer() || rhs.is_pointer() {
                        return Err(Reason::PointerComparison);
                    }
                    let target = (pc as isize + 1 + insn.off as isize) as usize;
                    return Ok([Some((pc + 1, regs)), Some((target, regs))]);
                }
            },
        }

        Ok([Some((pc + 1, regs)), None])
    }

    /// Check an access of `width` bytes at `base + off`.
    fn check_access(
        &mut self,
        base: RegType,
        reg: u8,
        off: i64,
        width: u64,
        write: bool,
    ) -> Result<(), Reason> {
        let (ptr_off, is_stack) = match base {
            RegType::Uninit => return Err(Reason::UninitRegister(reg)),
            RegType::Scalar(_) => return Err(Reason::InvalidMemoryBase(reg)),
            RegType::Ctx(_) if write => return Err(Reason::ContextWrite),
            RegType::Ctx(o) => (o, false),
            RegType::Stack(o) => (o, true),
        };

        let offset = ptr_off + off;
        let out_of_bounds = Reason::OutOfBounds {
            offset,
            width: width as usize,
        };
        if width > MAX_ACCESS_SIZE {
            return Err(out_of_bounds);
        }
        let end = offset + width as i64;

        if is_stack {
            if offset < -(STACK_SIZE as i64) || end > 0 {
                return Err(out_of_bounds);
            }
            self.depth = self.depth.max((-offset) as usize);
        } else if offset < 0 || end > TrapContext::SIZE as i64 {
            return Err(out_of_bounds);
        }
        Ok(())
    }

    fn check_call(&mut self, id: u32, regs: &RegState) -> Result<(), Reason> {
        let def = self.helpers.get(id).ok_or(Reason::UnknownHelper(id))?;
        let class = self.key.class();
        if !def.classes.contains(class) {
            return Err(Reason::HelperNotAllowed { helper: id, class });
        }

        for (arg, kind) in def.args.iter().enumerate() {
            let reg = (arg + 1) as u8;
            match *kind {
                ArgType::Unused => {}
                ArgType::Scalar => match read(regs, reg)? {
                    RegType::Scalar(_) => {}
                    _ => return Err(Reason::HelperArgType { arg }),
                },
                ArgType::Size { max, align } => {
                    const_size(regs, arg, max, align)?;
                }
                mem => {
                    let (max, align) = match def.args.get(arg + 1) {
                        Some(&ArgType::Size { max, align }) => (max, align),
                        _ => return Err(Reason::HelperArgType { arg }),
                    };
                    let size = const_size(regs, arg + 1, max, align)?;
                    match read(regs, reg)? {
                        RegType::Scalar(Some(0)) if mem == ArgType::MemOrNull && size == 0 => {}
                        ptr @ (RegType::Ctx(_) | RegType::Stack(_)) => {
                            self.check_access(ptr, reg, 0, size, mem == ArgType::WritableMem)?;
                        }
                        _ => return Err(Reason::HelperArgType { arg }),
                    }
                }
            }
        }

        self.helper_mask |= 1 << id;
        Ok(())
    }
}

fn read(regs: &RegState, reg: u8) -> Result<RegType, Reason> {
    match regs[reg as usize] {
        RegType::Uninit => Err(Reason::UninitRegister(reg)),
        other => Ok(other),
    }
}

/// Value of size argument `arg`, which must be a constant multiple of
/// `align` no larger than `max`.
fn const_size(regs: &RegState, arg: usize, max: usize, align: usize) -> Result<u64, Reason> {
    match read(regs, (arg + 1) as u8)? {
        RegType::Scalar(Some(size)) if size > max as u64 => {
            Err(Reason::HelperSizeTooLarge { arg, size, max })
        }
        RegType::Scalar(Some(size)) if align > 1 && size % align as u64 != 0 => {
            Err(Reason::HelperSizeMisaligned { arg, size, align })
        }
        RegType::Scalar(Some(size)) => Ok(size),
        RegType::Scalar(None) => Err(Reason::HelperSizeNotConst { arg }),
        _ => Err(Reason::HelperArgType { arg }),
    }
}

/// Abstract result of an ALU instruction.
fn alu_result(insn: &Insn, regs: &RegState) -> Result<RegType, Reason> {
    let op = insn.op();
    let is64 = insn.class() == BPF_ALU64;
    let eval = if is64 { alu64 } else { alu32 };

    let src = if insn.uses_src_reg() {
        read(regs, insn.src)?
    } else {
        RegType::Scalar(Some(insn.imm as i64 as u64))
    };

    if op == BPF_MOV {
        return match src {
            RegType::Scalar(v) => Ok(RegType::Scalar(v.map(|v| eval(BPF_MOV, 0, v)))),
            ptr if is64 => Ok(ptr),
            _ => Err(Reason::PointerArithmetic),
        };
    }

    let dst = read(regs, insn.dst)?;
    if op == BPF_NEG {
        return match dst {
            RegType::Scalar(v) => Ok(RegType::Scalar(v.map(|v| eval(BPF_NEG, v, 0)))),
            _ => Err(Reason::PointerArithmetic),
        };
    }

    match (dst, src) {
        (RegType::Scalar(a), RegType::Scalar(b)) => {
            Ok(RegType::Scalar(a.zip(b).map(|(a, b)| eval(op, a, b))))
        }
        (ptr, RegType::Scalar(delta)) if ptr.is_pointer() && is64 && matches!(op, BPF_ADD | BPF_SUB) => {
            let delta = delta.ok_or(Reason::UnboundedPointer)? as i64;
            let delta = if op == BPF_SUB { delta.checked_neg() } else { Some(delta) };
            move_pointer(ptr, delta)
        }
        (RegType::Scalar(delta), ptr) if ptr.is_pointer() && is64 && op == BPF_ADD => {
            move_pointer(ptr, delta.map(|d| d as i64))
        }
        _ => Err(Reason::PointerArithmetic),
    }
}

fn move_pointer(ptr: RegType, delta: Option<i64>) -> Result<RegType, Reason> {
    let offset = delta
        .zip(ptr.offset())
        .and_then(|(d, o)| o.checked_add(d))
        .filter(|o| o.unsigned_abs() <= MAX_PTR_OFFSET as u64)
        .ok_or(Reason::UnboundedPointer)?;
    Ok(ptr.with_offset(offset))
}
