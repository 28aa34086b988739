//! Probe interpreter.
//!
//! Runs a verified [`ProbeProgram`] against one trap context. Registers hold
//! virtual addresses: `r1` starts at [`CTX_BASE`] and `r10` at the top of the
//! stack window starting at [`STACK_BASE`]. Every load, store and helper
//! memory argument is translated and bounds-checked here again, so a gap in
//! the verifier turns into an [`ExecutionFault`] rather than a stray access.
//!
//! The executor never allocates: the stack lives in the interpreter frame and
//! events are encoded into fixed buffers by the helpers.

use core::fmt;

use crate::context::TrapContext;
use crate::helpers::{
    ArgType, HelperCall, HelperFault, HelperTable, MAX_HELPER_ARGS, MemRange, Region,
};
use crate::insn::*;
use crate::ringbuf::EventSink;
use crate::verifier::{ProbeProgram, STACK_SIZE};

/// Virtual address of the first trap context byte.
pub const CTX_BASE: u64 = 0x1_0000_0000;

/// Virtual address of the lowest stack byte.
pub const STACK_BASE: u64 = 0x2_0000_0000;

/// Initial value of the frame pointer `r10`.
pub const FRAME_ADDR: u64 = STACK_BASE + STACK_SIZE as u64;

/// What went wrong while running a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Access outside the context or the probe's stack.
    OutOfBounds { addr: u64, len: usize },
    /// Store into the trap context.
    ContextWrite,
    /// Helper id not in the table.
    UnknownHelper(u32),
    /// Helper not granted to this program.
    HelperDenied(u32),
    /// Instruction the interpreter does not implement.
    InvalidInstruction,
    /// More steps than instructions.
    BudgetExceeded,
    /// Helper reported a failure.
    Helper { id: u32, fault: HelperFault },
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfBounds { addr, len } => {
                write!(f, "access of {} bytes at {:#x} out of bounds", len, addr)
            }
            Self::ContextWrite => write!(f, "write to trap context"),
            Self::UnknownHelper(id) => write!(f, "unknown helper {}", id),
            Self::HelperDenied(id) => write!(f, "helper {} not permitted", id),
            Self::InvalidInstruction => write!(f, "invalid instruction"),
            Self::BudgetExceeded => write!(f, "step budget exceeded"),
            Self::Helper { id, fault } => write!(f, "helper {} failed: {}", id, fault),
        }
    }
}

/// Runtime fault of one probe invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionFault {
    /// Instruction index at which the fault happened.
    pub pc: usize,
    pub kind: FaultKind,
}

impl fmt::Display for ExecutionFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "probe fault at insn {}: {}", self.pc, self.kind)
    }
}

impl core::error::Error for ExecutionFault {}

/// Services a probe invocation may use.
#[derive(Clone, Copy)]
pub struct ExecEnv<'a> {
    pub helpers: &'a HelperTable,
    pub sink: &'a dyn EventSink,
}

impl<'a> ExecEnv<'a> {
    pub fn new(helpers: &'a HelperTable, sink: &'a dyn EventSink) -> Self {
        Self { helpers, sink }
    }
}

/// Run `program` once against `trap` and return `r0`.
pub fn run(
    program: &ProbeProgram,
    trap: &TrapContext,
    env: &ExecEnv<'_>,
) -> Result<u64, ExecutionFault> {
    let mut vm = Vm {
        regs: [0; NR_REGS],
        stack: [0; STACK_SIZE],
        stack_floor: STACK_SIZE - program.stack_depth().min(STACK_SIZE),
        ctx: trap.as_bytes(),
    };
    vm.regs[1] = CTX_BASE;
    vm.regs[FRAME_REG as usize] = FRAME_ADDR;

    let mut pc = 0;
    let mut steps = 0;
    loop {
        match vm.step(program, env, pc) {
            Ok(Flow::Next(next)) => pc = next,
            Ok(Flow::Exit(ret)) => return Ok(ret),
            Err(kind) => return Err(ExecutionFault { pc, kind }),
        }
        steps += 1;
        if steps >= program.len() {
            return Err(ExecutionFault {
                pc,
                kind: FaultKind::BudgetExceeded,
            });
        }
    }
}

enum Flow {
    Next(usize),
    Exit(u64),
}

struct Vm<'a> {
    regs: [u64; NR_REGS],
    stack: [u8; STACK_SIZE],
    /// Lowest stack offset the program may touch.
    stack_floor: usize,
    ctx: &'a [u8],
}

impl Vm<'_> {
    fn step(&mut self, program: &ProbeProgram, env: &ExecEnv<'_>, pc: usize) -> Result<Flow, FaultKind> {
        let insns = program.insns();
        let insn = insns.get(pc).ok_or(FaultKind::InvalidInstruction)?;
        let dst = insn.dst as usize;
        let src = insn.src as usize;
        if dst >= NR_REGS || src >= NR_REGS {
            return Err(FaultKind::InvalidInstruction);
        }
        let writes_frame = dst == FRAME_REG as usize
            && matches!(insn.class(), BPF_LD | BPF_LDX | BPF_ALU | BPF_ALU64);
        if writes_frame {
            return Err(FaultKind::InvalidInstruction);
        }

        match insn.class() {
            BPF_LD if insn.opc == LD_DW_IMM => {
                let hi = insns.get(pc + 1).ok_or(FaultKind::InvalidInstruction)?;
                self.regs[dst] = (insn.imm as u32 as u64) | ((hi.imm as u32 as u64) << 32);
                return Ok(Flow::Next(pc + 2));
            }
            BPF_LDX => {
                let width = insn.mem_width().ok_or(FaultKind::InvalidInstruction)?;
                let addr = self.regs[src].wrapping_add(insn.off as i64 as u64);
                self.regs[dst] = self.load(addr, width)?;
            }
            BPF_ST | BPF_STX => {
                let width = insn.mem_width().ok_or(FaultKind::InvalidInstruction)?;
                let addr = self.regs[dst].wrapping_add(insn.off as i64 as u64);
                let value = if insn.class() == BPF_STX {
                    self.regs[src]
                } else {
                    insn.imm as i64 as u64
                };
                self.store(addr, width, value)?;
            }
            BPF_ALU | BPF_ALU64 => {
                if !is_alu_op(insn.op()) {
                    return Err(FaultKind::InvalidInstruction);
                }
                let operand = if insn.uses_src_reg() {
                    self.regs[src]
                } else {
                    insn.imm as i64 as u64
                };
                let eval = if insn.class() == BPF_ALU64 { alu64 } else { alu32 };
                self.regs[dst] = eval(insn.op(), self.regs[dst], operand);
            }
            BPF_JMP => match insn.op() {
                BPF_EXIT => return Ok(Flow::Exit(self.regs[0])),
                BPF_CALL => {
                    self.regs[0] = self.call(program, env, insn.imm as u32)?;
                }
                BPF_JA => return jump(pc, insn.off),
                op if is_cond_jump(op) => {
                    let operand = if insn.uses_src_reg() {
                        self.regs[src]
                    } else {
                        insn.imm as i64 as u64
                    };
                    if jump_taken(op, self.regs[dst], operand) {
                        return jump(pc, insn.off);
                    }
                }
                _ => return Err(FaultKind::InvalidInstruction),
            },
            _ => return Err(FaultKind::InvalidInstruction),
        }

        Ok(Flow::Next(pc + 1))
    }

    /// Map `len` bytes at virtual `addr` to a region offset.
    fn translate(&self, addr: u64, len: usize, write: bool) -> Result<(Region, usize), FaultKind> {
        let fits = |off: u64, limit: usize| off.checked_add(len as u64).is_some_and(|end| end <= limit as u64);

        if let Some(off) = addr.checked_sub(CTX_BASE)
            && fits(off, self.ctx.len())
        {
            if write {
                return Err(FaultKind::ContextWrite);
            }
            return Ok((Region::Context, off as usize));
        }
        if let Some(off) = addr.checked_sub(STACK_BASE)
            && off >= self.stack_floor as u64
            && fits(off, STACK_SIZE)
        {
            return Ok((Region::Stack, off as usize));
        }
        Err(FaultKind::OutOfBounds { addr, len })
    }

    fn load(&self, addr: u64, width: usize) -> Result<u64, FaultKind> {
        let (region, start) = self.translate(addr, width, false)?;
        let mem = match region {
            Region::Context => &self.ctx[start..start + width],
            Region::Stack => &self.stack[start..start + width],
        };
        Ok(match width {
            1 => mem[0] as u64,
            2 => u16::from_ne_bytes([mem[0], mem[1]]) as u64,
            4 => u32::from_ne_bytes([mem[0], mem[1], mem[2], mem[3]]) as u64,
            _ => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(mem);
                u64::from_ne_bytes(raw)
            }
        })
    }

    fn store(&mut self, addr: u64, width: usize, value: u64) -> Result<(), FaultKind> {
        let (_, start) = self.translate(addr, width, true)?;
        let mem = &mut self.stack[start..start + width];
        match width {
            1 => mem[0] = value as u8,
            2 => mem.copy_from_slice(&(value as u16).to_ne_bytes()),
            4 => mem.copy_from_slice(&(value as u32).to_ne_bytes()),
            _ => mem.copy_from_slice(&value.to_ne_bytes()),
        }
        Ok(())
    }

    fn call(&mut self, program: &ProbeProgram, env: &ExecEnv<'_>, id: u32) -> Result<u64, FaultKind> {
        let def = env.helpers.get(id).ok_or(FaultKind::UnknownHelper(id))?;
        if !program.uses_helper(id) || !def.classes.contains(program.key().class()) {
            return Err(FaultKind::HelperDenied(id));
        }

        let mut args = [0u64; MAX_HELPER_ARGS];
        args.copy_from_slice(&self.regs[1..=MAX_HELPER_ARGS]);

        let mut ranges = [None; MAX_HELPER_ARGS];
        for (i, kind) in def.args.iter().enumerate() {
            if !kind.is_mem() {
                continue;
            }
            let addr = args[i];
            let size = args.get(i + 1).copied().unwrap_or(0);
            if *kind == ArgType::MemOrNull && addr == 0 && size == 0 {
                continue;
            }
            let len = usize::try_from(size)
                .ok()
                .filter(|&len| len <= STACK_SIZE + TrapContext::SIZE)
                .ok_or(FaultKind::OutOfBounds {
                    addr,
                    len: usize::MAX,
                })?;
            let (region, start) = self.translate(addr, len, *kind == ArgType::WritableMem)?;
            ranges[i] = Some(MemRange { region, start, len });
        }

        let mut call = HelperCall::new(
            args,
            ranges,
            self.ctx,
            &mut self.stack,
            program.key(),
            env.sink,
        );
        (def.func)(&mut call).map_err(|fault| FaultKind::Helper { id, fault })
    }
}

fn jump(pc: usize, off: i16) -> Result<Flow, FaultKind> {
    let target = pc as isize + 1 + off as isize;
    usize::try_from(target)
        .map(Flow::Next)
        .map_err(|_| FaultKind::InvalidInstruction)
}
