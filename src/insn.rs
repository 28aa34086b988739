//! Probe instruction set.
//!
//! The encoding is rbpf's eBPF format (`rbpf::ebpf::Insn`, 8 bytes per slot,
//! `LD_DW_IMM` taking two). This module narrows it to the subset the
//! executor interprets and holds the ALU and jump semantics shared by the
//! verifier's constant folding and the executor.

use alloc::vec::Vec;

pub use rbpf::ebpf::{
    BPF_ADD, BPF_ALU, BPF_ALU64, BPF_AND, BPF_ARSH, BPF_B, BPF_CALL, BPF_DIV, BPF_DW, BPF_EXIT,
    BPF_H, BPF_IMM, BPF_JA, BPF_JEQ, BPF_JGE, BPF_JGT, BPF_JLE, BPF_JLT, BPF_JMP, BPF_JNE,
    BPF_JSET, BPF_JSGE, BPF_JSGT, BPF_JSLE, BPF_JSLT, BPF_K, BPF_LD, BPF_LDX, BPF_LSH, BPF_MEM,
    BPF_MOD, BPF_MOV, BPF_MUL, BPF_NEG, BPF_OR, BPF_RSH, BPF_ST, BPF_STX, BPF_SUB, BPF_W, BPF_X,
    BPF_XOR, CALL, EXIT, INSN_SIZE, Insn, LD_DW_IMM,
};

/// Number of registers (`r0`..`r10`).
pub const NR_REGS: usize = 11;

/// Read-only frame pointer register.
pub const FRAME_REG: u8 = 10;

/// Field accessors used by the verifier and executor.
pub trait InsnExt {
    /// Instruction class bits.
    fn class(&self) -> u8;

    /// ALU or jump operation bits.
    fn op(&self) -> u8;

    /// Whether the second operand is `src` rather than `imm`.
    fn uses_src_reg(&self) -> bool;

    /// Access width in bytes of a load/store, if this is one.
    fn mem_width(&self) -> Option<usize>;

    /// Jump target of a jump at `pc`, if this is one.
    fn jump_target(&self, pc: usize) -> Option<isize>;
}

impl InsnExt for Insn {
    #[inline]
    fn class(&self) -> u8 {
        self.opc & 0x07
    }

    #[inline]
    fn op(&self) -> u8 {
        self.opc & 0xf0
    }

    #[inline]
    fn uses_src_reg(&self) -> bool {
        self.opc & BPF_X != 0
    }

    fn mem_width(&self) -> Option<usize> {
        match self.class() {
            BPF_LDX | BPF_ST | BPF_STX if self.opc & 0xe0 == BPF_MEM => {
                Some(match self.opc & 0x18 {
                    BPF_B => 1,
                    BPF_H => 2,
                    BPF_W => 4,
                    _ => 8,
                })
            }
            _ => None,
        }
    }

    fn jump_target(&self, pc: usize) -> Option<isize> {
        if self.class() == BPF_JMP && !matches!(self.op(), BPF_CALL | BPF_EXIT) {
            Some(pc as isize + 1 + self.off as isize)
        } else {
            None
        }
    }
}

/// Error returned by [`decode`] when the byte length is not a whole number
/// of instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrailingBytes {
    pub len: usize,
}

/// Split raw bytecode into instruction slots.
pub fn decode(bytes: &[u8]) -> Result<Vec<Insn>, TrailingBytes> {
    // rbpf panics on a partial slot.
    if bytes.len() % INSN_SIZE != 0 {
        return Err(TrailingBytes { len: bytes.len() });
    }
    Ok(rbpf::ebpf::to_insn_vec(bytes))
}

/// Whether `op` is an ALU operation the executor implements.
pub fn is_alu_op(op: u8) -> bool {
    matches!(
        op,
        BPF_ADD
            | BPF_SUB
            | BPF_MUL
            | BPF_DIV
            | BPF_OR
            | BPF_AND
            | BPF_LSH
            | BPF_RSH
            | BPF_NEG
            | BPF_MOD
            | BPF_XOR
            | BPF_MOV
            | BPF_ARSH
    )
}

/// Whether `op` is a conditional jump the executor implements.
pub fn is_cond_jump(op: u8) -> bool {
    matches!(
        op,
        BPF_JEQ
            | BPF_JGT
            | BPF_JGE
            | BPF_JSET
            | BPF_JNE
            | BPF_JSGT
            | BPF_JSGE
            | BPF_JLT
            | BPF_JLE
            | BPF_JSLT
            | BPF_JSLE
    )
}

/// 64-bit ALU semantics.
///
/// Division by zero yields 0 and modulo by zero leaves `dst` unchanged, so
/// no ALU instruction can fault.
pub fn alu64(op: u8, dst: u64, src: u64) -> u64 {
    match op {
        BPF_ADD => dst.wrapping_add(src),
        BPF_SUB => dst.wrapping_sub(src),
        BPF_MUL => dst.wrapping_mul(src),
        BPF_DIV => dst.checked_div(src).unwrap_or(0),
        BPF_OR => dst | src,
        BPF_AND => dst & src,
        BPF_LSH => dst.wrapping_shl(src as u32 & 63),
        BPF_RSH => dst.wrapping_shr(src as u32 & 63),
        BPF_NEG => (dst as i64).wrapping_neg() as u64,
        BPF_MOD => dst.checked_rem(src).unwrap_or(dst),
        BPF_XOR => dst ^ src,
        BPF_MOV => src,
        BPF_ARSH => (dst as i64).wrapping_shr(src as u32 & 63) as u64,
        _ => dst,
    }
}

/// 32-bit ALU semantics; the result is zero-extended.
pub fn alu32(op: u8, dst: u64, src: u64) -> u64 {
    let (d, s) = (dst as u32, src as u32);
    let res = match op {
        BPF_ADD => d.wrapping_add(s),
        BPF_SUB => d.wrapping_sub(s),
        BPF_MUL => d.wrapping_mul(s),
        BPF_DIV => d.checked_div(s).unwrap_or(0),
        BPF_OR => d | s,
        BPF_AND => d & s,
        BPF_LSH => d.wrapping_shl(s & 31),
        BPF_RSH => d.wrapping_shr(s & 31),
        BPF_NEG => (d as i32).wrapping_neg() as u32,
        BPF_MOD => d.checked_rem(s).unwrap_or(d),
        BPF_XOR => d ^ s,
        BPF_MOV => s,
        BPF_ARSH => (d as i32).wrapping_shr(s & 31) as u32,
        _ => d,
    };
    res as u64
}

/// Evaluate a conditional jump predicate.
pub fn jump_taken(op: u8, dst: u64, src: u64) -> bool {
    match op {
        BPF_JEQ => dst == src,
        BPF_JGT => dst > src,
        BPF_JGE => dst >= src,
        BPF_JSET => dst & src != 0,
        BPF_JNE => dst != src,
        BPF_JSGT => (dst as i64) > (src as i64),
        BPF_JSGE => (dst as i64) >= (src as i64),
        BPF_JLT => dst < src,
        BPF_JLE => dst <= src,
        BPF_JSLT => (dst as i64) < (src as i64),
        BPF_JSLE => (dst as i64) <= (src as i64),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors_follow_opcode_bits() {
        // ldxdw r2, [r1+272]
        let insns = decode(&[0x79, 0x12, 0x10, 0x01, 0x00, 0x00, 0x00, 0x00]).unwrap();
        let insn = &insns[0];
        assert_eq!(insn.dst, 2);
        assert_eq!(insn.src, 1);
        assert_eq!(insn.off, 272);
        assert_eq!(insn.class(), BPF_LDX);
        assert_eq!(insn.mem_width(), Some(8));
        assert_eq!(insn.jump_target(0), None);
    }

    #[test]
    fn decode_rejects_partial_slot() {
        assert_eq!(decode(&[0u8; 7]).unwrap_err(), TrailingBytes { len: 7 });
    }

    #[test]
    fn alu_never_faults_on_zero_divisor() {
        assert_eq!(alu64(BPF_DIV, 10, 0), 0);
        assert_eq!(alu64(BPF_MOD, 10, 0), 10);
        assert_eq!(alu32(BPF_DIV, 10, 0), 0);
        assert_eq!(alu32(BPF_ADD, u32::MAX as u64, 1), 0);
    }

    #[test]
    fn signed_predicates() {
        assert!(jump_taken(BPF_JSLT, (-1i64) as u64, 0));
        assert!(!jump_taken(BPF_JLT, (-1i64) as u64, 0));
    }
}
