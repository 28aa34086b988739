//! Shared helpers for integration tests.

#![allow(dead_code)]

use probetrace::helpers::id;
use probetrace::insn::*;

// =============================================================================
// Instruction builders
// =============================================================================

pub fn insn(opc: u8, dst: u8, src: u8, off: i16, imm: i32) -> Insn {
    Insn { opc, dst, src, off, imm }
}

/// Raw bytecode for `insns`, as handed to the loader.
pub fn bytecode(insns: &[Insn]) -> Vec<u8> {
    insns.iter().flat_map(|i| i.to_array()).collect()
}

pub fn mov64_imm(dst: u8, imm: i32) -> Insn {
    insn(BPF_ALU64 | BPF_MOV | BPF_K, dst, 0, 0, imm)
}

pub fn mov64_reg(dst: u8, src: u8) -> Insn {
    insn(BPF_ALU64 | BPF_MOV | BPF_X, dst, src, 0, 0)
}

pub fn alu64_imm(op: u8, dst: u8, imm: i32) -> Insn {
    insn(BPF_ALU64 | op | BPF_K, dst, 0, 0, imm)
}

pub fn alu64_reg(op: u8, dst: u8, src: u8) -> Insn {
    insn(BPF_ALU64 | op | BPF_X, dst, src, 0, 0)
}

pub fn alu32_imm(op: u8, dst: u8, imm: i32) -> Insn {
    insn(BPF_ALU | op | BPF_K, dst, 0, 0, imm)
}

pub fn ldx(size: u8, dst: u8, src: u8, off: i16) -> Insn {
    insn(BPF_LDX | BPF_MEM | size, dst, src, off, 0)
}

pub fn stx(size: u8, dst: u8, src: u8, off: i16) -> Insn {
    insn(BPF_STX | BPF_MEM | size, dst, src, off, 0)
}

pub fn st(size: u8, dst: u8, off: i16, imm: i32) -> Insn {
    insn(BPF_ST | BPF_MEM | size, dst, 0, off, imm)
}

pub fn jmp_imm(op: u8, dst: u8, imm: i32, off: i16) -> Insn {
    insn(BPF_JMP | op | BPF_K, dst, 0, off, imm)
}

pub fn jmp_reg(op: u8, dst: u8, src: u8, off: i16) -> Insn {
    insn(BPF_JMP | op | BPF_X, dst, src, off, 0)
}

pub fn ja(off: i16) -> Insn {
    insn(BPF_JMP | BPF_JA, 0, 0, off, 0)
}

pub fn lddw(dst: u8, imm: u64) -> [Insn; 2] {
    [
        insn(LD_DW_IMM, dst, 0, 0, imm as u32 as i32),
        insn(0, 0, 0, 0, (imm >> 32) as u32 as i32),
    ]
}

pub fn call(helper: u32) -> Insn {
    insn(CALL, 0, 0, 0, helper as i32)
}

pub fn exit() -> Insn {
    insn(EXIT, 0, 0, 0, 0)
}

/// `emit_event(kind, &[value], 8, NULL, 0)` with `value` spilled to `[r10-8]`,
/// then `return 0`.
pub fn emit_one_field(kind: i32, value: i32) -> Vec<Insn> {
    vec![
        mov64_imm(6, value),
        stx(BPF_DW, 10, 6, -8),
        mov64_imm(1, kind),
        mov64_reg(2, 10),
        alu64_imm(BPF_ADD, 2, -8),
        mov64_imm(3, 8),
        mov64_imm(4, 0),
        mov64_imm(5, 0),
        call(id::EMIT_EVENT),
        mov64_imm(0, 0),
        exit(),
    ]
}

/// `return value`
pub fn return_imm(value: i32) -> Vec<Insn> {
    vec![mov64_imm(0, value), exit()]
}

// =============================================================================
// Deterministic randomness
// =============================================================================

/// xorshift64* generator; reproducible across runs.
pub struct XorShift(u64);

impl XorShift {
    pub fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.0 = x;
        x.wrapping_mul(0x2545_f491_4f6c_dd1d)
    }

    /// Uniform-ish value in `0..n`.
    pub fn below(&mut self, n: u64) -> u64 {
        self.next_u64() % n
    }

    pub fn pick<T: Copy>(&mut self, items: &[T]) -> T {
        items[self.below(items.len() as u64) as usize]
    }
}

const ALU_OPS: &[u8] = &[
    BPF_ADD, BPF_SUB, BPF_MUL, BPF_DIV, BPF_OR, BPF_AND, BPF_LSH, BPF_RSH, BPF_NEG, BPF_MOD,
    BPF_XOR, BPF_MOV, BPF_ARSH,
];

const JMP_OPS: &[u8] = &[
    BPF_JEQ, BPF_JGT, BPF_JGE, BPF_JSET, BPF_JNE, BPF_JSGT, BPF_JSGE, BPF_JLT, BPF_JLE, BPF_JSLT,
    BPF_JSLE,
];

const SIZES: &[u8] = &[BPF_B, BPF_H, BPF_W, BPF_DW];

const HELPER_IDS: &[u32] = &[
    id::EMIT_EVENT,
    id::KTIME_GET_NS,
    id::TRACE_PRINTK,
    id::GET_SMP_PROCESSOR_ID,
    id::GET_SYSCALL_NAME,
];

/// Program biased towards the verifiable subset.
///
/// Registers other than `r1` and `r10` are initialized first and the program
/// ends with `return 0`, so short bodies are often accepted; longer ones mix
/// in out-of-range accesses, pointer arithmetic and calls that the verifier
/// has to catch.
pub fn random_program(rng: &mut XorShift) -> Vec<Insn> {
    let mut prog = Vec::new();
    for reg in [0u8, 2, 3, 4, 5, 6, 7, 8, 9] {
        prog.push(mov64_imm(reg, rng.below(64) as i32));
    }

    let body = rng.below(16) as usize;
    let mut i = 0;
    while i < body {
        let remaining = (body - i) as i16;
        let reg = rng.below(10) as u8;
        let other = rng.below(11) as u8;
        let insn = match rng.below(12) {
            0 => mov64_imm(reg, rng.next_u64() as i32),
            1 => alu64_imm(rng.pick(ALU_OPS), reg, rng.below(32) as i32 - 8),
            2 => alu64_reg(rng.pick(ALU_OPS), reg, other),
            3 => alu32_imm(rng.pick(ALU_OPS), reg, rng.next_u64() as i32),
            4 => ldx(rng.pick(SIZES), reg, 1, (rng.below(40) * 8) as i16 - 8),
            5 => ldx(rng.pick(SIZES), reg, 10, -((rng.below(70) * 8) as i16)),
            6 => stx(rng.pick(SIZES), 10, other, -((rng.below(66) * 8) as i16)),
            7 => st(rng.pick(SIZES), 10, -((rng.below(66) * 8) as i16), rng.next_u64() as i32),
            8 => jmp_imm(rng.pick(JMP_OPS), reg, rng.below(8) as i32, rng.below(remaining as u64 + 1) as i16),
            9 => jmp_reg(rng.pick(JMP_OPS), reg, other, rng.below(remaining as u64 + 1) as i16),
            10 => {
                prog.push(mov64_reg(2, 10));
                prog.push(alu64_imm(BPF_ADD, 2, -(rng.below(9) as i32 * 8)));
                call(rng.pick(HELPER_IDS))
            }
            _ => mov64_reg(reg, 10),
        };
        prog.push(insn);
        i += 1;
    }

    prog.push(mov64_imm(0, 0));
    prog.push(exit());
    prog
}
