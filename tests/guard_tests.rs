//! Run-time guards of the interpreter.
//!
//! Programs here are built with `ProbeProgram::from_raw_parts`, skipping the
//! verifier, so every rejected access must surface as an `ExecutionFault`.

#![cfg(feature = "test-utils")]

mod common;

use common::*;
use probetrace::context::{AttachmentKey, TrapContext};
use probetrace::event::TraceEvent;
use probetrace::executor::{CTX_BASE, ExecEnv, ExecutionFault, FaultKind, FRAME_ADDR, run};
use probetrace::helpers::{HelperFault, HelperTable, id};
use probetrace::insn::*;
use probetrace::ringbuf::RingBuffer;
use probetrace::verifier::ProbeProgram;

const READ: AttachmentKey = AttachmentKey::Syscall(0);

fn exec(prog: &ProbeProgram, trap: &TrapContext) -> (Result<u64, ExecutionFault>, Vec<TraceEvent>) {
    let helpers = HelperTable::standard();
    let ring = RingBuffer::new(4096).unwrap();
    let env = ExecEnv::new(&helpers, &ring);
    let result = run(prog, trap, &env);
    let events = ring.read().map(|r| TraceEvent::decode(&r).unwrap()).collect();
    (result, events)
}

fn syscall_name_probe() -> Vec<Insn> {
    vec![
        mov64_reg(1, 10),
        alu64_imm(BPF_ADD, 1, -16),
        mov64_imm(2, 16),
        call(id::GET_SYSCALL_NAME),
        exit(),
    ]
}

fn unchecked(insns: Vec<Insn>, stack_depth: usize, helper_ids: &[u32]) -> ProbeProgram {
    ProbeProgram::from_raw_parts(insns, READ, stack_depth, helper_ids)
}

#[test]
fn test_context_write_faults() {
    let prog = unchecked(vec![st(BPF_DW, 1, 0, 1), mov64_imm(0, 0), exit()], 0, &[]);
    let fault = exec(&prog, &TrapContext::new(0)).0.unwrap_err();
    assert_eq!(fault, ExecutionFault { pc: 0, kind: FaultKind::ContextWrite });
}

#[test]
fn test_wild_load_faults() {
    let prog = unchecked(vec![mov64_imm(2, 0x1000), ldx(BPF_DW, 0, 2, 0), exit()], 0, &[]);
    let fault = exec(&prog, &TrapContext::new(0)).0.unwrap_err();
    assert_eq!(fault.pc, 1);
    assert_eq!(fault.kind, FaultKind::OutOfBounds { addr: 0x1000, len: 8 });
}

#[test]
fn test_context_read_past_end_faults() {
    let prog = unchecked(vec![ldx(BPF_DW, 0, 1, 276), exit()], 0, &[]);
    let fault = exec(&prog, &TrapContext::new(0)).0.unwrap_err();
    assert!(matches!(fault.kind, FaultKind::OutOfBounds { len: 8, .. }));
}

#[test]
fn test_helper_outside_program_set_denied() {
    let prog = unchecked(vec![call(id::KTIME_GET_NS), exit()], 0, &[]);
    let fault = exec(&prog, &TrapContext::new(0)).0.unwrap_err();
    assert_eq!(fault.kind, FaultKind::HelperDenied(id::KTIME_GET_NS));
}

#[test]
fn test_helper_wrong_class_denied() {
    let prog = ProbeProgram::from_raw_parts(
        syscall_name_probe(),
        AttachmentKey::Uprobe(0x40_0000),
        16,
        &[id::GET_SYSCALL_NAME],
    );
    let fault = exec(&prog, &TrapContext::new(0)).0.unwrap_err();
    assert_eq!(fault.pc, 3);
    assert_eq!(fault.kind, FaultKind::HelperDenied(id::GET_SYSCALL_NAME));
}

#[test]
fn test_unknown_helper_faults() {
    let prog = unchecked(vec![call(17), exit()], 0, &[17]);
    let fault = exec(&prog, &TrapContext::new(0)).0.unwrap_err();
    assert_eq!(fault.kind, FaultKind::UnknownHelper(17));
}

#[test]
fn test_helper_buffer_outside_stack_faults() {
    // get_syscall_name into 16 bytes at r10-8.
    let prog = unchecked(
        vec![
            mov64_reg(1, 10),
            alu64_imm(BPF_ADD, 1, -8),
            mov64_imm(2, 16),
            call(id::GET_SYSCALL_NAME),
            exit(),
        ],
        512,
        &[id::GET_SYSCALL_NAME],
    );
    let fault = exec(&prog, &TrapContext::new(0)).0.unwrap_err();
    assert_eq!(fault.pc, 3);
    assert_eq!(fault.kind, FaultKind::OutOfBounds { addr: FRAME_ADDR - 8, len: 16 });
}

#[test]
fn test_backward_jump_hits_budget() {
    let prog = unchecked(vec![ja(-1), exit()], 0, &[]);
    let fault = exec(&prog, &TrapContext::new(0)).0.unwrap_err();
    assert_eq!(fault.kind, FaultKind::BudgetExceeded);
}

#[test]
fn test_jump_past_end_faults() {
    let prog = unchecked(vec![ja(5), exit()], 0, &[]);
    let fault = exec(&prog, &TrapContext::new(0)).0.unwrap_err();
    assert_eq!(fault, ExecutionFault { pc: 6, kind: FaultKind::InvalidInstruction });
}

#[test]
fn test_invalid_opcode_faults() {
    let prog = unchecked(vec![insn(0xff, 0, 0, 0, 0), exit()], 0, &[]);
    let fault = exec(&prog, &TrapContext::new(0)).0.unwrap_err();
    assert_eq!(fault.kind, FaultKind::InvalidInstruction);
}

#[test]
fn test_partial_event_field_faults() {
    // emit_event with 12 bytes of fields; the verifier would refuse the size.
    let prog = unchecked(
        vec![
            mov64_imm(1, 1),
            mov64_reg(2, 10),
            alu64_imm(BPF_ADD, 2, -16),
            mov64_imm(3, 12),
            mov64_imm(4, 0),
            mov64_imm(5, 0),
            call(id::EMIT_EVENT),
            exit(),
        ],
        16,
        &[id::EMIT_EVENT],
    );
    let (ret, events) = exec(&prog, &TrapContext::new(0));
    let fault = ret.unwrap_err();
    assert_eq!(fault.pc, 6);
    assert_eq!(
        fault.kind,
        FaultKind::Helper { id: id::EMIT_EVENT, fault: HelperFault::Misaligned { arg: 2, len: 12 } }
    );
    assert!(events.is_empty());
}

#[test]
fn test_registers_hold_virtual_addresses() {
    // r1 and r10 are not host pointers.
    let prog = unchecked(vec![mov64_reg(0, 1), alu64_reg(BPF_XOR, 0, 10), exit()], 0, &[]);
    let (ret, _) = exec(&prog, &TrapContext::new(0));
    assert_eq!(ret.unwrap(), CTX_BASE ^ FRAME_ADDR);
}
