//! Integration tests for the syscall-style entry points.
//!
//! All tests share the process-wide runtime.

mod common;

use axerrno::AxError;
use common::*;
use probetrace::context::{AttachmentKey, TrapContext};
use probetrace::runtime;
use probetrace::syscall::{
    PLACE_KPROBE, PLACE_SYSCALL, PLACE_UPROBE, decode_key, sys_register_probe,
    sys_unregister_probe,
};
use probetrace::{ProbeRuntime, RuntimeConfig};

fn rt() -> &'static ProbeRuntime {
    probetrace::init(RuntimeConfig::default()).unwrap()
}

// =============================================================================
// Key Decoding
// =============================================================================

#[test]
fn test_decode_key_places() {
    assert_eq!(decode_key(PLACE_SYSCALL, 64).unwrap(), AttachmentKey::Syscall(64));
    assert_eq!(
        decode_key(PLACE_KPROBE, 0xffff_8000_0000_1000).unwrap(),
        AttachmentKey::Kprobe(0xffff_8000_0000_1000)
    );
    assert_eq!(decode_key(PLACE_UPROBE, 0x40_1000).unwrap(), AttachmentKey::Uprobe(0x40_1000));
}

#[test]
fn test_decode_key_unknown_place() {
    assert_eq!(decode_key(7, 0).unwrap_err(), AxError::InvalidInput);
}

#[test]
fn test_decode_key_syscall_out_of_range() {
    let err = decode_key(PLACE_SYSCALL, u64::from(u32::MAX) + 1).unwrap_err();
    assert_eq!(err, AxError::InvalidInput);
}

// =============================================================================
// Register / Unregister
// =============================================================================

#[test]
fn test_init_returns_same_runtime() {
    let a = rt();
    let b = probetrace::init(RuntimeConfig::default().with_ring_capacity_kb(4)).unwrap();
    assert!(core::ptr::eq(a, b));
    assert!(core::ptr::eq(runtime::global().unwrap(), a));
}

#[test]
fn test_register_and_dispatch() {
    let rt = rt();
    // Syscall 300 is not touched by any other test in this binary.
    let id = sys_register_probe(PLACE_SYSCALL, 300, &bytecode(&emit_one_field(300, 9)))
        .unwrap();
    assert!(id > 0);

    let report = rt.dispatch(AttachmentKey::Syscall(300), &TrapContext::new(8));
    assert_eq!(report.invoked, 1);
    assert_eq!(report.faulted, 0);

    // Other tests may emit concurrently; look for ours by kind.
    let found = rt
        .read_events()
        .filter_map(Result::ok)
        .any(|e| e.kind == 300 && e.fields() == [9]);
    assert!(found);

    sys_unregister_probe(id).unwrap();
}

#[test]
fn test_register_rejects_bad_bytecode() {
    rt();
    let err = sys_register_probe(PLACE_KPROBE, 0x1000, &[0x95, 0, 0]).unwrap_err();
    assert_eq!(err, AxError::InvalidInput);
    // Reads r2 before writing it.
    let prog = bytecode(&[mov64_reg(0, 2), exit()]);
    let err = sys_register_probe(PLACE_KPROBE, 0x1000, &prog).unwrap_err();
    assert_eq!(err, AxError::InvalidInput);
}

#[test]
fn test_register_rejects_bad_place() {
    rt();
    let prog = bytecode(&return_imm(0));
    assert_eq!(sys_register_probe(9, 0, &prog).unwrap_err(), AxError::InvalidInput);
}

#[test]
fn test_unregister_twice() {
    rt();
    let id = sys_register_probe(PLACE_UPROBE, 0x40_2000, &bytecode(&return_imm(1))).unwrap();
    assert!(sys_unregister_probe(id).is_ok());
    assert_eq!(sys_unregister_probe(id).unwrap_err(), AxError::NotFound);
}

#[test]
fn test_unregister_unknown_id() {
    rt();
    assert_eq!(sys_unregister_probe(0).unwrap_err(), AxError::NotFound);
    assert_eq!(sys_unregister_probe(usize::MAX).unwrap_err(), AxError::InvalidInput);
}
