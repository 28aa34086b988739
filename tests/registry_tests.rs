//! Integration tests for the probe registry.

mod common;

use std::sync::Arc;
use std::thread;

use common::*;
use probetrace::context::AttachmentKey;
use probetrace::helpers::HelperTable;
use probetrace::registry::{ProbeId, ProbeRegistry};
use probetrace::verifier::{ProbeProgram, verify};

const OPEN: AttachmentKey = AttachmentKey::Syscall(2);
const KPROBE: AttachmentKey = AttachmentKey::Kprobe(0xffff_8000_0010_2000);

fn program(key: AttachmentKey, ret: i32) -> ProbeProgram {
    verify(return_imm(ret), key, &HelperTable::standard()).unwrap()
}

fn ids_at(registry: &ProbeRegistry, key: AttachmentKey) -> Vec<ProbeId> {
    registry
        .lookup(&key)
        .map(|list| list.iter().map(|p| p.id).collect())
        .unwrap_or_default()
}

// =============================================================================
// Install / Lookup
// =============================================================================

#[test]
fn test_empty_registry() {
    let registry = ProbeRegistry::new();
    assert!(registry.is_empty());
    assert!(registry.lookup(&OPEN).is_none());
}

#[test]
fn test_install_returns_distinct_ids() {
    let registry = ProbeRegistry::new();
    let a = registry.install(program(OPEN, 1));
    let b = registry.install(program(OPEN, 2));
    assert_ne!(a, b);
    assert_eq!(registry.len(), 2);
}

#[test]
fn test_lookup_preserves_install_order() {
    let registry = ProbeRegistry::new();
    let a = registry.install(program(OPEN, 1));
    let other = registry.install(program(KPROBE, 9));
    let b = registry.install(program(OPEN, 2));
    let c = registry.install(program(OPEN, 3));

    assert_eq!(ids_at(&registry, OPEN), vec![a, b, c]);
    assert_eq!(ids_at(&registry, KPROBE), vec![other]);
}

#[test]
fn test_get_by_id() {
    let registry = ProbeRegistry::new();
    let id = registry.install(program(KPROBE, 5));
    let probe = registry.get(id).unwrap();
    assert_eq!(probe.id, id);
    assert_eq!(probe.program.key(), KPROBE);
    assert!(registry.get(ProbeId::from_u32(9999)).is_none());
}

#[test]
fn test_probes_listed_by_id() {
    let registry = ProbeRegistry::new();
    let a = registry.install(program(KPROBE, 1));
    let b = registry.install(program(OPEN, 1));
    let c = registry.install(program(KPROBE, 1));
    let ids: Vec<_> = registry.probes().iter().map(|p| p.id).collect();
    assert_eq!(ids, vec![a, b, c]);
}

// =============================================================================
// Detach
// =============================================================================

#[test]
fn test_detach_removes_only_that_probe() {
    let registry = ProbeRegistry::new();
    let a = registry.install(program(OPEN, 1));
    let b = registry.install(program(OPEN, 2));
    let c = registry.install(program(OPEN, 3));

    assert!(registry.detach(b));
    assert_eq!(ids_at(&registry, OPEN), vec![a, c]);
    assert_eq!(registry.len(), 2);
}

#[test]
fn test_detach_twice_reports_missing() {
    let registry = ProbeRegistry::new();
    let id = registry.install(program(OPEN, 1));
    assert!(registry.detach(id));
    assert!(!registry.detach(id));
    assert!(registry.lookup(&OPEN).is_none());
}

#[test]
fn test_detach_unknown_id() {
    let registry = ProbeRegistry::new();
    assert!(!registry.detach(ProbeId::from_u32(42)));
}

#[test]
fn test_snapshot_survives_detach() {
    let registry = ProbeRegistry::new();
    let id = registry.install(program(OPEN, 1));
    let snapshot = registry.lookup(&OPEN).unwrap();

    assert!(registry.detach(id));
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].id, id);
    assert!(registry.lookup(&OPEN).is_none());
}

#[test]
fn test_snapshot_unaffected_by_later_install() {
    let registry = ProbeRegistry::new();
    registry.install(program(OPEN, 1));
    let snapshot = registry.lookup(&OPEN).unwrap();
    registry.install(program(OPEN, 2));
    assert_eq!(snapshot.len(), 1);
    assert_eq!(registry.lookup(&OPEN).unwrap().len(), 2);
}

// =============================================================================
// Concurrency
// =============================================================================

#[test]
fn test_concurrent_install_detach_and_lookup() {
    let registry = Arc::new(ProbeRegistry::new());
    let keep = registry.install(program(OPEN, 0));

    let writers: Vec<_> = (0..4)
        .map(|t| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                for i in 0..200 {
                    let id = registry.install(program(OPEN, t * 1000 + i));
                    assert!(registry.detach(id));
                }
            })
        })
        .collect();

    let reader = {
        let registry = Arc::clone(&registry);
        thread::spawn(move || {
            for _ in 0..2000 {
                let list = registry.lookup(&OPEN).unwrap();
                // The long-lived probe is always first and never torn away.
                assert_eq!(list[0].id, keep);
                let mut ids: Vec<_> = list.iter().map(|p| p.id).collect();
                ids.dedup();
                assert_eq!(ids.len(), list.len());
            }
        })
    };

    for w in writers {
        w.join().unwrap();
    }
    reader.join().unwrap();
    assert_eq!(ids_at(&registry, OPEN), vec![keep]);
}

#[test]
fn test_concurrent_installs_on_one_key_all_land() {
    let registry = Arc::new(ProbeRegistry::new());
    let handles: Vec<_> = (0..4)
        .map(|t| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                (0..100)
                    .map(|i| registry.install(program(KPROBE, t * 100 + i)))
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut installed: Vec<ProbeId> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    installed.sort();

    let mut listed = ids_at(&registry, KPROBE);
    assert_eq!(listed.len(), 400);
    listed.sort();
    assert_eq!(listed, installed);
}

#[test]
fn test_racing_detach_of_one_id_succeeds_once() {
    for _ in 0..50 {
        let registry = Arc::new(ProbeRegistry::new());
        let other = registry.install(program(OPEN, 0));
        let target = registry.install(program(OPEN, 1));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || registry.detach(target))
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&won| won)
            .count();

        assert_eq!(wins, 1);
        assert_eq!(ids_at(&registry, OPEN), vec![other]);
    }
}
