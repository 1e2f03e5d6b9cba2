//! Registry reservation-protocol invariants, per the concurrent-compilation
//! design: recursion hands back a stable pre-allocated buffer, completion
//! makes entries discoverable, and block accounting stays exact across every
//! mutation.

use jit::heap::{CodeHeap, ExecPageProvider, PAGE_SIZE};
use jit::metadata::ReturnKind;
use jit::registry::{MethodRegistry, ReserveOutcome, ReserveRequest, NO_VTABLE_SLOT};
use std::ptr::NonNull;

struct HostPages;

impl ExecPageProvider for HostPages {
    fn alloc_pages(&self, pages: usize) -> Option<NonNull<u8>> {
        let layout = std::alloc::Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })
    }

    unsafe fn free_pages(&self, base: NonNull<u8>, pages: usize) {
        let layout = std::alloc::Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        std::alloc::dealloc(base.as_ptr(), layout);
    }
}

static PAGES: HostPages = HostPages;

fn request(token: u32, assembly: u32) -> ReserveRequest {
    ReserveRequest {
        token,
        assembly,
        type_arg_hash: 0,
        arg_count: 2,
        return_kind: ReturnKind::Int32,
        return_struct_size: 0,
        has_this: false,
    }
}

fn check_block_invariants(registry: &MethodRegistry) {
    for stats in registry.block_stats() {
        assert_eq!(stats.used as usize, stats.live);
        assert!(stats.next_free <= 256);
        if stats.next_free == 256 {
            assert_eq!(stats.used, 256);
        }
    }
}

#[test]
fn reserve_then_complete_publishes_the_entry() {
    let mut heap = CodeHeap::new(&PAGES);
    let mut registry = MethodRegistry::new();
    let code = heap.alloc(64).unwrap();

    let outcome = registry.reserve(&mut heap, &request(0x0600_0001, 1)).unwrap();
    let id = match outcome {
        ReserveOutcome::Reserved(id) => id,
        other => panic!("expected a fresh reservation, got {:?}", other),
    };
    assert!(registry.entry(id).is_being_compiled());
    assert!(!registry.entry(id).is_compiled());

    let final_code = registry
        .complete(0x0600_0001, 1, 0, code.as_ptr(), 64)
        .unwrap();
    assert_eq!(final_code, code.as_ptr() as *const u8);

    let entry = registry.lookup(0x0600_0001, 1, 0).unwrap();
    assert!(entry.is_compiled());
    assert!(!entry.is_being_compiled());
    assert!(!entry.native_code.is_null());
    assert_eq!(entry.code_size, 64);
    check_block_invariants(&registry);
}

#[test]
fn recursive_reservation_returns_one_stable_buffer() {
    let mut heap = CodeHeap::new(&PAGES);
    let mut registry = MethodRegistry::new();

    let outcome = registry.reserve(&mut heap, &request(0x0600_0002, 1)).unwrap();
    assert!(matches!(outcome, ReserveOutcome::Reserved(_)));

    // Re-entry while compiling: the same pre-allocated buffer every time,
    // and no second slot.
    let first = match registry.reserve(&mut heap, &request(0x0600_0002, 1)).unwrap() {
        ReserveOutcome::Recursive(code) => code,
        other => panic!("expected recursion, got {:?}", other),
    };
    let second = match registry.reserve(&mut heap, &request(0x0600_0002, 1)).unwrap() {
        ReserveOutcome::Recursive(code) => code,
        other => panic!("expected recursion, got {:?}", other),
    };
    assert_eq!(first, second);
    assert_eq!(
        registry.recursive_call_target(0x0600_0002, 1, 0),
        Some(first)
    );
    assert_eq!(registry.iter().count(), 1);

    // Completion from a scratch region copies into the pre-allocated home.
    let scratch = heap.alloc(32).unwrap();
    unsafe {
        scratch.as_ptr().write(0xC3);
    }
    let final_code = registry
        .complete(0x0600_0002, 1, 0, scratch.as_ptr(), 1)
        .unwrap();
    assert_eq!(final_code, first);
    assert_eq!(unsafe { *final_code }, 0xC3);
    assert_eq!(registry.recursive_call_target(0x0600_0002, 1, 0), None);
    check_block_invariants(&registry);
}

#[test]
fn completed_reservation_short_circuits() {
    let mut heap = CodeHeap::new(&PAGES);
    let mut registry = MethodRegistry::new();
    let code = heap.alloc(16).unwrap();

    match registry.reserve(&mut heap, &request(0x0600_0003, 1)).unwrap() {
        ReserveOutcome::Reserved(_) => {}
        other => panic!("unexpected {:?}", other),
    }
    registry.complete(0x0600_0003, 1, 0, code.as_ptr(), 16).unwrap();

    match registry.reserve(&mut heap, &request(0x0600_0003, 1)).unwrap() {
        ReserveOutcome::Compiled(existing) => assert_eq!(existing, code.as_ptr() as *const u8),
        other => panic!("expected the compiled entry, got {:?}", other),
    }
}

#[test]
fn cancel_keeps_the_slot_for_retry() {
    let mut heap = CodeHeap::new(&PAGES);
    let mut registry = MethodRegistry::new();

    registry.reserve(&mut heap, &request(0x0600_0004, 1)).unwrap();
    registry.cancel(0x0600_0004, 1, 0);

    let entry = registry.lookup(0x0600_0004, 1, 0).unwrap();
    assert!(!entry.is_compiled());
    assert!(!entry.is_being_compiled());

    // A later attempt reuses the slot.
    match registry.reserve(&mut heap, &request(0x0600_0004, 1)).unwrap() {
        ReserveOutcome::Reserved(_) => {}
        other => panic!("expected re-reservation, got {:?}", other),
    }
    assert_eq!(registry.iter().count(), 1);
    check_block_invariants(&registry);
}

#[test]
fn instantiation_fallback_only_surfaces_virtual_stubs() {
    let mut heap = CodeHeap::new(&PAGES);
    let mut registry = MethodRegistry::new();

    // Generic definition entry, hash 0, left uncompiled and virtual.
    let id = match registry.reserve(&mut heap, &request(0x0600_0005, 1)).unwrap() {
        ReserveOutcome::Reserved(id) => id,
        other => panic!("unexpected {:?}", other),
    };
    registry.cancel(0x0600_0005, 1, 0);
    registry.register_virtual(id, core::ptr::null(), 3);

    // A lookup under an instantiation hash falls back to the stub.
    let entry = registry.lookup(0x0600_0005, 1, 0xDEAD_BEEF).unwrap();
    assert_eq!(entry.vtable_slot, 3);

    // Once compiled, the definition no longer answers for instantiations.
    let code = heap.alloc(16).unwrap();
    registry.complete(0x0600_0005, 1, 0, code.as_ptr(), 16).unwrap();
    assert!(registry.lookup(0x0600_0005, 1, 0xDEAD_BEEF).is_none());
    // The zero-hash lookup still finds it directly.
    assert!(registry.lookup(0x0600_0005, 1, 0).is_some());
}

#[test]
fn removal_by_assembly_leaves_no_trace() {
    let mut heap = CodeHeap::new(&PAGES);
    let mut registry = MethodRegistry::new();

    for rid in 1..=40u32 {
        let assembly = if rid % 2 == 0 { 7 } else { 8 };
        registry
            .reserve(&mut heap, &request(0x0600_0000 | rid, assembly))
            .unwrap();
    }
    check_block_invariants(&registry);

    let removed = registry.remove_by_assembly(7);
    assert_eq!(removed, 20);
    assert!(registry.iter().all(|entry| entry.assembly != 7));
    assert_eq!(registry.iter().count(), 20);
    check_block_invariants(&registry);

    assert!(registry.remove(0x0600_0001, 8, 0));
    assert!(registry.lookup(0x0600_0001, 8, 0).is_none());
    assert!(!registry.remove(0x0600_0001, 8, 0));
    check_block_invariants(&registry);
}

#[test]
fn vtable_slot_lookups_scan_overrides() {
    let mut heap = CodeHeap::new(&PAGES);
    let mut registry = MethodRegistry::new();
    let mt = 0x5000usize as *const jit::metadata::MethodTable;

    // Same token implementing two distinct slots is allowed.
    registry
        .register_uncompiled_override(0x0600_0010, 1, mt, 4)
        .unwrap();
    registry
        .register_uncompiled_override(0x0600_0010, 1, mt, 9)
        .unwrap();

    let by_slot = registry.lookup_by_vtable_slot(mt, 9).unwrap();
    assert_eq!(by_slot.token, 0x0600_0010);
    let lowest = registry
        .lookup_lowest_slot_by_token(0x0600_0010, 1, mt)
        .unwrap();
    assert_eq!(lowest.vtable_slot, 4);
    assert_ne!(lowest.vtable_slot, NO_VTABLE_SLOT);
}

#[test]
fn block_chain_grows_past_one_block() {
    let mut heap = CodeHeap::new(&PAGES);
    let mut registry = MethodRegistry::new();

    for rid in 1..=300u32 {
        registry
            .reserve(&mut heap, &request(0x0600_0000 | rid, 1))
            .unwrap();
    }
    let stats = registry.block_stats();
    assert_eq!(stats.len(), 2);
    assert_eq!(stats[0].used, 256);
    assert_eq!(stats[0].next_free, 256);
    assert_eq!(stats[1].used, 44);
    check_block_invariants(&registry);
}
