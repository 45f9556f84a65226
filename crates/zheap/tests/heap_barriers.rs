//! Barrier and Phase Tests
//!
//! Drives the heap phases by hand to exercise:
//! - Mutators relocating objects through the barrier slow path
//! - Out-of-order phase requests
//! - Abort before and during relocation

mod common;

use common::{verify_object, HeapFixture, OBJECT_SIZE};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use zheap::{ColoredPointer, GcCause, Heap, HeapError, Phase};

/// Run a cycle up to and including relocate start.
fn run_to_relocate_start(heap: &Heap) {
    heap.mark_start().unwrap();
    heap.mark(true).unwrap();
    assert!(heap.mark_end().unwrap());
    heap.process_non_strong_references().unwrap();
    heap.reset_relocation_set().unwrap();
    heap.select_relocation_set().unwrap();
    heap.relocate_start().unwrap();
}

#[test]
fn test_mutators_agree_on_relocated_copy() {
    let fixture = HeapFixture::with_defaults();
    let live = fixture.fill_pages(8, 8, 2);
    run_to_relocate_start(&fixture.heap);
    assert!(fixture.heap.relocation_set_len() > 0);

    let roots = Arc::new(fixture.marking.roots());
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let heap = Arc::clone(&fixture.heap);
            let roots = Arc::clone(&roots);
            thread::spawn(move || {
                roots
                    .iter()
                    .map(|&root| heap.barrier_slow_path(root))
                    .collect::<Vec<ColoredPointer>>()
            })
        })
        .collect();

    let results: Vec<Vec<ColoredPointer>> =
        handles.into_iter().map(|h| h.join().unwrap()).collect();
    for result in &results[1..] {
        assert_eq!(result, &results[0]);
    }

    // Mutators already moved every live object; workers only free pages.
    let stats = fixture.heap.relocate().unwrap();
    assert_eq!(stats.pages, fixture.heap.relocation_set_len());
    assert!(stats.relocated_objects > 0);

    for (index, &(root, fill)) in live.iter().enumerate() {
        let ptr = fixture.load_root(root);
        assert_eq!(ptr, results[0][index]);
        assert!(fixture.heap.address_space().is_good(ptr));
        assert!(unsafe { verify_object(ptr, OBJECT_SIZE, fill) });
    }
}

#[test]
fn test_relocate_object_is_idempotent() {
    let fixture = HeapFixture::with_defaults();
    let live = fixture.fill_pages(4, 4, 1);
    run_to_relocate_start(&fixture.heap);

    let mut moved = HashMap::new();
    for &(root, _) in &live {
        let stale = fixture.marking.root(root);
        let first = fixture.heap.relocate_object(stale);
        let second = fixture.heap.relocate_object(stale);
        assert_eq!(first, second);
        moved.insert(root, first);
    }

    fixture.heap.relocate().unwrap();
    for &(root, fill) in &live {
        let ptr = fixture.load_root(root);
        assert_eq!(ptr, moved[&root]);
        assert!(unsafe { verify_object(ptr, OBJECT_SIZE, fill) });
    }
}

#[test]
fn test_remap_after_relocation() {
    let fixture = HeapFixture::with_defaults();
    let live = fixture.fill_pages(4, 4, 1);
    fixture.gc.collect(GcCause::Explicit).unwrap();

    let expected: Vec<ColoredPointer> =
        live.iter().map(|&(root, _)| fixture.load_root(root)).collect();

    // Next cycle: the stale pointers are healed through the previous
    // cycle's forwardings while marking.
    fixture.heap.mark_start().unwrap();
    let space = fixture.heap.address_space();
    for (&(root, fill), expected) in live.iter().zip(&expected) {
        let stale = fixture.marking.root(root);
        let healed = fixture.heap.barrier_slow_path(stale);
        assert!(space.is_good(healed));
        assert_eq!(space.offset_of(healed), space.offset_of(*expected));
        assert!(unsafe { verify_object(healed, OBJECT_SIZE, fill) });
    }
}

#[test]
fn test_good_and_null_pointers_pass_through() {
    let fixture = HeapFixture::with_defaults();
    let ptr = fixture.alloc(OBJECT_SIZE, 7);

    assert_eq!(fixture.heap.barrier_slow_path(ptr), ptr);
    assert_eq!(
        fixture.heap.barrier_slow_path(ColoredPointer::null()),
        ColoredPointer::null()
    );
}

#[test]
fn test_phase_misuse_is_rejected() {
    let fixture = HeapFixture::with_defaults();
    let heap = &fixture.heap;
    assert_eq!(heap.phase(), Phase::Relocate);

    match heap.mark_end() {
        Err(HeapError::InvalidPhase { expected, actual }) => {
            assert_eq!(expected, Phase::Mark);
            assert_eq!(actual, Phase::Relocate);
        },
        other => panic!("expected InvalidPhase, got {:?}", other),
    }
    assert!(heap.relocate_start().unwrap_err().is_bug());
    assert!(heap.select_relocation_set().is_err());

    heap.mark_start().unwrap();
    assert!(matches!(
        heap.mark_start(),
        Err(HeapError::InvalidPhase { .. })
    ));
    assert!(matches!(heap.relocate(), Err(HeapError::InvalidPhase { .. })));
    assert_eq!(heap.phase(), Phase::Mark);
}

#[test]
fn test_abort_before_cycle() {
    let fixture = HeapFixture::with_defaults();
    fixture.fill_pages(2, 1, 1);
    fixture.gc.abort();

    assert!(matches!(
        fixture.gc.collect(GcCause::Explicit),
        Err(HeapError::Aborted)
    ));

    let summary = fixture.gc.stats().summary();
    assert_eq!(summary.cycles, 1);
    assert_eq!(summary.aborted_cycles, 1);
    assert!(fixture.gc.stats().last_cycle().unwrap().aborted);
}

#[test]
fn test_abort_during_relocation_keeps_objects_reachable() {
    let fixture = HeapFixture::with_defaults();
    let live = fixture.fill_pages(6, 6, 2);
    run_to_relocate_start(&fixture.heap);
    assert!(fixture.heap.relocation_set_len() > 0);

    fixture.heap.abort();
    fixture.heap.abort();
    assert!(fixture.heap.is_aborted());
    assert!(matches!(fixture.heap.relocate(), Err(HeapError::Aborted)));

    for &(root, fill) in &live {
        let ptr = fixture.load_root(root);
        assert!(fixture.heap.is_in(ptr));
        assert!(unsafe { verify_object(ptr, OBJECT_SIZE, fill) });
    }
}
