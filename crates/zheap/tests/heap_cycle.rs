//! Full Cycle Tests
//!
//! Runs complete collection cycles on a real heap and checks:
//! - Empty pages are freed during selection
//! - Sparse pages are relocated and their memory reclaimed
//! - Object contents survive relocation
//! - Statistics and phase timings are recorded

mod common;

use common::{verify_object, HeapFixture, OBJECT_SIZE};
use zheap::globals::PAGE_SIZE_SMALL;
use zheap::{GcCause, GcEvent, HeapError, Phase};

#[test]
fn test_cycle_frees_empty_pages_and_compacts() {
    let mut config = common::test_config();
    config.fragmentation_limit = 0.0;
    let fixture = HeapFixture::with_config(config);
    let live = fixture.fill_pages(10, 4, 4);
    assert_eq!(live.len(), 16);
    assert_eq!(fixture.heap.used(), 10 * PAGE_SIZE_SMALL);

    let cycle = fixture.gc.collect(GcCause::Explicit).unwrap();

    assert!(!cycle.aborted);
    assert_eq!(cycle.used_before, 10 * PAGE_SIZE_SMALL);
    assert_eq!(fixture.heap.phase(), Phase::Relocate);

    let small = cycle.selector.small;
    assert_eq!(small.npages, 10);
    assert_eq!(small.empty, 6 * PAGE_SIZE_SMALL);
    assert_eq!(small.live, 16 * OBJECT_SIZE);
    assert_eq!(small.candidates, 4);
    // Three quarter-full pages fit in one; a fourth would need a second.
    assert_eq!(small.selected, 3);
    assert_eq!(small.compacting_to, PAGE_SIZE_SMALL);
    // Empty pages never get a forwarding.
    assert_eq!(fixture.heap.relocation_set_len(), 3);

    assert_eq!(cycle.relocation.pages, 3);
    assert_eq!(cycle.relocation.in_place, 0);
    assert_eq!(cycle.relocation.relocated_objects, 12);
    assert_eq!(cycle.relocation.relocated_bytes, 12 * OBJECT_SIZE);
    assert_eq!(cycle.relocation.freed_bytes, 3 * PAGE_SIZE_SMALL);

    // One unselected page plus at most one target page per worker.
    assert!(cycle.used_after <= 3 * PAGE_SIZE_SMALL);
    assert!(cycle.reclaimed >= 9 * PAGE_SIZE_SMALL);

    for (root, fill) in live {
        let ptr = fixture.load_root(root);
        assert!(fixture.heap.address_space().is_good(ptr));
        assert!(fixture.heap.is_in(ptr));
        assert!(unsafe { verify_object(ptr, OBJECT_SIZE, fill) });
    }
}

#[test]
fn test_fragmentation_limit_100_selects_nothing() {
    let mut config = common::test_config();
    config.fragmentation_limit = 100.0;
    let fixture = HeapFixture::with_config(config);
    let live = fixture.fill_pages(10, 4, 4);

    let cycle = fixture.gc.collect(GcCause::Explicit).unwrap();

    assert_eq!(cycle.selector.small.empty, 6 * PAGE_SIZE_SMALL);
    assert_eq!(cycle.selector.small.candidates, 0);
    assert_eq!(cycle.selector.small.selected, 0);
    assert_eq!(cycle.relocation.pages, 0);
    assert_eq!(cycle.used_after, 4 * PAGE_SIZE_SMALL);
    assert_eq!(fixture.heap.relocation_set_len(), 0);

    // Nothing moved: every root heals to the same offset.
    for (root, fill) in live {
        let before = fixture.marking.root(root);
        let after = fixture.load_root(root);
        let space = fixture.heap.address_space();
        assert_eq!(space.offset_of(before), space.offset_of(after));
        assert!(unsafe { verify_object(after, OBJECT_SIZE, fill) });
    }
}

#[test]
fn test_unreachable_heap_is_freed() {
    let fixture = HeapFixture::with_defaults();
    fixture.fill_pages(5, 0, 0);

    let cycle = fixture.gc.collect(GcCause::Explicit).unwrap();

    assert_eq!(cycle.selector.small.empty, 5 * PAGE_SIZE_SMALL);
    assert_eq!(cycle.used_after, 0);
    assert_eq!(fixture.heap.page_count(), 0);
}

#[test]
fn test_objects_survive_repeated_cycles() {
    let fixture = HeapFixture::with_defaults();
    let live = fixture.fill_pages(6, 6, 3);

    for _ in 0..4 {
        fixture.gc.collect(GcCause::Explicit).unwrap();

        for &(root, fill) in &live {
            let ptr = fixture.load_root(root);
            assert!(unsafe { verify_object(ptr, OBJECT_SIZE, fill) });
        }
    }

    let summary = fixture.gc.stats().summary();
    assert_eq!(summary.cycles, 4);
    assert_eq!(summary.aborted_cycles, 0);
    assert_eq!(fixture.heap.cycle(), 4);
    assert_eq!(fixture.gc.stats().history().len(), 4);
}

#[test]
fn test_mark_end_retries_until_marking_done() {
    let fixture = HeapFixture::with_defaults();
    fixture.fill_pages(2, 2, 2);
    fixture.marking.delay_mark_end(2);

    let cycle = fixture.gc.collect(GcCause::Explicit).unwrap();

    // Initial mark plus one continuation per failed mark end.
    assert_eq!(fixture.marking.rounds(), 3);
    assert!(cycle.phases.get("Concurrent Mark Continue").is_some());
    assert!(!cycle.aborted);
}

#[test]
fn test_phase_timings_in_execution_order() {
    let fixture = HeapFixture::with_defaults();
    fixture.fill_pages(2, 1, 1);

    let cycle = fixture.gc.collect(GcCause::Explicit).unwrap();
    let phases: Vec<&str> = cycle.phases.iter().map(|(name, _)| name).collect();

    assert_eq!(
        phases,
        vec![
            "Pause Mark Start",
            "Concurrent Mark",
            "Pause Mark End",
            "Concurrent Process Non-Strong References",
            "Concurrent Reset Relocation Set",
            "Concurrent Select Relocation Set",
            "Pause Relocate Start",
            "Concurrent Relocate",
        ]
    );
    assert_eq!(cycle.duration(), cycle.phases.total());
}

#[test]
fn test_allocation_failure_triggers_collection() {
    let mut config = common::test_config();
    config.max_heap_size = 16 * zheap::globals::MB;
    config.min_heap_size = 8 * zheap::globals::MB;
    config.initial_heap_size = 8 * zheap::globals::MB;
    let fixture = HeapFixture::with_config(config);

    // Nothing is rooted, so every cycle frees the whole heap.
    for index in 0..200 {
        fixture.alloc(OBJECT_SIZE, index as u8);
    }

    let history = fixture.gc.stats().history();
    assert!(!history.is_empty());
    assert!(history[0].cause.starts_with("Allocation Failure"));
}

#[test]
fn test_oversized_allocation_is_out_of_memory() {
    let fixture = HeapFixture::with_defaults();

    for size in [usize::MAX - 3, usize::MAX / 2, 1 << 50] {
        match fixture.heap.alloc_object(size) {
            Err(err @ HeapError::OutOfMemory { .. }) => assert!(err.is_recoverable()),
            other => panic!("expected OutOfMemory for {:#x}, got {:?}", size, other),
        }
    }
    assert_eq!(fixture.heap.used(), 0);

    // The heap is still usable afterwards.
    let ptr = fixture.alloc(OBJECT_SIZE, 3);
    assert!(unsafe { verify_object(ptr, OBJECT_SIZE, 3) });
}

#[test]
fn test_cycle_events_are_logged() {
    let fixture = HeapFixture::with_defaults();
    fixture.fill_pages(2, 1, 1);
    fixture.heap.logger().clear();

    fixture.gc.collect(GcCause::Explicit).unwrap();
    let events = fixture.heap.logger().events();

    assert!(matches!(
        events.first(),
        Some(GcEvent::CycleStart { cycle: 1, cause }) if cause == "Explicit"
    ));
    assert!(events
        .iter()
        .any(|event| matches!(event, GcEvent::CycleEnd { cycle: 1, .. })));
    assert!(matches!(events.last(), Some(GcEvent::HeapStats { .. })));
    // Phase events are below the default Info level.
    assert!(!events
        .iter()
        .any(|event| matches!(event, GcEvent::PhaseStart { .. })));
}
