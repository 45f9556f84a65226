//! Randomized Memory Tests
//!
//! Seeded random interleavings of range allocation and freeing, and of
//! object allocation across collection cycles.

mod common;

use common::{verify_object, HeapFixture};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use zheap::globals::{GRANULE_SIZE, PAGE_SIZE_SMALL};
use zheap::heap::memory_manager::MemoryManager;
use zheap::heap::physical_memory::{PhysicalMemory, PhysicalMemorySegment};
use zheap::GcCause;

const GRANULES: usize = 64;

#[test]
fn test_memory_manager_random_interleaving() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let manager = MemoryManager::new();
    manager.free(0, GRANULES * GRANULE_SIZE);

    let mut allocated: Vec<(usize, usize)> = Vec::new();

    for _ in 0..2000 {
        if allocated.is_empty() || rng.gen_bool(0.55) {
            let size = rng.gen_range(1..=4) * GRANULE_SIZE;
            let start = if rng.gen_bool(0.5) {
                manager.alloc_from_front(size)
            } else {
                manager.alloc_from_back(size)
            };
            if let Some(start) = start {
                assert_eq!(start % GRANULE_SIZE, 0);
                assert!(start + size <= GRANULES * GRANULE_SIZE);
                for &(other, other_size) in &allocated {
                    assert!(start + size <= other || other + other_size <= start);
                }
                allocated.push((start, size));
            }
        } else {
            let index = rng.gen_range(0..allocated.len());
            let (start, size) = allocated.swap_remove(index);
            manager.free(start, size);
        }

        let used: usize = allocated.iter().map(|&(_, size)| size).sum();
        assert_eq!(manager.free_bytes() + used, GRANULES * GRANULE_SIZE);
    }

    for (start, size) in allocated.drain(..) {
        manager.free(start, size);
    }
    assert_eq!(manager.areas(), vec![(0, GRANULES * GRANULE_SIZE)]);
}

#[test]
fn test_physical_memory_random_splits() {
    let mut rng = StdRng::seed_from_u64(42);
    let mut pmem = PhysicalMemory::new();

    // Every other granule, so segments never coalesce.
    for index in (0..GRANULES).step_by(2) {
        pmem.add_segment(PhysicalMemorySegment::new(
            index * GRANULE_SIZE,
            GRANULE_SIZE,
            rng.gen_bool(0.5),
        ));
    }
    let total = pmem.size();
    let committed = pmem.committed();

    let mut pieces = Vec::new();
    while pmem.size() > 0 {
        let granules = rng.gen_range(1..=3).min(pmem.size() / GRANULE_SIZE);
        let piece = if rng.gen_bool(0.5) {
            pmem.split(granules * GRANULE_SIZE)
        } else {
            pmem.split_tail(granules * GRANULE_SIZE)
        };
        assert_eq!(piece.size(), granules * GRANULE_SIZE);
        pieces.push(piece);
    }

    let mut joined = PhysicalMemory::new();
    for piece in &pieces {
        joined.add_segments(piece);
    }
    assert_eq!(joined.size(), total);
    assert_eq!(joined.committed(), committed);
    assert_eq!(joined.nsegments(), GRANULES / 2);
}

/// Check `pmem` against the per-granule model and that no two touching
/// segments share a commit state.
fn assert_coalesced(pmem: &PhysicalMemory, model: &[Option<bool>]) {
    for pair in pmem.segments().windows(2) {
        assert!(pair[0].end() <= pair[1].start());
        assert!(
            pair[0].end() != pair[1].start() || pair[0].is_committed() != pair[1].is_committed(),
            "unmerged neighbours at {:#x}",
            pair[1].start()
        );
    }

    let mut expected = vec![None; model.len()];
    for segment in pmem.segments() {
        assert_eq!(segment.start() % GRANULE_SIZE, 0);
        for granule in segment.start() / GRANULE_SIZE..segment.end() / GRANULE_SIZE {
            expected[granule] = Some(segment.is_committed());
        }
    }
    assert_eq!(expected, model);
}

#[test]
fn test_physical_memory_coalesces_under_random_commits() {
    let mut rng = StdRng::seed_from_u64(0xc0a1);

    for _ in 0..50 {
        let mut pmem = PhysicalMemory::new();
        let mut model: Vec<Option<bool>> = vec![None; GRANULES];

        for _ in 0..200 {
            let granule = rng.gen_range(0..GRANULES);
            let start = granule * GRANULE_SIZE;
            match model[granule] {
                None => {
                    let committed = rng.gen_bool(0.5);
                    pmem.add_segment(PhysicalMemorySegment::new(start, GRANULE_SIZE, committed));
                    model[granule] = Some(committed);
                },
                Some(_) if rng.gen_bool(0.5) => {
                    pmem.mark_committed(start, GRANULE_SIZE);
                    model[granule] = Some(true);
                },
                Some(_) => {
                    pmem.mark_uncommitted(start, GRANULE_SIZE);
                    model[granule] = Some(false);
                },
            }
            assert_coalesced(&pmem, &model);
        }

        let present = model.iter().filter(|state| state.is_some()).count();
        let committed = model.iter().filter(|state| **state == Some(true)).count();
        assert_eq!(pmem.size(), present * GRANULE_SIZE);
        assert_eq!(pmem.committed(), committed * GRANULE_SIZE);
    }
}

#[test]
fn test_random_object_graph_across_cycles() {
    let mut rng = StdRng::seed_from_u64(7);
    let fixture = HeapFixture::with_defaults();
    let mut live = Vec::new();

    for round in 0..3 {
        for _ in 0..400 {
            let size = rng.gen_range(2..=512) * 16;
            let fill = rng.gen::<u8>();
            let ptr = fixture.alloc(size, fill);
            if rng.gen_bool(0.2) {
                live.push((fixture.marking.add_root(ptr), size, fill));
            }
        }

        let cycle = fixture.gc.collect(GcCause::Timer).unwrap();
        assert_eq!(cycle.cycle, round + 1);
        assert!(cycle.used_after <= cycle.used_before + 2 * PAGE_SIZE_SMALL);

        for &(root, size, fill) in &live {
            let ptr = fixture.load_root(root);
            assert!(fixture.heap.is_in(ptr));
            assert!(unsafe { verify_object(ptr, size, fill) });
        }
    }
}
