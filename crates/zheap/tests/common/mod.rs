//! Test Utilities for zheap Integration Tests
//!
//! Heaps here run on the real platform backing, so relocation copies real
//! memory through the multi-mapped views. Objects use the [`SizeHeader`]
//! layout: the first word is the object size, the rest is a fill byte the
//! tests verify after the object moved.

#![allow(dead_code)]

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use zheap::globals::{MB, PAGE_SIZE_SMALL};
use zheap::{
    Collaborators, ColoredPointer, GarbageCollector, Heap, HeapConfig, MarkingCollaborator,
    SizeHeader,
};

/// Max heap for tests. Small enough that the medium page class is off.
pub const TEST_HEAP_SIZE: usize = 64 * MB;

/// Object size that packs exactly 16 objects into a small page
pub const OBJECT_SIZE: usize = PAGE_SIZE_SMALL / 16;

pub fn test_config() -> HeapConfig {
    HeapConfig {
        max_heap_size: TEST_HEAP_SIZE,
        min_heap_size: 8 * MB,
        initial_heap_size: 8 * MB,
        gc_threads: Some(2),
        uncommit: false,
        ..Default::default()
    }
}

/// Marks the objects behind a fixed set of roots.
///
/// Roots are healed to the current good color while marking, the way a
/// load barrier would heal them.
#[derive(Default)]
pub struct RootMarking {
    roots: Mutex<Vec<ColoredPointer>>,
    extra_rounds: AtomicUsize,
    rounds: AtomicUsize,
}

impl RootMarking {
    pub fn add_root(&self, ptr: ColoredPointer) -> usize {
        let mut roots = self.roots.lock();
        roots.push(ptr);
        roots.len() - 1
    }

    pub fn root(&self, index: usize) -> ColoredPointer {
        self.roots.lock()[index]
    }

    pub fn roots(&self) -> Vec<ColoredPointer> {
        self.roots.lock().clone()
    }

    /// Make the next `rounds` mark end attempts report unfinished work.
    pub fn delay_mark_end(&self, rounds: usize) {
        self.extra_rounds.store(rounds, Ordering::Relaxed);
    }

    /// Number of `mark` calls so far
    pub fn rounds(&self) -> usize {
        self.rounds.load(Ordering::Relaxed)
    }
}

impl MarkingCollaborator for RootMarking {
    fn start(&self, _heap: &Heap) {}

    fn mark(&self, heap: &Heap, initial: bool) {
        self.rounds.fetch_add(1, Ordering::Relaxed);
        if !initial {
            return;
        }

        for root in self.roots.lock().iter_mut() {
            let healed = heap.barrier_slow_path(*root);
            let offset = heap.address_space().offset_of(healed);
            heap.mark_object(offset, false);
            *root = healed;
        }
    }

    fn end(&self, _heap: &Heap) -> bool {
        let pending = self.extra_rounds.load(Ordering::Relaxed);
        if pending == 0 {
            return true;
        }
        self.extra_rounds.store(pending - 1, Ordering::Relaxed);
        false
    }
}

/// Heap, collector and root set for one test
pub struct HeapFixture {
    pub heap: Arc<Heap>,
    pub gc: GarbageCollector,
    pub marking: Arc<RootMarking>,
}

impl HeapFixture {
    pub fn with_defaults() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: HeapConfig) -> Self {
        let marking = Arc::new(RootMarking::default());
        let collaborators = Collaborators::new(marking.clone(), Arc::new(SizeHeader));
        let heap = Arc::new(
            Heap::new(config, collaborators).expect("heap initialization should succeed"),
        );
        let gc = GarbageCollector::new(Arc::clone(&heap));

        Self { heap, gc, marking }
    }

    /// Allocate an object of `size` bytes filled with `fill`.
    pub fn alloc(&self, size: usize, fill: u8) -> ColoredPointer {
        assert!(size >= std::mem::size_of::<usize>());
        let ptr = self.gc.alloc_object(size).expect("allocation should succeed");
        unsafe { write_object(ptr, size, fill) };
        ptr
    }

    /// Allocate `pages` small pages worth of objects, rooting the first
    /// `live_per_page` objects of each of the first `live_pages` pages.
    ///
    /// Returns the root indices together with each object's fill byte.
    pub fn fill_pages(
        &self,
        pages: usize,
        live_pages: usize,
        live_per_page: usize,
    ) -> Vec<(usize, u8)> {
        let per_page = PAGE_SIZE_SMALL / OBJECT_SIZE;
        let mut live = Vec::new();

        for index in 0..pages * per_page {
            let fill = (index % 251) as u8;
            let ptr = self.alloc(OBJECT_SIZE, fill);
            let page = index / per_page;
            if page < live_pages && index % per_page < live_per_page {
                live.push((self.marking.add_root(ptr), fill));
            }
        }
        live
    }

    /// Current pointer of root `index`, healed through the barrier.
    pub fn load_root(&self, index: usize) -> ColoredPointer {
        self.heap.barrier_slow_path(self.marking.root(index))
    }
}

/// Write a `SizeHeader` object.
///
/// # Safety
///
/// `ptr` must point to at least `size` writable bytes.
pub unsafe fn write_object(ptr: ColoredPointer, size: usize, fill: u8) {
    let base = ptr.as_mut_ptr::<u8>();
    std::ptr::write(base as *mut usize, size);
    std::ptr::write_bytes(base.add(std::mem::size_of::<usize>()), fill, size - 8);
}

/// Check a `SizeHeader` object written by [`write_object`].
///
/// # Safety
///
/// `ptr` must point to a live object.
pub unsafe fn verify_object(ptr: ColoredPointer, size: usize, fill: u8) -> bool {
    let base = ptr.as_mut_ptr::<u8>();
    if std::ptr::read(base as *const usize) != size {
        return false;
    }
    let body = std::slice::from_raw_parts(base.add(std::mem::size_of::<usize>()), size - 8);
    body.iter().all(|&byte| byte == fill)
}
