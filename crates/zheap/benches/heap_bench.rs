//! zheap Benchmarks
//!
//! Run with: `cargo bench --package zheap`

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use std::sync::Arc;
use zheap::address::{AddressLayout, AddressSpace, Offset};
use zheap::globals::{MB, PAGE_SIZE_SMALL};
use zheap::heap::memory_manager::MemoryManager;
use zheap::{Collaborators, GarbageCollector, GcCause, Heap, HeapConfig, NoMarking, SizeHeader};

fn bench_config() -> HeapConfig {
    HeapConfig {
        max_heap_size: 256 * MB,
        min_heap_size: 32 * MB,
        initial_heap_size: 32 * MB,
        gc_threads: Some(2),
        uncommit: false,
        ..Default::default()
    }
}

fn create_gc() -> GarbageCollector {
    let collaborators = Collaborators::new(Arc::new(NoMarking), Arc::new(SizeHeader));
    let heap = Heap::new(bench_config(), collaborators).unwrap();
    GarbageCollector::new(Arc::new(heap))
}

fn bench_colored_pointers(c: &mut Criterion) {
    let mut group = c.benchmark_group("colored_pointers");
    let space = AddressSpace::new(AddressLayout::for_max_heap(256 * MB));
    let offset = Offset::new(3 * PAGE_SIZE_SMALL + 64);

    group.bench_function("good", |b| b.iter(|| black_box(space.good(black_box(offset)))));

    let ptr = space.good(offset);
    group.bench_function("is_good", |b| b.iter(|| black_box(space.is_good(black_box(ptr)))));
    group.bench_function("offset_of", |b| {
        b.iter(|| black_box(space.offset_of(black_box(ptr))))
    });

    group.finish();
}

fn bench_allocation(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocation");

    for &size in &[16usize, 64, 256, 4096, 65536] {
        let gc = create_gc();
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("size_{}", size), |b| {
            b.iter(|| {
                let ptr = gc.alloc_object(size).unwrap();
                unsafe { *ptr.as_mut_ptr::<usize>() = size };
                black_box(ptr)
            })
        });
    }

    group.finish();
}

fn bench_memory_manager(c: &mut Criterion) {
    let mut group = c.benchmark_group("memory_manager");

    group.bench_function("alloc_free_front", |b| {
        let manager = MemoryManager::new();
        manager.free(0, 1024 * PAGE_SIZE_SMALL);
        b.iter(|| {
            let start = manager.alloc_from_front(PAGE_SIZE_SMALL).unwrap();
            manager.free(black_box(start), PAGE_SIZE_SMALL);
        })
    });

    group.finish();
}

fn bench_gc_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("gc_cycle");
    group.sample_size(20);

    group.bench_function("unreachable_16_pages", |b| {
        let gc = create_gc();
        b.iter_batched(
            || {
                for _ in 0..16 * 16 {
                    let size = PAGE_SIZE_SMALL / 16;
                    let ptr = gc.alloc_object(size).unwrap();
                    unsafe { *ptr.as_mut_ptr::<usize>() = size };
                }
            },
            |_| black_box(gc.collect(GcCause::Explicit).unwrap()),
            BatchSize::PerIteration,
        )
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_colored_pointers,
    bench_allocation,
    bench_memory_manager,
    bench_gc_cycle
);
criterion_main!(benches);
