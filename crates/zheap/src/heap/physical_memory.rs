//! Physical Memory Management
//!
//! Physical memory is addressed by an offset into the backing, in
//! `[0, max_capacity)`. A page's physical memory is a list of segments that
//! need not be adjacent; it is mapped in order into the page's virtual range
//! in every heap view.
//!
//! Segment lists are kept sorted and coalesced: two adjacent segments with
//! the same commit state are always merged into one.

use crate::address::{AddressLayout, Offset, View};
use crate::backing::Backing;
use crate::globals::GRANULE_SIZE;
use crate::heap::memory_manager::MemoryManager;
use crate::util::{fatal, memory, Alignment};
use std::sync::Arc;

/// PhysicalMemorySegment - `[start, start + size)` of the backing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalMemorySegment {
    start: usize,
    size: usize,
    committed: bool,
}

impl PhysicalMemorySegment {
    pub fn new(start: usize, size: usize, committed: bool) -> Self {
        Self {
            start,
            size,
            committed,
        }
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.start + self.size
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    fn mergeable(&self, next: &PhysicalMemorySegment) -> bool {
        self.end() == next.start && self.committed == next.committed
    }
}

/// PhysicalMemory - ordered, coalesced segment list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhysicalMemory {
    segments: Vec<PhysicalMemorySegment>,
}

impl PhysicalMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_segment(segment: PhysicalMemorySegment) -> Self {
        let mut pmem = Self::new();
        pmem.add_segment(segment);
        pmem
    }

    pub fn is_null(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn size(&self) -> usize {
        self.segments.iter().map(|s| s.size).sum()
    }

    pub fn committed(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| s.committed)
            .map(|s| s.size)
            .sum()
    }

    pub fn is_fully_committed(&self) -> bool {
        self.segments.iter().all(|s| s.committed)
    }

    pub fn nsegments(&self) -> usize {
        self.segments.len()
    }

    pub fn segment(&self, index: usize) -> &PhysicalMemorySegment {
        &self.segments[index]
    }

    pub fn segments(&self) -> &[PhysicalMemorySegment] {
        &self.segments
    }

    /// Insert a segment at its sorted position, merging with neighbours.
    pub fn add_segment(&mut self, segment: PhysicalMemorySegment) {
        if segment.size == 0 {
            return;
        }
        let index = self
            .segments
            .partition_point(|s| s.start < segment.start);
        debug_assert!(
            index == 0 || self.segments[index - 1].end() <= segment.start,
            "overlapping segment"
        );
        self.segments.insert(index, segment);
        self.coalesce_around(index);
    }

    pub fn add_segments(&mut self, other: &PhysicalMemory) {
        for segment in &other.segments {
            self.add_segment(*segment);
        }
    }

    pub fn remove_segments(&mut self) {
        self.segments.clear();
    }

    // Merge segment `index` with its neighbours where possible.
    fn coalesce_around(&mut self, mut index: usize) {
        if index >= self.segments.len() {
            return;
        }
        if index > 0 && self.segments[index - 1].mergeable(&self.segments[index]) {
            self.segments[index - 1].size += self.segments[index].size;
            self.segments.remove(index);
            index -= 1;
        }
        if index + 1 < self.segments.len()
            && self.segments[index].mergeable(&self.segments[index + 1])
        {
            self.segments[index].size += self.segments[index + 1].size;
            self.segments.remove(index + 1);
        }
    }

    /// Change the commit state of `[start, start + size)`, which must lie
    /// inside one segment.
    fn set_committed(&mut self, start: usize, size: usize, committed: bool) {
        if size == 0 {
            return;
        }
        let Some(index) = self
            .segments
            .iter()
            .position(|s| s.start <= start && start + size <= s.end())
        else {
            panic!("range {:#x}+{:#x} not inside one segment", start, size);
        };

        let segment = self.segments[index];
        if segment.committed == committed {
            return;
        }

        let mut parts = Vec::with_capacity(3);
        if start > segment.start {
            parts.push(PhysicalMemorySegment::new(
                segment.start,
                start - segment.start,
                segment.committed,
            ));
        }
        parts.push(PhysicalMemorySegment::new(start, size, committed));
        if start + size < segment.end() {
            parts.push(PhysicalMemorySegment::new(
                start + size,
                segment.end() - start - size,
                segment.committed,
            ));
        }

        let count = parts.len();
        self.segments.splice(index..index + 1, parts);
        // The changed part can now merge with the segments outside.
        self.coalesce_around(index + count - 1);
        self.coalesce_around(index);
    }

    pub fn mark_committed(&mut self, start: usize, size: usize) {
        self.set_committed(start, size, true);
    }

    pub fn mark_uncommitted(&mut self, start: usize, size: usize) {
        self.set_committed(start, size, false);
    }

    /// Remove the first `size` bytes, in segment order.
    pub fn split(&mut self, size: usize) -> PhysicalMemory {
        let mut pmem = PhysicalMemory::new();
        let mut remaining = size;
        let mut kept = Vec::with_capacity(self.segments.len());

        for segment in self.segments.drain(..) {
            if remaining == 0 {
                kept.push(segment);
            } else if segment.size <= remaining {
                remaining -= segment.size;
                pmem.add_segment(segment);
            } else {
                pmem.add_segment(PhysicalMemorySegment::new(
                    segment.start,
                    remaining,
                    segment.committed,
                ));
                kept.push(PhysicalMemorySegment::new(
                    segment.start + remaining,
                    segment.size - remaining,
                    segment.committed,
                ));
                remaining = 0;
            }
        }

        assert_eq!(remaining, 0, "split larger than physical memory");
        self.segments = kept;
        pmem
    }

    /// Remove the last `size` bytes, in segment order.
    pub fn split_tail(&mut self, size: usize) -> PhysicalMemory {
        let total = self.size();
        assert!(size <= total, "split larger than physical memory");
        let front = self.split(total - size);
        std::mem::replace(self, front)
    }

    /// Remove every committed segment.
    pub fn split_committed(&mut self) -> PhysicalMemory {
        let mut pmem = PhysicalMemory::new();
        self.segments.retain(|segment| {
            if segment.committed {
                pmem.add_segment(*segment);
                false
            } else {
                true
            }
        });
        pmem
    }
}

/// PhysicalMemoryManager - backing free list, commit and mapping
pub struct PhysicalMemoryManager {
    backing: Arc<dyn Backing>,
    layout: AddressLayout,
    manager: MemoryManager,
}

impl PhysicalMemoryManager {
    pub fn new(backing: Arc<dyn Backing>, layout: AddressLayout, max_capacity: usize) -> Self {
        let manager = MemoryManager::new();
        manager.free(0, max_capacity);
        Self {
            backing,
            layout,
            manager,
        }
    }

    /// Probe whether the backing can give memory back to the OS.
    ///
    /// Commits and uncommits the first granule; returns false when either
    /// step fails. Uncommit is also pointless when min equals max.
    pub fn try_enable_uncommit(&self, min_capacity: usize, max_capacity: usize) -> bool {
        if min_capacity == max_capacity {
            log::info!("Uncommit: Implicitly Disabled (-Xms equals -Xmx)");
            return false;
        }

        if self.backing.commit(0, GRANULE_SIZE) != GRANULE_SIZE {
            log::info!("Uncommit: Implicitly Disabled (Commit failed)");
            return false;
        }

        if self.backing.uncommit(0, GRANULE_SIZE) != GRANULE_SIZE {
            log::info!("Uncommit: Implicitly Disabled (Not supported by operating system)");
            return false;
        }

        log::info!("Uncommit: Enabled");
        true
    }

    /// Allocate `size` bytes of uncommitted backing into `pmem`.
    ///
    /// The caller accounts capacity, so the free list always holds enough.
    pub fn alloc(&self, pmem: &mut PhysicalMemory, size: usize) {
        debug_assert!(Alignment::is_granule_aligned(size));
        let mut remaining = size;
        while remaining > 0 {
            let Some((start, allocated)) = self.manager.alloc_from_front_at_most(remaining) else {
                fatal("physical memory exhausted despite capacity accounting");
            };
            pmem.add_segment(PhysicalMemorySegment::new(start, allocated, false));
            remaining -= allocated;
        }
    }

    pub fn free(&self, pmem: &PhysicalMemory) {
        for segment in pmem.segments() {
            self.manager.free(segment.start(), segment.size());
        }
    }

    /// Commit every uncommitted segment. Returns false on a shortfall, with
    /// the committed part recorded in `pmem`.
    pub fn commit(&self, pmem: &mut PhysicalMemory) -> bool {
        let uncommitted: Vec<PhysicalMemorySegment> = pmem
            .segments()
            .iter()
            .filter(|s| !s.is_committed())
            .copied()
            .collect();

        for segment in uncommitted {
            let committed = self.backing.commit(segment.start(), segment.size());
            pmem.mark_committed(segment.start(), committed);
            if committed != segment.size() {
                return false;
            }
        }
        true
    }

    /// Uncommit every committed segment. Returns false on a shortfall.
    pub fn uncommit(&self, pmem: &mut PhysicalMemory) -> bool {
        let committed: Vec<PhysicalMemorySegment> = pmem
            .segments()
            .iter()
            .filter(|s| s.is_committed())
            .copied()
            .collect();

        for segment in committed {
            let uncommitted = self.backing.uncommit(segment.start(), segment.size());
            pmem.mark_uncommitted(segment.start(), uncommitted);
            if uncommitted != segment.size() {
                return false;
            }
        }
        true
    }

    /// Map `pmem` at `offset` in every heap view.
    pub fn map(&self, offset: Offset, pmem: &PhysicalMemory) {
        for view in View::MAPPED {
            let mut addr = self.layout.view_address(offset, view);
            for segment in pmem.segments() {
                if let Err(e) = self.backing.map(addr, segment.size(), segment.start()) {
                    fatal(&format!(
                        "Failed to map {:#x}..{:#x} ({}): {}",
                        addr,
                        addr + segment.size(),
                        self.backing.name(),
                        e
                    ));
                }
                addr += segment.size();
            }
        }
    }

    /// Unmap `[offset, offset + size)` in every heap view.
    pub fn unmap(&self, offset: Offset, size: usize) {
        for view in View::MAPPED {
            let addr = self.layout.view_address(offset, view);
            if let Err(e) = self.backing.unmap(addr, size) {
                fatal(&format!(
                    "Failed to unmap {:#x}..{:#x} ({}): {}",
                    addr,
                    addr + size,
                    self.backing.name(),
                    e
                ));
            }
        }
    }

    /// Touch mapped memory so the OS backs it now.
    pub fn pretouch(&self, offset: Offset, size: usize) {
        // The views alias the same memory, touching one is enough.
        let addr = self.layout.view_address(offset, View::Remapped);
        // SAFETY: the range was mapped by `map`.
        unsafe { memory::pretouch(addr, size, self.backing.pretouch_granularity()) };
    }

    /// Free backing bytes, committed or not
    pub fn available(&self) -> usize {
        self.manager.free_bytes()
    }
}
