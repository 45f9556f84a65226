//! Virtual Memory Management
//!
//! Reserves the object space once in every heap view and hands out
//! granule-aligned offset ranges for pages.
//!
//! ```text
//!   offset space [0, offset_max)
//!  +--------+------------------+--------+
//!  | small  |       free       | medium |   small pages grow up from the
//!  | pages  |                  | large  |   bottom, the rest down from top
//!  +--------+------------------+--------+
//!      |  reserved identically in marked0, marked1 and remapped
//! ```
//!
//! A contiguous reservation is preferred. When no contiguous range of the
//! requested size is available in all three views, the space is reserved by
//! recursive bisection, skipping fragments smaller than 1% of the request.

use crate::address::{AddressLayout, Offset, View};
use crate::backing::AddressReserver;
use crate::globals::{GRANULE_SIZE, PAGE_SIZE_SMALL, VIRTUAL_TO_PHYSICAL_RATIO};
use crate::heap::memory_manager::MemoryManager;
use crate::util::Alignment;
use parking_lot::Mutex;
use std::sync::Arc;

/// VirtualMemory - `[start, end)` offset range owned by one page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualMemory {
    start: Offset,
    end: Offset,
}

impl VirtualMemory {
    pub fn new(start: Offset, size: usize) -> Self {
        Self {
            start,
            end: start + size,
        }
    }

    pub fn null() -> Self {
        Self {
            start: Offset::ZERO,
            end: Offset::ZERO,
        }
    }

    pub fn is_null(&self) -> bool {
        self.start == self.end
    }

    pub fn start(&self) -> Offset {
        self.start
    }

    pub fn end(&self) -> Offset {
        self.end
    }

    pub fn size(&self) -> usize {
        self.end - self.start
    }

    /// Remove the first `size` bytes and return them as a new range.
    pub fn split(&mut self, size: usize) -> VirtualMemory {
        assert!(size <= self.size(), "split larger than range");
        let front = VirtualMemory::new(self.start, size);
        self.start = self.start + size;
        front
    }

    /// Remove the last `size` bytes and return them as a new range.
    pub fn split_tail(&mut self, size: usize) -> VirtualMemory {
        assert!(size <= self.size(), "split larger than range");
        self.end = self.end - size;
        VirtualMemory::new(self.end, size)
    }
}

/// VirtualMemoryManager - multi-view offset space
pub struct VirtualMemoryManager {
    layout: AddressLayout,
    reserver: Arc<dyn AddressReserver>,
    manager: MemoryManager,
    // Every (offset, size) reserved in all views, unreserved on drop.
    reservations: Mutex<Vec<(usize, usize)>>,
    reserved: usize,
    contiguous: bool,
    requested: usize,
}

impl VirtualMemoryManager {
    /// Reserve the object space for a heap of `max_capacity` bytes.
    ///
    /// Never fails by itself; check [`VirtualMemoryManager::is_initialized`]
    /// for whether enough address space was found.
    pub fn new(
        layout: AddressLayout,
        reserver: Arc<dyn AddressReserver>,
        max_capacity: usize,
    ) -> Self {
        let manager = MemoryManager::with_callbacks(reserver.callbacks(layout));
        let mut vmm = Self {
            layout,
            reserver,
            manager,
            reservations: Mutex::new(Vec::new()),
            reserved: 0,
            contiguous: true,
            requested: 0,
        };
        vmm.reserve(max_capacity);
        vmm
    }

    fn reserve(&mut self, max_capacity: usize) {
        let size = Alignment::align_down_to_granule(
            max_capacity
                .saturating_mul(VIRTUAL_TO_PHYSICAL_RATIO)
                .min(self.layout.offset_max()),
        );
        self.requested = size;

        if self.reserve_contiguous(size) {
            self.reserved = size;
            self.contiguous = true;
        } else {
            self.reserved = self.reserve_discontiguous(size);
            self.contiguous = false;
        }

        log::info!(
            "Address Space Type: {}/{}",
            if self.contiguous { "Contiguous" } else { "Discontiguous" },
            if self.is_complete() { "Complete" } else { "Degraded" }
        );
        log::info!(
            "Address Space Size: {}M x {} = {}M",
            self.reserved >> 20,
            View::MAPPED.len(),
            (self.reserved * View::MAPPED.len()) >> 20
        );
    }

    fn reserve_contiguous(&self, size: usize) -> bool {
        let offset_max = self.layout.offset_max();
        let unused = offset_max - size;
        let increment = Alignment::align_up_to_granule(unused / 8192).max(GRANULE_SIZE);

        let mut start = 0;
        while start + size <= offset_max {
            if self.reserve_contiguous_at(start, size) {
                return true;
            }
            start += increment;
        }
        false
    }

    /// Reserve `[start, start + size)` in all views, or in none.
    fn reserve_contiguous_at(&self, start: usize, size: usize) -> bool {
        let offset = Offset::new(start);
        let mut done: Vec<usize> = Vec::with_capacity(View::MAPPED.len());

        for view in View::MAPPED {
            let addr = self.layout.view_address(offset, view);
            if !self.reserver.reserve(addr, size) {
                for addr in done {
                    self.reserver.unreserve(addr, size);
                }
                return false;
            }
            done.push(addr);
        }

        self.reservations.lock().push((start, size));
        self.manager.free(start, size);
        true
    }

    fn reserve_discontiguous(&self, size: usize) -> usize {
        let offset_max = self.layout.offset_max();
        let min_range = Alignment::align_up_to_granule(size / 100);

        let mut start = 0;
        let mut reserved = 0;
        while reserved < size && start < offset_max {
            let remaining = (size - reserved).min(offset_max - start);
            reserved += self.reserve_discontiguous_at(start, remaining, min_range);
            start += remaining;
        }
        reserved
    }

    fn reserve_discontiguous_at(&self, start: usize, size: usize, min_range: usize) -> usize {
        if size < min_range || size < GRANULE_SIZE {
            return 0;
        }

        if self.reserve_contiguous_at(start, size) {
            return size;
        }

        let half = Alignment::align_down_to_granule(size / 2);
        if half < min_range || half == 0 {
            return 0;
        }

        let first = self.reserve_discontiguous_at(start, half, min_range);
        let second = self.reserve_discontiguous_at(start + half, size - half, min_range);
        first + second
    }

    /// True when at least `max_capacity` bytes of offsets were reserved.
    pub fn is_initialized(&self, max_capacity: usize) -> bool {
        self.reserved >= max_capacity
    }

    pub fn reserved(&self) -> usize {
        self.reserved
    }

    pub fn is_contiguous(&self) -> bool {
        self.contiguous
    }

    /// False when less than the full request could be reserved.
    pub fn is_complete(&self) -> bool {
        self.reserved == self.requested
    }

    pub fn layout(&self) -> &AddressLayout {
        &self.layout
    }

    /// Allocate a granule-aligned range of `size` bytes.
    ///
    /// Small pages come from the low end so they pack together, everything
    /// else from the high end, unless `force_low_address` is set.
    pub fn alloc(&self, size: usize, force_low_address: bool) -> Option<VirtualMemory> {
        debug_assert!(Alignment::is_granule_aligned(size));

        let start = if force_low_address || size <= PAGE_SIZE_SMALL {
            self.manager.alloc_from_front(size)
        } else {
            self.manager.alloc_from_back(size)
        }?;

        Some(VirtualMemory::new(Offset::new(start), size))
    }

    pub fn free(&self, vmem: &VirtualMemory) {
        self.manager.free(vmem.start().raw(), vmem.size());
    }

    /// Free offset bytes
    pub fn available(&self) -> usize {
        self.manager.free_bytes()
    }
}

impl Drop for VirtualMemoryManager {
    fn drop(&mut self) {
        for (start, size) in self.reservations.lock().drain(..) {
            for view in View::MAPPED {
                let addr = self.layout.view_address(Offset::new(start), view);
                self.reserver.unreserve(addr, size);
            }
        }
    }
}
