//! Page - Unit of Allocation and Relocation
//!
//! A page pairs a virtual offset range with the physical memory mapped
//! behind it, in one of three size classes:
//!
//! ```text
//!  Small   2MB            8-byte object alignment, objects <= 256KB
//!  Medium  4MB..32MB      alignment size >> 13, objects <= size / 8
//!  Large   N x 2MB        exactly one object, starting at the page start
//! ```
//!
//! Objects are bump allocated from `top`. Liveness is tracked per object
//! slot in a [`LiveMap`] that belongs to the page.
//!
//! A page created (or reset) in the current cycle is *allocating*; once the
//! global sequence number moves on it becomes *relocatable*. Objects on an
//! allocating page are implicitly live.
//!
//! Geometry (type, ranges) only changes through `&mut self`, which the page
//! allocator has while the page sits in its cache. Everything a mutator or
//! GC worker touches concurrently is atomic.

use crate::address::Offset;
use crate::globals::{GlobalSeqNum, PageGeometry, PageType};
use crate::heap::live_map::{LiveMap, MarkResult};
use crate::heap::physical_memory::PhysicalMemory;
use crate::heap::virtual_memory::VirtualMemory;
use crate::util::Alignment;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Page - virtual range, physical memory and liveness of one size class
pub struct Page {
    page_type: PageType,
    alignment_shift: usize,
    geometry: PageGeometry,
    global_seqnum: Arc<GlobalSeqNum>,
    seqnum: AtomicU32,
    top: AtomicUsize,
    vmem: VirtualMemory,
    pmem: PhysicalMemory,
    livemap: LiveMap,
    last_used: Option<Instant>,
}

impl Page {
    pub fn new(
        page_type: PageType,
        vmem: VirtualMemory,
        pmem: PhysicalMemory,
        geometry: PageGeometry,
        global_seqnum: Arc<GlobalSeqNum>,
    ) -> Self {
        debug_assert_eq!(vmem.size(), pmem.size(), "virtual/physical size mismatch");
        let alignment_shift = geometry.object_alignment_shift(page_type);
        let seqnum = global_seqnum.get();
        Self {
            page_type,
            alignment_shift,
            geometry,
            global_seqnum,
            seqnum: AtomicU32::new(seqnum),
            top: AtomicUsize::new(vmem.start().raw()),
            livemap: LiveMap::new(Self::object_max_count(page_type, vmem.size(), alignment_shift)),
            vmem,
            pmem,
            last_used: None,
        }
    }

    fn object_max_count(page_type: PageType, size: usize, alignment_shift: usize) -> usize {
        match page_type {
            PageType::Large => 1,
            PageType::Small | PageType::Medium => size >> alignment_shift,
        }
    }

    pub fn page_type(&self) -> PageType {
        self.page_type
    }

    pub fn start(&self) -> Offset {
        self.vmem.start()
    }

    pub fn end(&self) -> Offset {
        self.vmem.end()
    }

    pub fn size(&self) -> usize {
        self.vmem.size()
    }

    pub fn top(&self) -> Offset {
        Offset::new(self.top.load(Ordering::Acquire))
    }

    /// Bytes left for allocation
    pub fn remaining(&self) -> usize {
        self.end() - self.top()
    }

    /// Bytes handed out so far
    pub fn used(&self) -> usize {
        self.top() - self.start()
    }

    pub fn object_alignment_shift(&self) -> usize {
        self.alignment_shift
    }

    pub fn object_alignment(&self) -> usize {
        1 << self.alignment_shift
    }

    pub fn virtual_memory(&self) -> &VirtualMemory {
        &self.vmem
    }

    pub fn physical_memory(&self) -> &PhysicalMemory {
        &self.pmem
    }

    pub fn physical_memory_mut(&mut self) -> &mut PhysicalMemory {
        &mut self.pmem
    }

    pub fn seqnum(&self) -> u32 {
        self.seqnum.load(Ordering::Acquire)
    }

    /// Allocated into during the current cycle.
    pub fn is_allocating(&self) -> bool {
        self.seqnum() == self.global_seqnum.get()
    }

    /// Created before the current cycle started.
    pub fn is_relocatable(&self) -> bool {
        self.seqnum() < self.global_seqnum.get()
    }

    pub fn last_used(&self) -> Option<Instant> {
        self.last_used
    }

    pub fn set_last_used(&mut self) {
        self.last_used = Some(Instant::now());
    }

    /// Offset inside the allocated part of the page.
    pub fn is_in(&self, offset: Offset) -> bool {
        offset >= self.start() && offset < self.top()
    }

    /// Prepare a cached page for reuse in cycle `seqnum`.
    pub fn reset(&mut self, seqnum: u32) {
        *self.seqnum.get_mut() = seqnum;
        *self.top.get_mut() = self.vmem.start().raw();
        self.livemap.reset();
        self.last_used = None;
    }

    /// Make the page allocating again so live objects can be compacted to
    /// its start. The live map is kept, it drives the compaction.
    pub fn reset_for_in_place_relocation(&self) {
        self.seqnum
            .store(self.global_seqnum.get(), Ordering::Release);
        self.top.store(self.vmem.start().raw(), Ordering::Release);
    }

    /// Change the size class of a page with the same memory.
    pub fn retype(&mut self, page_type: PageType) {
        if self.page_type == page_type {
            return;
        }
        self.page_type = page_type;
        self.alignment_shift = self.geometry.object_alignment_shift(page_type);
        self.livemap = LiveMap::new(Self::object_max_count(
            page_type,
            self.size(),
            self.alignment_shift,
        ));
    }

    fn reset_type_and_size(&mut self) {
        let page_type = self.geometry.type_from_size(self.size());
        self.page_type = page_type;
        self.alignment_shift = self.geometry.object_alignment_shift(page_type);
        self.livemap = LiveMap::new(Self::object_max_count(
            page_type,
            self.size(),
            self.alignment_shift,
        ));
        *self.top.get_mut() = self.vmem.start().raw();
    }

    /// Carve `size` bytes off the tail into a new page of `page_type`.
    ///
    /// This page keeps the front and takes the size class of what remains.
    /// Both pages keep the sequence number and last-used time.
    pub fn split(&mut self, page_type: PageType, size: usize) -> Page {
        assert!(size < self.size(), "Invalid split");
        debug_assert!(Alignment::is_granule_aligned(size));

        let vmem = self.vmem.split_tail(size);
        let pmem = self.pmem.split_tail(size);
        self.reset_type_and_size();

        self.split_off(page_type, vmem, pmem)
    }

    /// Split by size, with the size class derived from `size`.
    pub fn split_by_size(&mut self, size: usize) -> Page {
        let page_type = self.geometry.type_from_size(size);
        self.split(page_type, size)
    }

    /// Move all committed physical memory into a new page at the tail.
    pub fn split_committed(&mut self) -> Page {
        let pmem = self.pmem.split_committed();
        assert!(
            !pmem.is_null() && !self.pmem.is_null(),
            "split_committed needs committed and uncommitted memory"
        );

        let vmem = self.vmem.split_tail(pmem.size());
        self.reset_type_and_size();

        let page_type = self.geometry.type_from_size(vmem.size());
        self.split_off(page_type, vmem, pmem)
    }

    fn split_off(&self, page_type: PageType, vmem: VirtualMemory, pmem: PhysicalMemory) -> Page {
        let mut page = Page::new(
            page_type,
            vmem,
            pmem,
            self.geometry,
            Arc::clone(&self.global_seqnum),
        );
        *page.seqnum.get_mut() = self.seqnum();
        page.last_used = self.last_used;
        page
    }

    /// New page object over the same memory, for the page cache.
    ///
    /// Used when the old object may still be read through a page table
    /// lookup and can only be released once those readers are gone.
    pub fn reuse(&self) -> Page {
        let mut page = self.split_off(self.page_type, self.vmem, self.pmem.clone());
        page.last_used = None;
        page
    }

    /// Give up the memory of this page.
    pub fn into_memory(self) -> (VirtualMemory, PhysicalMemory) {
        (self.vmem, self.pmem)
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Bump allocate. Only for pages owned by a single thread.
    pub fn alloc_object(&self, size: usize) -> Option<Offset> {
        let aligned = Alignment::checked_align_up(size, self.object_alignment())?;
        let top = self.top.load(Ordering::Relaxed);
        let new_top = top.checked_add(aligned)?;
        if new_top > self.end().raw() {
            return None;
        }
        self.top.store(new_top, Ordering::Release);
        Some(Offset::new(top))
    }

    /// Bump allocate from a page shared between threads.
    pub fn alloc_object_atomic(&self, size: usize) -> Option<Offset> {
        let aligned = Alignment::checked_align_up(size, self.object_alignment())?;
        let end = self.end().raw();
        let mut top = self.top.load(Ordering::Relaxed);

        loop {
            let new_top = top.checked_add(aligned)?;
            if new_top > end {
                return None;
            }

            match self
                .top
                .compare_exchange_weak(top, new_top, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return Some(Offset::new(top)),
                Err(actual) => top = actual,
            }
        }
    }

    /// Undo the most recent allocation. Fails for any other object.
    pub fn undo_alloc_object(&self, offset: Offset, size: usize) -> bool {
        let aligned = Alignment::align_up(size, self.object_alignment());
        let top = self.top.load(Ordering::Relaxed);
        if top.wrapping_sub(aligned) != offset.raw() {
            return false;
        }
        self.top.store(offset.raw(), Ordering::Release);
        true
    }

    /// Atomic variant of [`Page::undo_alloc_object`].
    pub fn undo_alloc_object_atomic(&self, offset: Offset, size: usize) -> bool {
        let aligned = Alignment::align_up(size, self.object_alignment());
        let mut top = self.top.load(Ordering::Relaxed);

        loop {
            if top.wrapping_sub(aligned) != offset.raw() {
                return false;
            }

            match self.top.compare_exchange_weak(
                top,
                offset.raw(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => top = actual,
            }
        }
    }

    // ------------------------------------------------------------------
    // Liveness
    // ------------------------------------------------------------------

    fn object_index(&self, offset: Offset) -> usize {
        (offset - self.start()) >> self.alignment_shift
    }

    /// Object offset for a live map index.
    fn object_offset(&self, index: usize) -> Offset {
        self.start() + (index << self.alignment_shift)
    }

    /// Record the object at `offset` as live in the current cycle.
    pub fn mark_object(&self, offset: Offset, finalizable: bool) -> MarkResult {
        debug_assert!(self.is_relocatable(), "marking an allocating page");
        debug_assert!(self.is_in(offset), "object {} outside page", offset);
        self.livemap
            .set(self.global_seqnum.get(), self.object_index(offset), finalizable)
    }

    pub fn inc_live(&self, objects: u32, bytes: usize) {
        self.livemap
            .inc_live(self.global_seqnum.get(), objects, bytes);
    }

    /// True when any object was marked in the current cycle.
    pub fn is_marked(&self) -> bool {
        self.livemap.is_marked(self.global_seqnum.get())
    }

    pub fn is_object_marked(&self, offset: Offset) -> bool {
        self.livemap
            .get(self.global_seqnum.get(), self.object_index(offset))
    }

    pub fn is_object_strongly_marked(&self, offset: Offset) -> bool {
        self.livemap
            .get_strong(self.global_seqnum.get(), self.object_index(offset))
    }

    pub fn is_object_live(&self, offset: Offset) -> bool {
        self.is_allocating() || self.is_object_marked(offset)
    }

    pub fn is_object_strongly_live(&self, offset: Offset) -> bool {
        self.is_allocating() || self.is_object_strongly_marked(offset)
    }

    pub fn live_objects(&self) -> u32 {
        self.livemap.live_objects(self.global_seqnum.get())
    }

    pub fn live_bytes(&self) -> usize {
        self.livemap.live_bytes(self.global_seqnum.get())
    }

    /// Visit every marked object, in address order.
    pub fn for_each_live_object<F>(&self, mut f: F)
    where
        F: FnMut(Offset),
    {
        self.livemap
            .for_each_marked(self.global_seqnum.get(), |index| f(self.object_offset(index)));
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Page({} {}-{}-{} seqnum={}{})",
            self.page_type,
            self.start(),
            self.top(),
            self.end(),
            self.seqnum(),
            if self.is_allocating() {
                " allocating"
            } else if self.is_relocatable() {
                " relocatable"
            } else {
                ""
            }
        )
    }
}
