//! Forwarding - Relocation Record of One Page
//!
//! Maps the live objects of a page in the relocation set to their new
//! offsets. Entries live in a power-of-two slice of a per-cycle arena and
//! are published with a single CAS, so lookups never take a lock.
//!
//! Entry layout (one `u64`):
//!
//! ```text
//!  63            46 45                       1  0
//! +----------------+--------------------------+---+
//! |   from index   |        to offset         | P |
//! +----------------+--------------------------+---+
//! ```
//!
//! The from index is the object's slot on the old page (offset divided by
//! the page's object alignment). `P` marks a populated entry.
//!
//! ## Page Reference Count
//!
//! The old page stays usable while threads relocate out of it:
//!
//! - `1` at creation, owned by the worker that relocates the page
//! - `> 1` while mutators relocate objects through [`Forwarding::retain_page`]
//! - `< 0` once a worker claimed the page for in-place relocation; the
//!   count is negated and drains to `-1`
//! - `0` once released; the page can then be detached and freed

use crate::address::Offset;
use crate::globals::PageType;
use crate::heap::page::Page;
use crate::util::hash_u32;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

const POPULATED_BITS: u32 = 1;
const TO_OFFSET_SHIFT: u32 = POPULATED_BITS;
const TO_OFFSET_BITS: u32 = 45;
const FROM_INDEX_SHIFT: u32 = TO_OFFSET_SHIFT + TO_OFFSET_BITS;
const FROM_INDEX_BITS: u32 = 64 - FROM_INDEX_SHIFT;

const TO_OFFSET_MASK: u64 = (1 << TO_OFFSET_BITS) - 1;
const FROM_INDEX_MASK: u64 = (1 << FROM_INDEX_BITS) - 1;

/// One slot of a forwarding table.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ForwardingEntry(u64);

impl ForwardingEntry {
    pub const EMPTY: ForwardingEntry = ForwardingEntry(0);

    pub fn new(from_index: usize, to_offset: Offset) -> Self {
        debug_assert!(from_index as u64 <= FROM_INDEX_MASK, "from index overflow");
        debug_assert!(to_offset.raw() as u64 <= TO_OFFSET_MASK, "to offset overflow");
        Self(
            ((from_index as u64) << FROM_INDEX_SHIFT)
                | ((to_offset.raw() as u64) << TO_OFFSET_SHIFT)
                | 1,
        )
    }

    pub fn populated(self) -> bool {
        self.0 & 1 != 0
    }

    pub fn from_index(self) -> usize {
        ((self.0 >> FROM_INDEX_SHIFT) & FROM_INDEX_MASK) as usize
    }

    pub fn to_offset(self) -> Offset {
        Offset::new(((self.0 >> TO_OFFSET_SHIFT) & TO_OFFSET_MASK) as usize)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ForwardingEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.populated() {
            write!(f, "Entry({} -> {})", self.from_index(), self.to_offset())
        } else {
            f.write_str("Entry(empty)")
        }
    }
}

/// Forwarding - per-page relocation table and page reference
pub struct Forwarding {
    start: Offset,
    size: usize,
    page_type: PageType,
    object_alignment_shift: usize,
    arena: Arc<[AtomicU64]>,
    base: usize,
    mask: usize,
    ref_count: AtomicI32,
    ref_abort: AtomicBool,
    in_place: AtomicBool,
    page: Mutex<Option<Arc<Page>>>,
    ref_cond: Condvar,
}

impl Forwarding {
    /// Forwarding for `page` using `arena[base..base + capacity]`.
    ///
    /// `capacity` must be a power of two larger than the number of live
    /// objects on the page.
    pub fn new(page: Arc<Page>, arena: Arc<[AtomicU64]>, base: usize, capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two());
        debug_assert!(base + capacity <= arena.len());
        Self {
            start: page.start(),
            size: page.size(),
            page_type: page.page_type(),
            object_alignment_shift: page.object_alignment_shift(),
            arena,
            base,
            mask: capacity - 1,
            ref_count: AtomicI32::new(1),
            ref_abort: AtomicBool::new(false),
            in_place: AtomicBool::new(false),
            page: Mutex::new(Some(page)),
            ref_cond: Condvar::new(),
        }
    }

    /// Forwarding with its own arena, sized for `live_objects`.
    pub fn with_capacity_for(page: Arc<Page>, live_objects: usize) -> Self {
        let capacity = Self::capacity_for(live_objects);
        let arena: Arc<[AtomicU64]> = (0..capacity).map(|_| AtomicU64::new(0)).collect();
        Self::new(page, arena, 0, capacity)
    }

    /// Table size for a page with `live_objects` live objects.
    pub fn capacity_for(live_objects: usize) -> usize {
        (live_objects * 2).max(1).next_power_of_two()
    }

    pub fn start(&self) -> Offset {
        self.start
    }

    pub fn end(&self) -> Offset {
        self.start + self.size
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn page_type(&self) -> PageType {
        self.page_type
    }

    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Old page, until it is detached.
    pub fn page(&self) -> Option<Arc<Page>> {
        self.page.lock().clone()
    }

    /// Slot index of the object at `offset` on the old page.
    pub fn index_of(&self, offset: Offset) -> usize {
        debug_assert!(offset >= self.start && offset < self.end());
        (offset - self.start) >> self.object_alignment_shift
    }

    /// Old offset of slot `from_index`.
    pub fn offset_of(&self, from_index: usize) -> Offset {
        self.start + (from_index << self.object_alignment_shift)
    }

    pub fn in_place(&self) -> bool {
        self.in_place.load(Ordering::Acquire)
    }

    pub fn set_in_place(&self) {
        self.in_place.store(true, Ordering::Release);
    }

    // ------------------------------------------------------------------
    // Entries
    // ------------------------------------------------------------------

    fn slot(&self, cursor: usize) -> &AtomicU64 {
        &self.arena[self.base + cursor]
    }

    fn at(&self, cursor: usize) -> ForwardingEntry {
        ForwardingEntry(self.slot(cursor).load(Ordering::Acquire))
    }

    fn first(&self, from_index: usize, cursor: &mut usize) -> ForwardingEntry {
        *cursor = hash_u32(from_index as u32) as usize & self.mask;
        self.at(*cursor)
    }

    fn next(&self, cursor: &mut usize) -> ForwardingEntry {
        *cursor = (*cursor + 1) & self.mask;
        self.at(*cursor)
    }

    /// Look up `from_index`.
    ///
    /// Returns the matching entry, or an empty one with `cursor` at the slot
    /// where an insert for `from_index` should start.
    pub fn find(&self, from_index: usize, cursor: &mut usize) -> ForwardingEntry {
        let mut entry = self.first(from_index, cursor);
        while entry.populated() {
            if entry.from_index() == from_index {
                return entry;
            }
            entry = self.next(cursor);
        }
        entry
    }

    /// Publish `from_index -> to_offset` starting at `cursor`.
    ///
    /// Returns the offset that won: `to_offset`, or the offset another
    /// thread inserted for the same object first.
    pub fn insert(&self, from_index: usize, to_offset: Offset, cursor: &mut usize) -> Offset {
        let new_entry = ForwardingEntry::new(from_index, to_offset);

        loop {
            // Release: the object copy happens-before the entry is visible.
            match self.slot(*cursor).compare_exchange(
                ForwardingEntry::EMPTY.raw(),
                new_entry.raw(),
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => return to_offset,
                Err(_) => {
                    let mut entry = self.at(*cursor);
                    while entry.populated() {
                        if entry.from_index() == from_index {
                            return entry.to_offset();
                        }
                        entry = self.next(cursor);
                    }
                },
            }
        }
    }

    /// Forwarded offset of the object at `offset`, if already relocated.
    pub fn forwarded(&self, offset: Offset) -> Option<Offset> {
        let mut cursor = 0;
        let entry = self.find(self.index_of(offset), &mut cursor);
        entry.populated().then(|| entry.to_offset())
    }

    /// Number of populated entries.
    pub fn entries(&self) -> usize {
        (0..self.capacity())
            .filter(|&cursor| self.at(cursor).populated())
            .count()
    }

    // ------------------------------------------------------------------
    // Page reference count
    // ------------------------------------------------------------------

    fn notify_all(&self) {
        let _guard = self.page.lock();
        self.ref_cond.notify_all();
    }

    /// Take a reference to the old page for relocating out of it.
    ///
    /// Fails when the page is already released, or claimed for in-place
    /// relocation; in the latter case this waits until the claimer is done.
    pub fn retain_page(&self) -> bool {
        loop {
            let ref_count = self.ref_count.load(Ordering::Acquire);

            if ref_count == 0 {
                return false;
            }

            if ref_count < 0 {
                self.wait_page_released();
                return false;
            }

            if self
                .ref_count
                .compare_exchange(ref_count, ref_count + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Drop a reference taken by `retain_page`, or the owner's reference.
    pub fn release_page(&self) {
        loop {
            let ref_count = self.ref_count.load(Ordering::Acquire);
            debug_assert_ne!(ref_count, 0, "release of a released page");

            if ref_count > 0 {
                if self
                    .ref_count
                    .compare_exchange(ref_count, ref_count - 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    continue;
                }
                if ref_count == 1 {
                    self.notify_all();
                }
            } else {
                if self
                    .ref_count
                    .compare_exchange(ref_count, ref_count + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    continue;
                }
                // Now -1 (claimed) or 0 (released).
                if ref_count == -2 || ref_count == -1 {
                    self.notify_all();
                }
            }
            return;
        }
    }

    /// Claim the page for in-place relocation, waiting for every other
    /// reference to drain. Called by the owning worker.
    pub fn claim_page(&self) -> Option<Arc<Page>> {
        loop {
            let ref_count = self.ref_count.load(Ordering::Acquire);
            debug_assert!(ref_count > 0, "claim of a released or claimed page");

            if self
                .ref_count
                .compare_exchange(ref_count, -ref_count, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }

            let mut page = self.page.lock();
            while self.ref_count.load(Ordering::Acquire) != -1 {
                self.ref_cond.wait(&mut page);
            }
            return page.clone();
        }
    }

    /// Wait until the page is released.
    ///
    /// Returns false when relocation was aborted before that happened.
    pub fn wait_page_released(&self) -> bool {
        if self.ref_count.load(Ordering::Acquire) == 0 {
            return true;
        }

        let mut page = self.page.lock();
        while self.ref_count.load(Ordering::Acquire) != 0 {
            if self.ref_abort.load(Ordering::Acquire) {
                return false;
            }
            self.ref_cond.wait(&mut page);
        }
        true
    }

    /// Wait for the page to be released and take it out of the forwarding.
    pub fn detach_page(&self) -> Option<Arc<Page>> {
        let mut page = self.page.lock();
        while self.ref_count.load(Ordering::Acquire) != 0 {
            self.ref_cond.wait(&mut page);
        }
        page.take()
    }

    /// Give up on relocating the page; waiters see the abort.
    pub fn abort_page(&self) {
        let _page = self.page.lock();
        self.ref_abort.store(true, Ordering::Release);
        self.ref_cond.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        self.ref_abort.load(Ordering::Acquire)
    }

    pub fn ref_count(&self) -> i32 {
        self.ref_count.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Forwarding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Forwarding")
            .field("start", &self.start)
            .field("size", &self.size)
            .field("page_type", &self.page_type)
            .field("capacity", &self.capacity())
            .field("ref_count", &self.ref_count())
            .field("in_place", &self.in_place())
            .finish()
    }
}
