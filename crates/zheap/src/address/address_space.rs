//! Address space layout and the good/bad mask state.
//!
//! ```text
//!  6                 4 4 4 4 4                                             0
//!  3                 8 7 6 5 4                                             0
//! +-------------------+-+-+-+-+-----------------------------------------------+
//! |00000000 0000000000|F|R|1|0|oooooooo oooooooo oooooooo oooooooo oooooooo ooo|
//! +-------------------+-+-+-+-+-----------------------------------------------+
//!                      | | | | * offset bits (42..44 depending on max heap)
//!                      | | | * Marked0
//!                      | | * Marked1
//!                      | * Remapped
//!                      * Finalizable
//! ```
//!
//! The metadata bits start at `offset_bits`; the layout above shows the
//! 44-bit case. Masks are written only by `flip_to_marked` and
//! `flip_to_remapped`, which the caller must invoke with all mutators
//! stopped. Readers use acquire loads.

use super::colored_ptr::{ColoredPointer, Offset, View};
use crate::globals::address_offset_bits;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Bit positions for one heap size. Immutable after construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressLayout {
    offset_bits: usize,
    offset_mask: usize,
    marked0: usize,
    marked1: usize,
    remapped: usize,
    finalizable: usize,
}

impl AddressLayout {
    pub fn new(offset_bits: usize) -> Self {
        Self {
            offset_bits,
            offset_mask: (1usize << offset_bits) - 1,
            marked0: 1 << offset_bits,
            marked1: 1 << (offset_bits + 1),
            remapped: 1 << (offset_bits + 2),
            finalizable: 1 << (offset_bits + 3),
        }
    }

    pub fn for_max_heap(max_heap_size: usize) -> Self {
        Self::new(address_offset_bits(max_heap_size))
    }

    pub fn offset_bits(&self) -> usize {
        self.offset_bits
    }

    pub fn offset_mask(&self) -> usize {
        self.offset_mask
    }

    /// Size of the object space: offsets are below this value.
    pub fn offset_max(&self) -> usize {
        1 << self.offset_bits
    }

    pub fn marked_mask(&self) -> usize {
        self.marked0 | self.marked1
    }

    pub fn metadata_mask(&self) -> usize {
        self.marked0 | self.marked1 | self.remapped | self.finalizable
    }

    pub fn view_bit(&self, view: View) -> usize {
        match view {
            View::Marked0 => self.marked0,
            View::Marked1 => self.marked1,
            View::Remapped => self.remapped,
            View::Finalizable => self.finalizable,
        }
    }

    /// Address of `offset` in a mapped view.
    pub fn view_address(&self, offset: Offset, view: View) -> usize {
        offset.raw() | self.view_bit(view)
    }
}

/// Colored pointer codec plus the current good/bad masks.
#[derive(Debug)]
pub struct AddressSpace {
    layout: AddressLayout,
    good: AtomicUsize,
    bad: AtomicUsize,
    weak_bad: AtomicUsize,
    marked: AtomicUsize,
}

impl AddressSpace {
    pub fn new(layout: AddressLayout) -> Self {
        let space = Self {
            layout,
            good: AtomicUsize::new(0),
            bad: AtomicUsize::new(0),
            weak_bad: AtomicUsize::new(0),
            marked: AtomicUsize::new(layout.marked0),
        };
        space.set_good_mask(layout.remapped);
        space
    }

    pub fn layout(&self) -> &AddressLayout {
        &self.layout
    }

    fn set_good_mask(&self, mask: usize) {
        let metadata = self.layout.metadata_mask();
        let weak_good = mask | self.layout.remapped | self.layout.finalizable;
        self.good.store(mask, Ordering::Release);
        self.bad.store(mask ^ metadata, Ordering::Release);
        self.weak_bad.store(weak_good ^ metadata, Ordering::Release);
    }

    /// Toggle the marked bit and make it good. Safepoint only.
    pub fn flip_to_marked(&self) {
        let marked = self.marked.load(Ordering::Acquire) ^ self.layout.marked_mask();
        self.marked.store(marked, Ordering::Release);
        self.set_good_mask(marked);
    }

    /// Make the remapped bit good. Safepoint only.
    pub fn flip_to_remapped(&self) {
        self.set_good_mask(self.layout.remapped);
    }

    pub fn good_mask(&self) -> usize {
        self.good.load(Ordering::Acquire)
    }

    pub fn bad_mask(&self) -> usize {
        self.bad.load(Ordering::Acquire)
    }

    pub fn weak_bad_mask(&self) -> usize {
        self.weak_bad.load(Ordering::Acquire)
    }

    /// Marked bit of the current (or most recent) mark phase.
    pub fn marked_mask(&self) -> usize {
        self.marked.load(Ordering::Acquire)
    }

    pub fn good_view(&self) -> View {
        let good = self.good_mask();
        if good == self.layout.marked0 {
            View::Marked0
        } else if good == self.layout.marked1 {
            View::Marked1
        } else {
            View::Remapped
        }
    }

    pub fn to_view(&self, offset: Offset, view: View) -> ColoredPointer {
        ColoredPointer::from_raw(self.layout.view_address(offset, view))
    }

    pub fn offset_of(&self, ptr: ColoredPointer) -> Offset {
        Offset::new(ptr.raw() & self.layout.offset_mask)
    }

    pub fn good(&self, offset: Offset) -> ColoredPointer {
        ColoredPointer::from_raw(offset.raw() | self.good_mask())
    }

    pub fn good_or_null(&self, ptr: ColoredPointer) -> ColoredPointer {
        if ptr.is_null() {
            ptr
        } else {
            self.good(self.offset_of(ptr))
        }
    }

    pub fn finalizable_good(&self, offset: Offset) -> ColoredPointer {
        ColoredPointer::from_raw(offset.raw() | self.layout.finalizable | self.good_mask())
    }

    pub fn marked(&self, offset: Offset) -> ColoredPointer {
        ColoredPointer::from_raw(offset.raw() | self.marked_mask())
    }

    pub fn marked0(&self, offset: Offset) -> ColoredPointer {
        self.to_view(offset, View::Marked0)
    }

    pub fn marked1(&self, offset: Offset) -> ColoredPointer {
        self.to_view(offset, View::Marked1)
    }

    pub fn remapped(&self, offset: Offset) -> ColoredPointer {
        self.to_view(offset, View::Remapped)
    }

    pub fn is_null(&self, ptr: ColoredPointer) -> bool {
        ptr.is_null()
    }

    pub fn is_bad(&self, ptr: ColoredPointer) -> bool {
        ptr.raw() & self.bad_mask() != 0
    }

    pub fn is_good(&self, ptr: ColoredPointer) -> bool {
        !self.is_bad(ptr) && !ptr.is_null()
    }

    pub fn is_good_or_null(&self, ptr: ColoredPointer) -> bool {
        !self.is_bad(ptr)
    }

    pub fn is_weak_bad(&self, ptr: ColoredPointer) -> bool {
        ptr.raw() & self.weak_bad_mask() != 0
    }

    pub fn is_weak_good(&self, ptr: ColoredPointer) -> bool {
        !self.is_weak_bad(ptr) && !ptr.is_null()
    }

    pub fn is_weak_good_or_null(&self, ptr: ColoredPointer) -> bool {
        !self.is_weak_bad(ptr)
    }

    pub fn is_marked(&self, ptr: ColoredPointer) -> bool {
        ptr.raw() & self.marked_mask() != 0
    }

    pub fn is_marked_or_null(&self, ptr: ColoredPointer) -> bool {
        self.is_marked(ptr) || ptr.is_null()
    }

    pub fn is_finalizable(&self, ptr: ColoredPointer) -> bool {
        ptr.raw() & self.layout.finalizable != 0
    }

    pub fn is_remapped(&self, ptr: ColoredPointer) -> bool {
        ptr.raw() & self.layout.remapped != 0
    }

    /// True when exactly one metadata bit is set and it names a mapped view.
    pub fn is_in(&self, ptr: ColoredPointer) -> bool {
        let metadata = ptr.raw() & !self.layout.offset_mask;
        metadata.is_power_of_two()
            && metadata & (self.layout.metadata_mask() & !self.layout.finalizable) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::globals::{GB, MB};

    fn space() -> AddressSpace {
        AddressSpace::new(AddressLayout::for_max_heap(64 * MB))
    }

    #[test]
    fn test_initial_state_is_remapped() {
        let space = space();
        assert_eq!(space.good_view(), View::Remapped);
        let offset = Offset::new(0x20_0000);
        assert!(space.is_good(space.remapped(offset)));
        assert!(space.is_bad(space.marked0(offset)));
        assert!(space.is_bad(space.marked1(offset)));
    }

    #[test]
    fn test_flip_to_marked_alternates() {
        let space = space();
        space.flip_to_marked();
        assert_eq!(space.good_view(), View::Marked1);
        space.flip_to_remapped();
        space.flip_to_marked();
        assert_eq!(space.good_view(), View::Marked0);
    }

    #[test]
    fn test_null_is_neither_good_nor_bad() {
        let space = space();
        let null = ColoredPointer::null();
        assert!(!space.is_good(null));
        assert!(!space.is_bad(null));
        assert!(space.is_good_or_null(null));
        assert!(!space.is_weak_good(null));
    }

    #[test]
    fn test_offset_of_strips_metadata() {
        let space = AddressSpace::new(AddressLayout::for_max_heap(512 * GB));
        let offset = Offset::new(0x1234_5678);
        for view in View::MAPPED {
            assert_eq!(space.offset_of(space.to_view(offset, view)), offset);
        }
        assert_eq!(space.offset_of(space.finalizable_good(offset)), offset);
    }

    #[test]
    fn test_finalizable_good_is_weak_good_only() {
        let space = space();
        space.flip_to_marked();
        let offset = Offset::new(0x40_0000);
        let ptr = space.finalizable_good(offset);
        assert!(!space.is_good(ptr));
        assert!(space.is_weak_good(ptr));
        assert!(space.is_finalizable(ptr));
        assert!(space.is_marked(ptr));
    }

    #[test]
    fn test_finalizable_good_across_flips() {
        let space = space();
        let offset = Offset::new(0x40_0000);

        for expected in [View::Marked1, View::Marked0] {
            space.flip_to_marked();
            assert_eq!(space.good_view(), expected);
            let marked = space.finalizable_good(offset);
            assert!(!space.is_good(marked));
            assert!(space.is_weak_good(marked));
            assert!(!space.is_weak_bad(marked));

            space.flip_to_remapped();
            let remapped = space.finalizable_good(offset);
            assert!(!space.is_good(remapped));
            assert!(space.is_weak_good(remapped));
            assert!(!space.is_weak_bad(remapped));
            assert!(space.is_remapped(remapped));

            // Marked color of the finished mark is weak bad once remapped.
            assert!(space.is_weak_bad(marked));
            assert_eq!(space.offset_of(marked), space.offset_of(remapped));
        }
    }

    #[test]
    fn test_is_in_rejects_finalizable_and_null() {
        let space = space();
        let offset = Offset::new(0x40_0000);
        assert!(space.is_in(space.marked0(offset)));
        assert!(space.is_in(space.remapped(offset)));
        assert!(!space.is_in(space.finalizable_good(offset)));
        assert!(!space.is_in(ColoredPointer::null()));
        assert!(!space.is_in(ColoredPointer::from_raw(offset.raw())));
    }
}
