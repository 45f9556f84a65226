//! Heap-wide constants, page size classes and the collector phase.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

pub const KB: usize = 1024;
pub const MB: usize = 1024 * KB;
pub const GB: usize = 1024 * MB;

/// Granule: unit of mapping and granule map indexing.
pub const GRANULE_SIZE_SHIFT: usize = 21;
pub const GRANULE_SIZE: usize = 1 << GRANULE_SIZE_SHIFT;

/// Number of heap views (marked0, marked1, remapped).
pub const HEAP_VIEWS: usize = 3;

/// Virtual offset space reserved per byte of max heap.
pub const VIRTUAL_TO_PHYSICAL_RATIO: usize = 16;

pub const MIN_ADDRESS_OFFSET_BITS: usize = 42;
pub const MAX_ADDRESS_OFFSET_BITS: usize = 44;

pub const PAGE_SIZE_SMALL: usize = GRANULE_SIZE;
pub const OBJECT_ALIGNMENT_SMALL_SHIFT: usize = 3;
pub const OBJECT_ALIGNMENT_SMALL: usize = 1 << OBJECT_ALIGNMENT_SMALL_SHIFT;
pub const OBJECT_SIZE_LIMIT_SMALL: usize = PAGE_SIZE_SMALL / 8;

/// Sequence number of the first cycle. Pages created before the first
/// `mark_start` carry it and become relocatable once it is bumped.
pub const SEQNUM_INITIAL: u32 = 1;

/// Cycle sequence number shared by a heap and its pages.
///
/// Bumped once per cycle by `mark_start`. A page whose own sequence number
/// equals it is allocating; a lower one makes the page relocatable.
#[derive(Debug)]
pub struct GlobalSeqNum(AtomicU32);

impl GlobalSeqNum {
    pub fn new() -> Self {
        Self(AtomicU32::new(SEQNUM_INITIAL))
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    /// Start a new cycle, returning its sequence number.
    pub fn increment(&self) -> u32 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }
}

impl Default for GlobalSeqNum {
    fn default() -> Self {
        Self::new()
    }
}

/// Collector phase. A heap starts in `Relocate` so the first transition is
/// `mark_start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Phase {
    Mark,
    MarkCompleted,
    Relocate,
}

impl Phase {
    pub(crate) fn from_u8(value: u8) -> Phase {
        match value {
            0 => Phase::Mark,
            1 => Phase::MarkCompleted,
            _ => Phase::Relocate,
        }
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            Phase::Mark => 0,
            Phase::MarkCompleted => 1,
            Phase::Relocate => 2,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Mark => "Mark",
            Phase::MarkCompleted => "MarkCompleted",
            Phase::Relocate => "Relocate",
        };
        f.write_str(name)
    }
}

/// Page size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum PageType {
    Small,
    Medium,
    Large,
}

impl fmt::Display for PageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PageType::Small => "Small",
            PageType::Medium => "Medium",
            PageType::Large => "Large",
        };
        f.write_str(name)
    }
}

/// Size classes derived from the max heap size.
///
/// The medium page size is 3.125% of the max heap, clamped to
/// `[GRANULE_SIZE, 16 * GRANULE_SIZE]` and rounded down to a power of two.
/// When that equals the small page size the medium class is disabled and
/// objects above the small limit go to large pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageGeometry {
    medium_size: usize,
    medium_alignment_shift: usize,
}

impl PageGeometry {
    pub fn for_max_heap(max_heap_size: usize) -> Self {
        let unclamped = max_heap_size / 32;
        let clamped = unclamped.clamp(GRANULE_SIZE, GRANULE_SIZE * 16);
        let size = round_down_power_of_two(clamped);

        if size > PAGE_SIZE_SMALL {
            Self {
                medium_size: size,
                medium_alignment_shift: size.trailing_zeros() as usize - 13,
            }
        } else {
            Self {
                medium_size: 0,
                medium_alignment_shift: 0,
            }
        }
    }

    pub fn medium_enabled(&self) -> bool {
        self.medium_size != 0
    }

    pub fn small_page_size(&self) -> usize {
        PAGE_SIZE_SMALL
    }

    pub fn medium_page_size(&self) -> usize {
        self.medium_size
    }

    pub fn small_object_limit(&self) -> usize {
        OBJECT_SIZE_LIMIT_SMALL
    }

    pub fn medium_object_limit(&self) -> usize {
        self.medium_size / 8
    }

    pub fn object_alignment_shift(&self, page_type: PageType) -> usize {
        match page_type {
            PageType::Small => OBJECT_ALIGNMENT_SMALL_SHIFT,
            PageType::Medium => self.medium_alignment_shift,
            PageType::Large => GRANULE_SIZE_SHIFT,
        }
    }

    pub fn object_size_limit(&self, page_type: PageType) -> usize {
        match page_type {
            PageType::Small => self.small_object_limit(),
            PageType::Medium => self.medium_object_limit(),
            PageType::Large => usize::MAX,
        }
    }

    /// Fixed page size of a class, `None` for large pages.
    pub fn page_size(&self, page_type: PageType) -> Option<usize> {
        match page_type {
            PageType::Small => Some(PAGE_SIZE_SMALL),
            PageType::Medium if self.medium_enabled() => Some(self.medium_size),
            _ => None,
        }
    }

    pub fn type_from_size(&self, size: usize) -> PageType {
        if size == PAGE_SIZE_SMALL {
            PageType::Small
        } else if self.medium_enabled() && size == self.medium_size {
            PageType::Medium
        } else {
            PageType::Large
        }
    }

    /// Size class for an object allocation of `size` bytes.
    pub fn type_for_object(&self, size: usize) -> PageType {
        if size <= self.small_object_limit() {
            PageType::Small
        } else if self.medium_enabled() && size <= self.medium_object_limit() {
            PageType::Medium
        } else {
            PageType::Large
        }
    }
}

/// Number of offset bits for a heap of `max_heap_size` bytes.
pub fn address_offset_bits(max_heap_size: usize) -> usize {
    let wanted = max_heap_size
        .saturating_mul(VIRTUAL_TO_PHYSICAL_RATIO)
        .checked_next_power_of_two()
        .unwrap_or(1 << MAX_ADDRESS_OFFSET_BITS);
    (wanted.trailing_zeros() as usize).clamp(MIN_ADDRESS_OFFSET_BITS, MAX_ADDRESS_OFFSET_BITS)
}

pub(crate) fn round_down_power_of_two(value: usize) -> usize {
    if value == 0 {
        0
    } else {
        1 << (usize::BITS - 1 - value.leading_zeros())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_medium_disabled_for_small_heaps() {
        let geometry = PageGeometry::for_max_heap(64 * MB);
        assert!(!geometry.medium_enabled());
        assert_eq!(geometry.page_size(PageType::Medium), None);
        assert_eq!(geometry.type_for_object(300 * KB), PageType::Large);
    }

    #[test]
    fn test_medium_size_scales_with_heap() {
        let geometry = PageGeometry::for_max_heap(256 * MB);
        assert_eq!(geometry.medium_page_size(), 8 * MB);
        assert_eq!(geometry.object_alignment_shift(PageType::Medium), 10);
        assert_eq!(geometry.medium_object_limit(), MB);

        let geometry = PageGeometry::for_max_heap(16 * GB);
        assert_eq!(geometry.medium_page_size(), 32 * MB);
        assert_eq!(1 << geometry.object_alignment_shift(PageType::Medium), 4 * KB);
    }

    #[test]
    fn test_type_from_size() {
        let geometry = PageGeometry::for_max_heap(256 * MB);
        assert_eq!(geometry.type_from_size(2 * MB), PageType::Small);
        assert_eq!(geometry.type_from_size(8 * MB), PageType::Medium);
        assert_eq!(geometry.type_from_size(6 * MB), PageType::Large);
    }

    #[test]
    fn test_address_offset_bits_clamped() {
        assert_eq!(address_offset_bits(64 * MB), MIN_ADDRESS_OFFSET_BITS);
        assert_eq!(address_offset_bits(512 * GB), 43);
        assert_eq!(address_offset_bits(usize::MAX / 4), MAX_ADDRESS_OFFSET_BITS);
    }

    #[test]
    fn test_seqnum_starts_at_initial() {
        let seqnum = GlobalSeqNum::new();
        assert_eq!(seqnum.get(), SEQNUM_INITIAL);
        assert_eq!(seqnum.increment(), SEQNUM_INITIAL + 1);
        assert_eq!(seqnum.get(), SEQNUM_INITIAL + 1);
    }

    #[test]
    fn test_phase_round_trips_through_u8() {
        for phase in [Phase::Mark, Phase::MarkCompleted, Phase::Relocate] {
            assert_eq!(Phase::from_u8(phase.as_u8()), phase);
        }
    }
}
