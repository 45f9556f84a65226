//! Alignment Utilities
//!
//! Helper functions for memory alignment. All alignments are powers of two.

use crate::globals::GRANULE_SIZE;

/// Alignment - utility for alignment operations
pub struct Alignment;

impl Alignment {
    /// Align value up to boundary
    ///
    /// # Examples
    /// ```
    /// use zheap::util::Alignment;
    ///
    /// assert_eq!(Alignment::align_up(100, 8), 104);
    /// assert_eq!(Alignment::align_up(64, 8), 64);
    /// ```
    pub fn align_up(value: usize, alignment: usize) -> usize {
        (value + alignment - 1) & !(alignment - 1)
    }

    /// Align value up, or `None` when the result does not fit in `usize`.
    pub fn checked_align_up(value: usize, alignment: usize) -> Option<usize> {
        value
            .checked_add(alignment - 1)
            .map(|sum| sum & !(alignment - 1))
    }

    /// Align value down to boundary
    pub fn align_down(value: usize, alignment: usize) -> usize {
        value & !(alignment - 1)
    }

    /// Check if value is aligned
    pub fn is_aligned(value: usize, alignment: usize) -> bool {
        value & (alignment - 1) == 0
    }

    pub fn align_up_to_granule(value: usize) -> usize {
        Self::align_up(value, GRANULE_SIZE)
    }

    pub fn align_down_to_granule(value: usize) -> usize {
        Self::align_down(value, GRANULE_SIZE)
    }

    pub fn is_granule_aligned(value: usize) -> bool {
        Self::is_aligned(value, GRANULE_SIZE)
    }
}
