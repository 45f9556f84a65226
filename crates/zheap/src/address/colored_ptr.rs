//! Colored pointer and offset value types.
//!
//! An [`Offset`] is a position in the heap's object space. A
//! [`ColoredPointer`] is an offset combined with exactly one view bit, which
//! selects one of the virtual aliases of the same physical memory. Both are
//! plain `Copy` wrappers; conversions between them go through
//! [`AddressSpace`](super::AddressSpace), which owns the masks.

use crate::globals::GRANULE_SIZE;
use std::fmt;
use std::ops::{Add, Sub};

/// Position in the heap object space, independent of any view.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Offset(usize);

impl Offset {
    pub const ZERO: Offset = Offset(0);

    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> usize {
        self.0
    }

    pub fn is_granule_aligned(self) -> bool {
        self.0 % GRANULE_SIZE == 0
    }

    /// Granule index, the key used by granule maps.
    pub fn granule_index(self) -> usize {
        self.0 / GRANULE_SIZE
    }
}

impl Add<usize> for Offset {
    type Output = Offset;

    fn add(self, bytes: usize) -> Offset {
        Offset(self.0 + bytes)
    }
}

impl Sub<usize> for Offset {
    type Output = Offset;

    fn sub(self, bytes: usize) -> Offset {
        Offset(self.0 - bytes)
    }
}

impl Sub<Offset> for Offset {
    type Output = usize;

    fn sub(self, other: Offset) -> usize {
        self.0 - other.0
    }
}

impl fmt::Debug for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Offset({:#x})", self.0)
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Heap view selected by a metadata bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum View {
    Marked0,
    Marked1,
    Remapped,
    /// Not a mapped view. Set together with a marked bit on pointers that
    /// are only reachable through finalization.
    Finalizable,
}

impl View {
    /// The views that are backed by mapped memory.
    pub const MAPPED: [View; 3] = [View::Marked0, View::Marked1, View::Remapped];
}

/// Pointer carrying an offset and view bits. Null is all zero.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ColoredPointer {
    raw: usize,
}

impl ColoredPointer {
    pub const fn null() -> Self {
        Self { raw: 0 }
    }

    pub const fn from_raw(raw: usize) -> Self {
        Self { raw }
    }

    pub const fn raw(self) -> usize {
        self.raw
    }

    pub const fn is_null(self) -> bool {
        self.raw == 0
    }

    /// The pointer as a machine address. Only meaningful for a mapped view.
    pub fn as_mut_ptr<T>(self) -> *mut T {
        self.raw as *mut T
    }
}

impl fmt::Debug for ColoredPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ColoredPointer({:#x})", self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_arithmetic() {
        let start = Offset::new(4 * GRANULE_SIZE);
        let end = start + GRANULE_SIZE;
        assert_eq!(end - start, GRANULE_SIZE);
        assert_eq!(end.granule_index(), 5);
        assert!(end.is_granule_aligned());
        assert!(!(end + 8).is_granule_aligned());
        assert_eq!(end - GRANULE_SIZE, start);
    }

    #[test]
    fn test_null_pointer() {
        assert!(ColoredPointer::null().is_null());
        assert!(!ColoredPointer::from_raw(0x1000).is_null());
        assert_eq!(ColoredPointer::default(), ColoredPointer::null());
    }
}
