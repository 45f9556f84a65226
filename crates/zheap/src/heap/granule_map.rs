//! Granule-indexed map.
//!
//! One pointer-sized slot per granule of the object space, stored in a
//! single anonymous mapping. The mapping is never touched up front, so only
//! the slots actually written cost physical memory.
//!
//! Memory-order contract: a writer that publishes a value other threads
//! will dereference uses [`GranuleMap::release_put`] (or
//! [`GranuleMap::release_put_range`]); readers that dereference the value use
//! [`GranuleMap::get_acquire`]. Plain `get`/`put` are relaxed and only for
//! values that carry no payload.
//!
//! The map never owns what its values point to.

use crate::address::Offset;
use crate::error::{HeapError, Result};
use crate::globals::GRANULE_SIZE_SHIFT;
use memmap2::MmapMut;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Value that fits in a granule slot. Zero is the empty value.
pub trait GranuleValue: Copy {
    fn into_bits(self) -> usize;
    fn from_bits(bits: usize) -> Self;
}

impl GranuleValue for usize {
    fn into_bits(self) -> usize {
        self
    }

    fn from_bits(bits: usize) -> Self {
        bits
    }
}

impl GranuleValue for isize {
    fn into_bits(self) -> usize {
        self as usize
    }

    fn from_bits(bits: usize) -> Self {
        bits as isize
    }
}

impl<T> GranuleValue for *const T {
    fn into_bits(self) -> usize {
        self as usize
    }

    fn from_bits(bits: usize) -> Self {
        bits as *const T
    }
}

/// GranuleMap - sparse array keyed by granule
pub struct GranuleMap<T> {
    len: usize,
    slots: NonNull<AtomicUsize>,
    // Keeps the slots mapped; only accessed through `slots`.
    _mapping: MmapMut,
    _marker: PhantomData<fn() -> T>,
}

// Slots are only accessed atomically.
unsafe impl<T> Send for GranuleMap<T> {}
unsafe impl<T> Sync for GranuleMap<T> {}

impl<T: GranuleValue> GranuleMap<T> {
    /// Create a map covering offsets `[0, max_offset)`.
    pub fn new(max_offset: usize) -> Result<Self> {
        let len = max_offset >> GRANULE_SIZE_SHIFT;
        if len == 0 {
            return Err(HeapError::InvalidArgument(format!(
                "granule map for {:#x} bytes has no slots",
                max_offset
            )));
        }

        let bytes = len * std::mem::size_of::<AtomicUsize>();
        let mut mapping = MmapMut::map_anon(bytes)
            .map_err(|e| HeapError::Backing(format!("granule map of {} bytes: {}", bytes, e)))?;
        let slots = NonNull::new(mapping.as_mut_ptr() as *mut AtomicUsize)
            .ok_or_else(|| HeapError::Backing("granule map mapped at null".to_string()))?;

        Ok(Self {
            len,
            slots,
            _mapping: mapping,
            _marker: PhantomData,
        })
    }

    /// Number of granule slots
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn slot(&self, index: usize) -> &AtomicUsize {
        assert!(
            index < self.len,
            "granule index {} out of bounds ({})",
            index,
            self.len
        );
        // SAFETY: index is in bounds and the mapping lives as long as self.
        unsafe { &*self.slots.as_ptr().add(index) }
    }

    fn index_of(offset: Offset) -> usize {
        offset.raw() >> GRANULE_SIZE_SHIFT
    }

    pub fn get(&self, offset: Offset) -> T {
        T::from_bits(self.slot(Self::index_of(offset)).load(Ordering::Relaxed))
    }

    pub fn put(&self, offset: Offset, value: T) {
        self.slot(Self::index_of(offset))
            .store(value.into_bits(), Ordering::Relaxed);
    }

    /// Fill every granule in `[offset, offset + size)`.
    pub fn put_range(&self, offset: Offset, size: usize, value: T) {
        let start = Self::index_of(offset);
        let end = Self::index_of(offset + size);
        for index in start..end {
            self.slot(index).store(value.into_bits(), Ordering::Relaxed);
        }
    }

    pub fn get_acquire(&self, offset: Offset) -> T {
        T::from_bits(self.slot(Self::index_of(offset)).load(Ordering::Acquire))
    }

    pub fn release_put(&self, offset: Offset, value: T) {
        self.slot(Self::index_of(offset))
            .store(value.into_bits(), Ordering::Release);
    }

    /// Release variant of [`GranuleMap::put_range`].
    pub fn release_put_range(&self, offset: Offset, size: usize, value: T) {
        let start = Self::index_of(offset);
        let end = Self::index_of(offset + size);
        for index in start..end {
            self.slot(index).store(value.into_bits(), Ordering::Release);
        }
    }

    /// Iterate over all slots in offset order, including empty ones.
    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        (0..self.len).map(move |index| T::from_bits(self.slot(index).load(Ordering::Acquire)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::globals::{GB, GRANULE_SIZE};

    #[test]
    fn test_put_get_round_trip() {
        let map = GranuleMap::<usize>::new(64 * GB).unwrap();
        assert_eq!(map.len(), 64 * GB / GRANULE_SIZE);

        let offset = Offset::new(17 * GRANULE_SIZE);
        assert_eq!(map.get(offset), 0);
        map.put(offset, 0xdead);
        assert_eq!(map.get(offset), 0xdead);
        assert_eq!(map.get(offset + 4096), 0xdead);
        assert_eq!(map.get(offset + GRANULE_SIZE), 0);
    }

    #[test]
    fn test_put_range_fills_every_granule() {
        let map = GranuleMap::<usize>::new(GB).unwrap();
        let offset = Offset::new(4 * GRANULE_SIZE);
        map.put_range(offset, 3 * GRANULE_SIZE, 7);

        assert_eq!(map.get(offset - GRANULE_SIZE), 0);
        for i in 0..3 {
            assert_eq!(map.get(offset + i * GRANULE_SIZE), 7);
        }
        assert_eq!(map.get(offset + 3 * GRANULE_SIZE), 0);
    }

    #[test]
    fn test_pointer_values() {
        let value = 42u64;
        let map = GranuleMap::<*const u64>::new(GB).unwrap();
        let offset = Offset::new(GRANULE_SIZE);
        assert!(map.get_acquire(offset).is_null());
        map.release_put(offset, &value as *const u64);
        assert_eq!(unsafe { *map.get_acquire(offset) }, 42);
    }

    #[test]
    fn test_iter_visits_all_slots() {
        let map = GranuleMap::<usize>::new(16 * GRANULE_SIZE).unwrap();
        map.put(Offset::new(2 * GRANULE_SIZE), 1);
        map.put(Offset::new(9 * GRANULE_SIZE), 2);
        let values: Vec<usize> = map.iter().collect();
        assert_eq!(values.len(), 16);
        assert_eq!(values.iter().filter(|&&v| v != 0).count(), 2);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_out_of_bounds_panics() {
        let map = GranuleMap::<usize>::new(4 * GRANULE_SIZE).unwrap();
        map.get(Offset::new(4 * GRANULE_SIZE));
    }

    #[test]
    fn test_concurrent_publication() {
        use std::sync::Arc;
        use std::thread;

        let map = Arc::new(GranuleMap::<usize>::new(GB).unwrap());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let map = Arc::clone(&map);
                thread::spawn(move || {
                    for i in 0..64 {
                        let offset = Offset::new((t * 64 + i) * GRANULE_SIZE);
                        map.release_put(offset, t * 1000 + i + 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        for t in 0..4 {
            for i in 0..64 {
                let offset = Offset::new((t * 64 + i) * GRANULE_SIZE);
                assert_eq!(map.get_acquire(offset), t * 1000 + i + 1);
            }
        }
    }
}
