//! Address-ordered free list of `[start, end)` ranges.
//!
//! Used for both the virtual offset space and the physical backing space.
//! Adjacent ranges are always coalesced on free. A [`MemoryCallbacks`]
//! implementation observes every structural change, which the Windows
//! placeholder reservations need to split and coalesce OS mappings in step
//! with the free list.

use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Hooks invoked with the free-list lock held.
///
/// `start`/`size` always describe the free area as it was *before* the
/// change, and `size` in the shrink/grow hooks is the number of bytes
/// removed or added.
pub trait MemoryCallbacks: Send + Sync {
    /// A new, unmerged free area was inserted.
    fn create(&self, _start: usize, _size: usize) {}
    /// A free area was consumed entirely by an allocation.
    fn destroy(&self, _start: usize, _size: usize) {}
    /// `size` bytes were allocated from the front of an area.
    fn shrink_from_front(&self, _start: usize, _area_size: usize, _size: usize) {}
    /// `size` bytes were allocated from the back of an area.
    fn shrink_from_back(&self, _start: usize, _area_size: usize, _size: usize) {}
    /// `size` freed bytes were merged in front of an area.
    fn grow_from_front(&self, _start: usize, _area_size: usize, _size: usize) {}
    /// `size` freed bytes were merged behind an area.
    fn grow_from_back(&self, _start: usize, _area_size: usize, _size: usize) {}
}

/// Callbacks that do nothing.
pub struct NoCallbacks;

impl MemoryCallbacks for NoCallbacks {}

/// MemoryManager - coalescing range allocator
pub struct MemoryManager {
    // start -> end
    free: Mutex<BTreeMap<usize, usize>>,
    callbacks: Box<dyn MemoryCallbacks>,
}

impl MemoryManager {
    pub fn new() -> Self {
        Self::with_callbacks(Box::new(NoCallbacks))
    }

    pub fn with_callbacks(callbacks: Box<dyn MemoryCallbacks>) -> Self {
        Self {
            free: Mutex::new(BTreeMap::new()),
            callbacks,
        }
    }

    /// Total free bytes
    pub fn free_bytes(&self) -> usize {
        self.free.lock().iter().map(|(start, end)| end - start).sum()
    }

    /// Snapshot of the free areas as `(start, size)`, in address order
    pub fn areas(&self) -> Vec<(usize, usize)> {
        self.free
            .lock()
            .iter()
            .map(|(&start, &end)| (start, end - start))
            .collect()
    }

    /// Allocate exactly `size` bytes from the lowest fitting area.
    pub fn alloc_from_front(&self, size: usize) -> Option<usize> {
        let mut free = self.free.lock();
        let (start, end) = free
            .iter()
            .map(|(&s, &e)| (s, e))
            .find(|(s, e)| e - s >= size)?;

        if end - start == size {
            free.remove(&start);
            self.callbacks.destroy(start, size);
        } else {
            self.callbacks.shrink_from_front(start, end - start, size);
            free.remove(&start);
            free.insert(start + size, end);
        }
        Some(start)
    }

    /// Allocate up to `size` bytes from the lowest area, returning the start
    /// and the number of bytes actually allocated.
    pub fn alloc_from_front_at_most(&self, size: usize) -> Option<(usize, usize)> {
        let mut free = self.free.lock();
        let (start, end) = free.iter().next().map(|(&s, &e)| (s, e))?;
        let area_size = end - start;

        if area_size <= size {
            free.remove(&start);
            self.callbacks.destroy(start, area_size);
            Some((start, area_size))
        } else {
            self.callbacks.shrink_from_front(start, area_size, size);
            free.remove(&start);
            free.insert(start + size, end);
            Some((start, size))
        }
    }

    /// Allocate exactly `size` bytes from the highest fitting area.
    pub fn alloc_from_back(&self, size: usize) -> Option<usize> {
        let mut free = self.free.lock();
        let (start, end) = free
            .iter()
            .rev()
            .map(|(&s, &e)| (s, e))
            .find(|(s, e)| e - s >= size)?;

        if end - start == size {
            free.remove(&start);
            self.callbacks.destroy(start, size);
            Some(start)
        } else {
            self.callbacks.shrink_from_back(start, end - start, size);
            free.insert(start, end - size);
            Some(end - size)
        }
    }

    /// Allocate up to `size` bytes from the highest area.
    pub fn alloc_from_back_at_most(&self, size: usize) -> Option<(usize, usize)> {
        let mut free = self.free.lock();
        let (start, end) = free.iter().next_back().map(|(&s, &e)| (s, e))?;
        let area_size = end - start;

        if area_size <= size {
            free.remove(&start);
            self.callbacks.destroy(start, area_size);
            Some((start, area_size))
        } else {
            self.callbacks.shrink_from_back(start, area_size, size);
            free.insert(start, end - size);
            Some((end - size, size))
        }
    }

    /// Return `[start, start + size)` to the free list, merging with
    /// neighbours.
    pub fn free(&self, start: usize, size: usize) {
        debug_assert!(size > 0, "Freeing empty range");
        let end = start + size;
        let mut free = self.free.lock();

        let prev = free
            .range(..start)
            .next_back()
            .map(|(&s, &e)| (s, e))
            .filter(|&(_, e)| e == start);
        let next = free.get(&end).map(|&e| (end, e));

        debug_assert!(
            free.range(start..end).next().is_none(),
            "Freed range {:#x}..{:#x} overlaps a free area",
            start,
            end
        );

        match (prev, next) {
            (Some((prev_start, _)), Some((_, next_end))) => {
                self.callbacks
                    .grow_from_back(prev_start, start - prev_start, size + (next_end - end));
                free.remove(&end);
                free.insert(prev_start, next_end);
            },
            (Some((prev_start, _)), None) => {
                self.callbacks
                    .grow_from_back(prev_start, start - prev_start, size);
                free.insert(prev_start, end);
            },
            (None, Some((_, next_end))) => {
                self.callbacks.grow_from_front(end, next_end - end, size);
                free.remove(&end);
                free.insert(start, next_end);
            },
            (None, None) => {
                self.callbacks.create(start, size);
                free.insert(start, end);
            },
        }
    }
}

impl Default for MemoryManager {
    fn default() -> Self {
        Self::new()
    }
}
