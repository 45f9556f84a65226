//! Page Table
//!
//! Maps every granule of the object space to the page covering it. Each
//! inserted page contributes one strong count, held by the table until the
//! page is removed.
//!
//! Lookups hand out references tied to an epoch guard. Whoever removes a
//! page must release the returned `Arc` through the epoch (see
//! [`crate::heap::page_allocator::PageAllocator::free_page`]), so a
//! reference obtained under a pinned guard stays valid until the guard is
//! dropped.

use crate::address::Offset;
use crate::error::Result;
use crate::globals::GRANULE_SIZE_SHIFT;
use crate::heap::granule_map::GranuleMap;
use crate::heap::page::Page;
use crossbeam::epoch::Guard;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// PageTable - granule to page lookup
pub struct PageTable {
    map: GranuleMap<*const Page>,
    count: AtomicUsize,
}

impl PageTable {
    pub fn new(max_offset: usize) -> Result<Self> {
        Ok(Self {
            map: GranuleMap::new(max_offset)?,
            count: AtomicUsize::new(0),
        })
    }

    /// Publish `page` for every granule it covers.
    pub fn insert(&self, page: &Arc<Page>) {
        debug_assert!(
            self.map.get(page.start()).is_null(),
            "page already present at {}",
            page.start()
        );
        let raw = Arc::into_raw(Arc::clone(page));
        self.map.release_put_range(page.start(), page.size(), raw);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Unpublish `page`, returning the table's reference.
    pub fn remove(&self, page: &Page) -> Option<Arc<Page>> {
        let raw = self.map.get(page.start());
        if raw.is_null() || !ptr::eq(raw, page) {
            return None;
        }
        self.map
            .release_put_range(page.start(), page.size(), ptr::null());
        self.count.fetch_sub(1, Ordering::Relaxed);
        // SAFETY: raw came from Arc::into_raw in `insert`.
        Some(unsafe { Arc::from_raw(raw) })
    }

    /// Page covering `offset`, valid while `guard` is pinned.
    pub fn get<'g>(&self, offset: Offset, _guard: &'g Guard) -> Option<&'g Page> {
        let raw = self.map.get_acquire(offset);
        // SAFETY: removed pages are released through the epoch, so the
        // allocation outlives every guard pinned before the removal.
        unsafe { raw.as_ref() }
    }

    /// Like [`PageTable::get`], but takes a strong reference.
    pub fn get_arc(&self, offset: Offset, _guard: &Guard) -> Option<Arc<Page>> {
        let raw = self.map.get_acquire(offset);
        if raw.is_null() {
            return None;
        }
        // SAFETY: the strong count is at least one while the guard is pinned.
        unsafe {
            Arc::increment_strong_count(raw);
            Some(Arc::from_raw(raw))
        }
    }

    /// Number of pages in the table
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every page, in offset order.
    pub fn pages(&self, guard: &Guard) -> Vec<Arc<Page>> {
        let mut pages = Vec::with_capacity(self.len());
        let mut index = 0;
        let granules = self.map.len();
        while index < granules {
            let offset = Offset::new(index << GRANULE_SIZE_SHIFT);
            match self.get_arc(offset, guard) {
                Some(page) => {
                    index += page.size() >> GRANULE_SIZE_SHIFT;
                    pages.push(page);
                },
                None => index += 1,
            }
        }
        pages
    }
}

impl Drop for PageTable {
    fn drop(&mut self) {
        let mut previous: *const Page = ptr::null();
        for raw in self.map.iter() {
            if !raw.is_null() && !ptr::eq(raw, previous) {
                // SAFETY: each distinct pointer holds one strong count.
                drop(unsafe { Arc::from_raw(raw) });
            }
            previous = raw;
        }
    }
}
