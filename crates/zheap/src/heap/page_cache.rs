//! Page Cache
//!
//! Freed pages stay mapped and committed in a per-class cache, most
//! recently used first. Allocation prefers an exact fit, then splits an
//! oversized medium or large page. Flushing takes the least recently used
//! pages, either to harvest their physical memory for a new page or to
//! uncommit them.

use crate::globals::{PageGeometry, PageType};
use crate::heap::page::Page;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// PageCache - cached pages by size class
pub struct PageCache {
    geometry: PageGeometry,
    small: VecDeque<Page>,
    medium: VecDeque<Page>,
    large: VecDeque<Page>,
}

impl PageCache {
    pub fn new(geometry: PageGeometry) -> Self {
        Self {
            geometry,
            small: VecDeque::new(),
            medium: VecDeque::new(),
            large: VecDeque::new(),
        }
    }

    fn list(&mut self, page_type: PageType) -> &mut VecDeque<Page> {
        match page_type {
            PageType::Small => &mut self.small,
            PageType::Medium => &mut self.medium,
            PageType::Large => &mut self.large,
        }
    }

    /// Cached bytes
    pub fn size(&self) -> usize {
        self.small
            .iter()
            .chain(self.medium.iter())
            .chain(self.large.iter())
            .map(Page::size)
            .sum()
    }

    pub fn len(&self) -> usize {
        self.small.len() + self.medium.len() + self.large.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take a page of exactly `page_type` and `size`, splitting a larger
    /// cached page if needed.
    pub fn alloc_page(&mut self, page_type: PageType, size: usize) -> Option<Page> {
        let exact = match page_type {
            PageType::Small | PageType::Medium => self.list(page_type).pop_front(),
            PageType::Large => {
                let index = self.large.iter().position(|p| p.size() == size);
                index.and_then(|i| self.large.remove(i))
            },
        };
        if exact.is_some() {
            return exact;
        }

        let mut oversized = self.alloc_oversized_page(size)?;
        if size < oversized.size() {
            let page = oversized.split(page_type, size);
            self.free_page(oversized);
            Some(page)
        } else {
            oversized.retype(page_type);
            Some(oversized)
        }
    }

    fn alloc_oversized_page(&mut self, size: usize) -> Option<Page> {
        if let Some(page) = self.alloc_oversized_large(size) {
            return Some(page);
        }
        if self.geometry.medium_enabled() && size <= self.geometry.medium_page_size() {
            return self.medium.pop_front();
        }
        None
    }

    fn alloc_oversized_large(&mut self, size: usize) -> Option<Page> {
        let index = self.large.iter().position(|p| p.size() >= size)?;
        self.large.remove(index)
    }

    pub fn free_page(&mut self, page: Page) {
        self.list(page.page_type()).push_front(page);
    }

    /// Remove at least `requested` bytes of least recently used pages.
    ///
    /// Large pages go first, then medium, then small. An overshoot is split
    /// off the last page and cached again.
    pub fn flush_for_allocation(&mut self, requested: usize) -> Vec<Page> {
        self.flush(requested, |_| true)
    }

    /// Remove up to `requested` bytes of pages unused for at least `delay`.
    ///
    /// Returns the flushed pages and, when a page was left behind because it
    /// was used too recently, how long until it expires.
    pub fn flush_for_uncommit(
        &mut self,
        requested: usize,
        delay: Duration,
    ) -> (Vec<Page>, Option<Duration>) {
        let now = Instant::now();
        let mut timeout: Option<Duration> = None;

        let flushed = self.flush(requested, |page| {
            let Some(last_used) = page.last_used() else {
                return true;
            };
            let expires = last_used + delay;
            if expires > now {
                let remaining = expires - now;
                timeout = Some(timeout.map_or(remaining, |t| t.min(remaining)));
                return false;
            }
            true
        });

        (flushed, timeout)
    }

    fn flush<F>(&mut self, requested: usize, mut flushable: F) -> Vec<Page>
    where
        F: FnMut(&Page) -> bool,
    {
        let mut flushed_pages = Vec::new();
        let mut flushed = 0;

        for page_type in [PageType::Large, PageType::Medium, PageType::Small] {
            let list = self.list(page_type);
            while flushed < requested {
                match list.back() {
                    Some(page) if flushable(page) => {},
                    _ => break,
                }
                if let Some(page) = list.pop_back() {
                    flushed += page.size();
                    flushed_pages.push(page);
                }
            }
        }

        if flushed > requested {
            let unflushed = flushed - requested;
            if let Some(last) = flushed_pages.last_mut() {
                let page = last.split_by_size(unflushed);
                self.free_page(page);
            }
        }

        flushed_pages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Offset;
    use crate::globals::{GlobalSeqNum, GRANULE_SIZE, MB};
    use crate::heap::physical_memory::{PhysicalMemory, PhysicalMemorySegment};
    use crate::heap::virtual_memory::VirtualMemory;
    use std::sync::Arc;

    fn geometry() -> PageGeometry {
        PageGeometry::for_max_heap(256 * MB)
    }

    fn page(page_type: PageType, start: usize, size: usize) -> Page {
        let mut page = Page::new(
            page_type,
            VirtualMemory::new(Offset::new(start), size),
            PhysicalMemory::from_segment(PhysicalMemorySegment::new(start, size, true)),
            geometry(),
            Arc::new(GlobalSeqNum::new()),
        );
        page.set_last_used();
        page
    }

    #[test]
    fn test_exact_fit_most_recent_first() {
        let mut cache = PageCache::new(geometry());
        cache.free_page(page(PageType::Small, 0, GRANULE_SIZE));
        cache.free_page(page(PageType::Small, GRANULE_SIZE, GRANULE_SIZE));

        let page = cache.alloc_page(PageType::Small, GRANULE_SIZE).unwrap();
        assert_eq!(page.start(), Offset::new(GRANULE_SIZE));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_oversized_large_is_split() {
        let mut cache = PageCache::new(geometry());
        cache.free_page(page(PageType::Large, 0, 8 * GRANULE_SIZE));

        let small = cache.alloc_page(PageType::Small, GRANULE_SIZE).unwrap();
        assert_eq!(small.page_type(), PageType::Small);
        assert_eq!(small.size(), GRANULE_SIZE);
        assert_eq!(cache.size(), 7 * GRANULE_SIZE);
    }

    #[test]
    fn test_oversized_medium_is_split_into_small() {
        let mut cache = PageCache::new(geometry());
        cache.free_page(page(PageType::Medium, 0, 8 * MB));

        let small = cache.alloc_page(PageType::Small, GRANULE_SIZE).unwrap();
        assert_eq!(small.size(), GRANULE_SIZE);
        assert_eq!(cache.size(), 6 * MB);
        assert!(cache.alloc_page(PageType::Medium, 8 * MB).is_none());
    }

    #[test]
    fn test_flush_for_allocation_splits_overshoot() {
        let mut cache = PageCache::new(geometry());
        cache.free_page(page(PageType::Small, 0, GRANULE_SIZE));
        cache.free_page(page(PageType::Large, GRANULE_SIZE, 4 * GRANULE_SIZE));

        let flushed = cache.flush_for_allocation(3 * GRANULE_SIZE);
        let total: usize = flushed.iter().map(Page::size).sum();
        assert_eq!(total, 3 * GRANULE_SIZE);
        assert_eq!(cache.size(), 2 * GRANULE_SIZE);
    }

    #[test]
    fn test_flush_for_uncommit_respects_delay() {
        let mut cache = PageCache::new(geometry());
        cache.free_page(page(PageType::Small, 0, GRANULE_SIZE));

        let (flushed, timeout) = cache.flush_for_uncommit(GRANULE_SIZE, Duration::from_secs(60));
        assert!(flushed.is_empty());
        assert!(timeout.is_some());

        let (flushed, _) = cache.flush_for_uncommit(GRANULE_SIZE, Duration::ZERO);
        assert_eq!(flushed.len(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_flush_for_uncommit_splits_large_page() {
        let mut cache = PageCache::new(geometry());
        cache.free_page(page(PageType::Large, 0, 4 * GRANULE_SIZE));

        let (flushed, timeout) = cache.flush_for_uncommit(GRANULE_SIZE, Duration::ZERO);
        assert!(timeout.is_none());
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].size(), GRANULE_SIZE);
        assert_eq!(cache.size(), 3 * GRANULE_SIZE);
    }
}
