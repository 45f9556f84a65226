//! Page Allocator - Capacity, Page Cache and Commit
//!
//! Hands out mapped, committed pages and takes them back into the page
//! cache. Capacity (committed bytes) grows on demand up to the current max
//! capacity and shrinks again through uncommit.
//!
//! ```text
//!   0 ........ used ........ capacity ........ current max ........ max
//!   |  in pages  |  page cache  |  committed on demand  |  lost to commit
//!                                                           failures
//! ```
//!
//! An allocation first claims its size against the current max capacity
//! under the lock. The page then comes from the cache, or is built outside
//! the lock from fresh virtual memory plus physical memory harvested from
//! flushed cache pages and newly allocated backing.

use crate::config::HeapConfig;
use crate::error::{HeapError, Result};
use crate::globals::{GlobalSeqNum, PageGeometry, PageType, GRANULE_SIZE, MB};
use crate::heap::page::Page;
use crate::heap::page_cache::PageCache;
use crate::heap::physical_memory::{PhysicalMemory, PhysicalMemoryManager};
use crate::heap::virtual_memory::VirtualMemoryManager;
use crate::logging::{GcEvent, GcLogger};
use crate::util::Alignment;
use crossbeam::epoch;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

const UNCOMMIT_LIMIT: usize = 256 * MB;

/// Allocation counters since the last mark start
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageAllocatorStats {
    pub capacity: usize,
    pub max_capacity: usize,
    pub used: usize,
    pub used_high: usize,
    pub used_low: usize,
    pub allocated: usize,
    pub reclaimed: usize,
    pub cached: usize,
}

struct State {
    capacity: usize,
    current_max_capacity: usize,
    used: usize,
    // Flushed for uncommit, not yet returned as capacity.
    claimed: usize,
    used_high: usize,
    used_low: usize,
    allocated: usize,
    reclaimed: usize,
    cache: PageCache,
}

impl State {
    fn available(&self) -> usize {
        self.current_max_capacity - self.used - self.claimed
    }

    fn increase_capacity(&mut self, size: usize) -> usize {
        let increased = size.min(self.current_max_capacity - self.capacity);
        self.capacity += increased;
        increased
    }

    /// Shrink capacity, optionally lowering the max to match.
    ///
    /// Returns the old and new max when it was lowered.
    fn decrease_capacity(&mut self, size: usize, set_max: bool) -> Option<(usize, usize)> {
        self.capacity -= size;
        if !set_max {
            return None;
        }
        let old_max = self.current_max_capacity;
        self.current_max_capacity = self.capacity;
        Some((old_max, self.capacity))
    }

    fn increase_used(&mut self, size: usize) {
        self.allocated += size;
        self.used += size;
        self.used_high = self.used_high.max(self.used);
    }

    fn decrease_used(&mut self, size: usize, reclaimed: bool) {
        if reclaimed {
            self.reclaimed += size;
        }
        self.used -= size;
        self.used_low = self.used_low.min(self.used);
    }
}

/// What a claim under the lock produced.
enum Claim {
    Cached(Page),
    Create { increased: usize, flushed: Vec<Page> },
}

/// PageAllocator - committed page provider
pub struct PageAllocator {
    vmm: VirtualMemoryManager,
    pmm: PhysicalMemoryManager,
    geometry: PageGeometry,
    global_seqnum: Arc<GlobalSeqNum>,
    logger: Arc<GcLogger>,
    min_capacity: usize,
    initial_capacity: usize,
    max_capacity: usize,
    uncommit_enabled: bool,
    uncommit_delay: Duration,
    pretouch: bool,
    state: Mutex<State>,
}

impl PageAllocator {
    /// Create the allocator. Fails when too little address space was
    /// reserved for `config.max_heap_size`.
    pub fn new(
        config: &HeapConfig,
        vmm: VirtualMemoryManager,
        pmm: PhysicalMemoryManager,
        global_seqnum: Arc<GlobalSeqNum>,
        logger: Arc<GcLogger>,
    ) -> Result<Self> {
        let max_capacity = config.max_heap_size;
        if !vmm.is_initialized(max_capacity) {
            return Err(HeapError::AddressSpaceReservation(format!(
                "reserved {}M of {}M",
                vmm.reserved() >> 20,
                max_capacity >> 20
            )));
        }

        let uncommit_enabled =
            config.uncommit && pmm.try_enable_uncommit(config.min_heap_size, max_capacity);
        let geometry = PageGeometry::for_max_heap(max_capacity);

        Ok(Self {
            vmm,
            pmm,
            geometry,
            global_seqnum,
            logger,
            min_capacity: config.min_heap_size,
            initial_capacity: config.initial_heap_size,
            max_capacity,
            uncommit_enabled,
            uncommit_delay: config.uncommit_delay,
            pretouch: config.always_pretouch,
            state: Mutex::new(State {
                capacity: 0,
                current_max_capacity: max_capacity,
                used: 0,
                claimed: 0,
                used_high: 0,
                used_low: 0,
                allocated: 0,
                reclaimed: 0,
                cache: PageCache::new(geometry),
            }),
        })
    }

    pub fn geometry(&self) -> &PageGeometry {
        &self.geometry
    }

    pub fn virtual_memory(&self) -> &VirtualMemoryManager {
        &self.vmm
    }

    pub fn physical_memory(&self) -> &PhysicalMemoryManager {
        &self.pmm
    }

    pub fn min_capacity(&self) -> usize {
        self.min_capacity
    }

    pub fn initial_capacity(&self) -> usize {
        self.initial_capacity
    }

    /// Max capacity, lowered after commit failures
    pub fn max_capacity(&self) -> usize {
        self.state.lock().current_max_capacity
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    pub fn used(&self) -> usize {
        self.state.lock().used
    }

    /// Bytes still available for allocation
    pub fn unused(&self) -> usize {
        self.state.lock().available()
    }

    pub fn uncommit_enabled(&self) -> bool {
        self.uncommit_enabled
    }

    pub fn stats(&self) -> PageAllocatorStats {
        let state = self.state.lock();
        PageAllocatorStats {
            capacity: state.capacity,
            max_capacity: state.current_max_capacity,
            used: state.used,
            used_high: state.used_high,
            used_low: state.used_low,
            allocated: state.allocated,
            reclaimed: state.reclaimed,
            cached: state.cache.size(),
        }
    }

    /// Restart the per-cycle counters, called at mark start.
    pub fn reset_statistics(&self) {
        let mut state = self.state.lock();
        state.allocated = 0;
        state.reclaimed = 0;
        state.used_high = state.used;
        state.used_low = state.used;
    }

    /// Commit the initial capacity and park it in the page cache.
    pub fn prime_cache(&self) -> Result<()> {
        let size = self.initial_capacity;
        if size == 0 {
            return Ok(());
        }

        let page = self.alloc_page_inner(PageType::Large, size, true)?;
        if self.pretouch {
            self.pmm.pretouch(page.start(), page.size());
        }
        self.cache_page(page, false);
        Ok(())
    }

    /// Allocate a page of `page_type` and `size`, logging failures.
    pub fn alloc_page(&self, page_type: PageType, size: usize) -> Result<Arc<Page>> {
        match self.alloc_page_inner(page_type, size, false) {
            Ok(page) => Ok(Arc::new(page)),
            Err(err) => {
                self.logger.log(GcEvent::AllocationFailure {
                    size,
                    used_bytes: self.used(),
                });
                Err(err)
            },
        }
    }

    /// Allocate without reporting failure. For relocation targets, where
    /// running out of memory switches the worker to in-place relocation.
    pub fn try_alloc_page(&self, page_type: PageType, size: usize) -> Option<Arc<Page>> {
        self.alloc_page_inner(page_type, size, false).ok().map(Arc::new)
    }

    fn alloc_page_inner(&self, page_type: PageType, size: usize, low_address: bool) -> Result<Page> {
        debug_assert!(Alignment::is_granule_aligned(size) && size > 0);

        let claim = {
            let mut state = self.state.lock();
            let available = state.available();
            if size > available {
                return Err(HeapError::OutOfMemory {
                    requested: size,
                    available,
                });
            }

            let claim = match state.cache.alloc_page(page_type, size) {
                Some(page) => Claim::Cached(page),
                None => {
                    let increased = state.increase_capacity(size);
                    let flushed = if increased < size {
                        state.cache.flush_for_allocation(size - increased)
                    } else {
                        Vec::new()
                    };
                    Claim::Create { increased, flushed }
                },
            };
            state.increase_used(size);
            claim
        };

        let (increased, flushed) = match claim {
            Claim::Cached(mut page) => {
                page.reset(self.global_seqnum.get());
                return Ok(page);
            },
            Claim::Create { increased, flushed } => (increased, flushed),
        };

        let Some(vmem) = self.vmm.alloc(size, low_address) else {
            log::warn!("Out of address space allocating {}M page", size >> 20);
            let mut state = self.state.lock();
            for page in flushed {
                state.cache.free_page(page);
            }
            state.decrease_used(size, false);
            state.decrease_capacity(increased, false);
            return Err(HeapError::OutOfMemory {
                requested: size,
                available: state.available(),
            });
        };

        let mut pmem = PhysicalMemory::new();
        for page in flushed {
            self.pmm.unmap(page.start(), page.size());
            let (flushed_vmem, flushed_pmem) = page.into_memory();
            self.vmm.free(&flushed_vmem);
            pmem.add_segments(&flushed_pmem);
        }
        let harvested = pmem.size();
        if harvested < size {
            self.pmm.alloc(&mut pmem, size - harvested);
        }

        let mut page = Page::new(
            page_type,
            vmem,
            pmem,
            self.geometry,
            Arc::clone(&self.global_seqnum),
        );

        if !self.pmm.commit(page.physical_memory_mut()) {
            return Err(self.commit_failed(page));
        }

        self.pmm.map(page.start(), page.physical_memory());
        Ok(page)
    }

    /// Keep the committed part in the cache, give the rest back and lower
    /// the max capacity so the same commit is not attempted again.
    fn commit_failed(&self, mut page: Page) -> HeapError {
        let size = page.size();
        let committed = page.physical_memory().committed();

        let committed_page = if committed > 0 {
            let mut committed_page = page.split_committed();
            self.pmm
                .map(committed_page.start(), committed_page.physical_memory());
            committed_page.set_last_used();
            Some(committed_page)
        } else {
            None
        };

        let (vmem, pmem) = page.into_memory();
        self.pmm.free(&pmem);
        self.vmm.free(&vmem);

        let (lowered, available) = {
            let mut state = self.state.lock();
            if let Some(committed_page) = committed_page {
                state.cache.free_page(committed_page);
            }
            state.decrease_used(size, false);
            let lowered = state.decrease_capacity(size - committed, true);
            (lowered, state.available())
        };

        if let Some((old_max, new_max)) = lowered {
            self.logger
                .log(GcEvent::CapacityLowered { old_max, new_max });
        }

        HeapError::OutOfMemory {
            requested: size,
            available,
        }
    }

    /// Return a page reclaimed by the collector to the cache.
    ///
    /// The page object itself is released once no epoch-pinned reader can
    /// still hold a reference obtained from a page table lookup.
    pub fn free_page(&self, page: Arc<Page>) {
        self.release_page(page, true);
    }

    /// Return a page that was allocated but never published.
    pub fn undo_alloc_page(&self, page: Arc<Page>) {
        self.release_page(page, false);
    }

    fn release_page(&self, page: Arc<Page>, reclaimed: bool) {
        self.cache_page(page.reuse(), reclaimed);
        let guard = epoch::pin();
        guard.defer(move || drop(page));
    }

    fn cache_page(&self, mut page: Page, reclaimed: bool) {
        page.set_last_used();
        let mut state = self.state.lock();
        state.decrease_used(page.size(), reclaimed);
        state.cache.free_page(page);
    }

    /// Uncommit cached pages unused for longer than the uncommit delay.
    ///
    /// Capacity never drops below `max(used, min_capacity)`, and one call
    /// releases at most 1/128 of the max capacity (capped at 256M).
    /// Returns the bytes uncommitted and, when cached pages were too young,
    /// the time until the next one expires.
    pub fn uncommit(&self) -> (usize, Option<Duration>) {
        if !self.uncommit_enabled {
            return (0, None);
        }

        let (pages, timeout) = {
            let mut state = self.state.lock();
            let retain = state.used.max(self.min_capacity);
            let release = state.capacity.saturating_sub(retain + state.claimed);
            let limit = Alignment::align_up(state.current_max_capacity >> 7, GRANULE_SIZE)
                .min(UNCOMMIT_LIMIT);
            let flush = Alignment::align_down_to_granule(release.min(limit));
            if flush == 0 {
                return (0, None);
            }

            let (pages, timeout) = state.cache.flush_for_uncommit(flush, self.uncommit_delay);
            state.claimed += pages.iter().map(Page::size).sum::<usize>();
            (pages, timeout)
        };

        let mut flushed = 0;
        for page in pages {
            flushed += page.size();
            self.pmm.unmap(page.start(), page.size());
            let (vmem, mut pmem) = page.into_memory();
            if !self.pmm.uncommit(&mut pmem) {
                log::warn!("Partial uncommit of {}M", pmem.size() >> 20);
            }
            self.pmm.free(&pmem);
            self.vmm.free(&vmem);
        }

        if flushed > 0 {
            let mut state = self.state.lock();
            state.claimed -= flushed;
            state.decrease_capacity(flushed, false);
            drop(state);
            self.logger.log(GcEvent::Uncommit { bytes: flushed });
        }

        (flushed, timeout)
    }

    /// Configured max capacity, before any commit failure lowered it
    pub fn configured_max_capacity(&self) -> usize {
        self.max_capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::AddressLayout;
    use crate::backing::{AddressReserver, Backing};
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullReserver;

    impl AddressReserver for NullReserver {
        fn reserve(&self, _addr: usize, _size: usize) -> bool {
            true
        }

        fn unreserve(&self, _addr: usize, _size: usize) {}
    }

    /// Commits up to `limit` bytes in total, maps nothing.
    struct CountingBacking {
        committed: AtomicUsize,
        limit: usize,
    }

    impl Backing for CountingBacking {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn commit_inner(&self, _offset: usize, length: usize) -> bool {
            let current = self.committed.load(Ordering::Relaxed);
            if current + length > self.limit {
                return false;
            }
            self.committed.fetch_add(length, Ordering::Relaxed);
            true
        }

        fn uncommit_inner(&self, _offset: usize, length: usize) -> bool {
            self.committed.fetch_sub(length, Ordering::Relaxed);
            true
        }

        fn map(&self, _addr: usize, _size: usize, _offset: usize) -> io::Result<()> {
            Ok(())
        }

        fn unmap(&self, _addr: usize, _size: usize) -> io::Result<()> {
            Ok(())
        }
    }

    fn allocator(config: &HeapConfig, commit_limit: usize) -> PageAllocator {
        let layout = AddressLayout::for_max_heap(config.max_heap_size);
        let backing = Arc::new(CountingBacking {
            committed: AtomicUsize::new(0),
            limit: commit_limit,
        });
        let vmm = VirtualMemoryManager::new(layout, Arc::new(NullReserver), config.max_heap_size);
        let pmm = PhysicalMemoryManager::new(backing, layout, config.max_heap_size);
        PageAllocator::new(
            config,
            vmm,
            pmm,
            Arc::new(GlobalSeqNum::new()),
            Arc::new(GcLogger::default()),
        )
        .unwrap()
    }

    fn config(max: usize) -> HeapConfig {
        HeapConfig {
            max_heap_size: max,
            min_heap_size: 2 * MB,
            initial_heap_size: 8 * MB,
            uncommit_delay: Duration::ZERO,
            ..Default::default()
        }
    }

    #[test]
    fn test_prime_cache_serves_small_pages() {
        let allocator = allocator(&config(64 * MB), usize::MAX);
        allocator.prime_cache().unwrap();
        assert_eq!(allocator.capacity(), 8 * MB);
        assert_eq!(allocator.used(), 0);

        let page = allocator.alloc_page(PageType::Small, 2 * MB).unwrap();
        assert_eq!(page.page_type(), PageType::Small);
        assert_eq!(allocator.capacity(), 8 * MB);
        assert_eq!(allocator.used(), 2 * MB);
        assert_eq!(allocator.stats().cached, 6 * MB);
    }

    #[test]
    fn test_free_page_returns_to_cache() {
        let allocator = allocator(&config(64 * MB), usize::MAX);
        let page = allocator.alloc_page(PageType::Small, 2 * MB).unwrap();
        let start = page.start();
        allocator.free_page(page);

        let stats = allocator.stats();
        assert_eq!(stats.used, 0);
        assert_eq!(stats.reclaimed, 2 * MB);
        assert_eq!(stats.cached, 2 * MB);

        let again = allocator.alloc_page(PageType::Small, 2 * MB).unwrap();
        assert_eq!(again.start(), start);
        assert!(again.is_allocating());
    }

    #[test]
    fn test_out_of_memory_beyond_max() {
        let allocator = allocator(&config(8 * MB), usize::MAX);
        let _a = allocator.alloc_page(PageType::Large, 6 * MB).unwrap();
        let err = allocator.alloc_page(PageType::Large, 4 * MB).unwrap_err();
        assert!(matches!(
            err,
            HeapError::OutOfMemory {
                requested,
                available
            } if requested == 4 * MB && available == 2 * MB
        ));
    }

    #[test]
    fn test_flush_cache_for_larger_page() {
        let allocator = allocator(&config(8 * MB), usize::MAX);
        let pages: Vec<_> = (0..4)
            .map(|_| allocator.alloc_page(PageType::Small, 2 * MB).unwrap())
            .collect();
        for page in pages {
            allocator.free_page(page);
        }
        assert_eq!(allocator.capacity(), 8 * MB);

        // Capacity is at max, so the large page is built from cached memory.
        let large = allocator.alloc_page(PageType::Large, 6 * MB).unwrap();
        assert_eq!(large.size(), 6 * MB);
        assert_eq!(allocator.capacity(), 8 * MB);
        assert_eq!(allocator.stats().cached, 2 * MB);
    }

    #[test]
    fn test_commit_failure_lowers_max_capacity() {
        let allocator = allocator(&config(64 * MB), 4 * MB);
        let err = allocator.alloc_page(PageType::Large, 8 * MB).unwrap_err();
        assert!(err.is_recoverable());

        let stats = allocator.stats();
        assert_eq!(stats.used, 0);
        assert_eq!(stats.max_capacity, 4 * MB);
        assert_eq!(stats.capacity, 4 * MB);
        assert_eq!(stats.cached, 4 * MB);

        // The committed part is still usable.
        let page = allocator.alloc_page(PageType::Small, 2 * MB).unwrap();
        assert_eq!(page.size(), 2 * MB);
    }

    #[test]
    fn test_uncommit_keeps_min_capacity() {
        let allocator = allocator(&config(512 * MB), usize::MAX);
        assert!(allocator.uncommit_enabled());
        allocator.prime_cache().unwrap();

        let (uncommitted, _) = allocator.uncommit();
        assert_eq!(uncommitted, 4 * MB);
        assert_eq!(allocator.capacity(), 4 * MB);
    }

    #[test]
    fn test_reset_statistics() {
        let allocator = allocator(&config(64 * MB), usize::MAX);
        let page = allocator.alloc_page(PageType::Small, 2 * MB).unwrap();
        assert_eq!(allocator.stats().allocated, 2 * MB);

        allocator.reset_statistics();
        let stats = allocator.stats();
        assert_eq!(stats.allocated, 0);
        assert_eq!(stats.used_high, 2 * MB);
        drop(page);
    }
}
