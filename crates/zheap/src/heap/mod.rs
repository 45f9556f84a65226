//! Heap Module - Collector Context
//!
//! [`Heap`] owns every piece of collector state: the address space masks,
//! the phase, the cycle sequence number, the page and forwarding tables,
//! the allocators and the current relocation set.
//!
//! ## Phases
//!
//! ```text
//!            mark_start              mark_end == true
//!  Relocate ───────────> Mark ─────────────────────────> MarkCompleted
//!     ^                                                       │
//!     └──────────────────────── relocate_start ───────────────┘
//! ```
//!
//! Transitions run at safepoints, with mutators stopped. Between
//! `mark_end` and `relocate_start` the driver processes non-strong
//! references and selects the relocation set; `relocate` then runs
//! concurrently with mutators, which help through the barrier slow path.
//!
//! ## Page Lifetime
//!
//! Pages are published in the [`PageTable`] and read under an epoch guard.
//! Freeing a page unpublishes it, hands its memory back to the page cache
//! and releases the page object once every pinned reader is gone.

pub mod granule_map;
pub mod live_map;
pub mod memory_manager;
pub mod object_allocator;
pub mod page;
pub mod page_allocator;
pub mod page_cache;
pub mod page_table;
pub mod physical_memory;
pub mod virtual_memory;

pub use object_allocator::{ObjectAllocator, PageSource};
pub use page::Page;
pub use page_allocator::{PageAllocator, PageAllocatorStats};
pub use page_table::PageTable;

use crate::address::{AddressLayout, AddressSpace, ColoredPointer, Offset, View};
use crate::backing::{self, Platform};
use crate::collaborator::{Collaborators, MarkingCollaborator, ReferenceCollaborator};
use crate::config::HeapConfig;
use crate::error::{HeapError, Result};
use crate::globals::{GlobalSeqNum, PageGeometry, PageType, Phase, HEAP_VIEWS};
use crate::logging::{GcEvent, GcLogger};
use crate::relocate::{
    FragmentationPolicy, ForwardingTable, RelocationSet, RelocationSetSelector, Relocator,
    SelectionPolicy, SelectorStats,
};
use crate::stats::RelocationStats;
use crate::util::Alignment;
use crate::workers::Workers;
use crossbeam::epoch;
use parking_lot::{Mutex, RwLock};
use physical_memory::PhysicalMemoryManager;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use virtual_memory::VirtualMemoryManager;

/// Heap - region based, relocating object space
pub struct Heap {
    config: HeapConfig,
    logger: Arc<GcLogger>,
    address_space: AddressSpace,
    phase: AtomicU8,
    cycle: AtomicU64,
    aborted: AtomicBool,
    resurrection_blocked: AtomicBool,
    global_seqnum: Arc<GlobalSeqNum>,
    page_allocator: PageAllocator,
    page_table: PageTable,
    object_allocator: ObjectAllocator,
    forwarding_table: ForwardingTable,
    relocation_set: RwLock<RelocationSet>,
    policy: Arc<dyn SelectionPolicy>,
    selector_stats: Mutex<SelectorStats>,
    relocator: Relocator,
    marking: Arc<dyn MarkingCollaborator>,
    references: Arc<dyn ReferenceCollaborator>,
}

impl Heap {
    /// Create a heap on the backing of the current OS.
    pub fn new(config: HeapConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let platform = backing::platform(&config)?;
        Self::with_platform(config, platform, collaborators)
    }

    /// Create a heap on an explicit platform backing.
    pub fn with_platform(
        config: HeapConfig,
        platform: Platform,
        collaborators: Collaborators,
    ) -> Result<Self> {
        config.validate()?;

        let max_capacity = config.max_heap_size;
        let layout = AddressLayout::for_max_heap(max_capacity);
        let logger = Arc::new(GcLogger::new(config.logger_config()));
        let global_seqnum = Arc::new(GlobalSeqNum::new());

        let vmm = VirtualMemoryManager::new(layout, platform.reserver, max_capacity);
        logger.log(GcEvent::AddressSpace {
            contiguous: vmm.is_contiguous(),
            complete: vmm.is_complete(),
            reserved_bytes: vmm.reserved(),
            views: HEAP_VIEWS,
        });
        let pmm = PhysicalMemoryManager::new(platform.backing, layout, max_capacity);

        let page_allocator = PageAllocator::new(
            &config,
            vmm,
            pmm,
            Arc::clone(&global_seqnum),
            Arc::clone(&logger),
        )?;
        let geometry = *page_allocator.geometry();
        let page_table = PageTable::new(layout.offset_max())?;
        let forwarding_table = ForwardingTable::new(layout.offset_max())?;

        page_allocator.prime_cache()?;

        logger.log(GcEvent::HeapInitialized {
            min_capacity: page_allocator.min_capacity(),
            initial_capacity: page_allocator.initial_capacity(),
            max_capacity,
            medium_page_size: if geometry.medium_enabled() {
                geometry.medium_page_size()
            } else {
                0
            },
            uncommit: page_allocator.uncommit_enabled(),
        });

        let policy: Arc<dyn SelectionPolicy> =
            Arc::new(FragmentationPolicy::new(config.fragmentation_limit));
        let relocator = Relocator::new(collaborators.object_model, Workers::new(config.workers()));

        Ok(Self {
            config,
            logger,
            address_space: AddressSpace::new(layout),
            phase: AtomicU8::new(Phase::Relocate.as_u8()),
            cycle: AtomicU64::new(0),
            aborted: AtomicBool::new(false),
            resurrection_blocked: AtomicBool::new(false),
            global_seqnum,
            page_allocator,
            page_table,
            object_allocator: ObjectAllocator::new(geometry),
            forwarding_table,
            relocation_set: RwLock::new(RelocationSet::new()),
            policy,
            selector_stats: Mutex::new(SelectorStats::default()),
            relocator,
            marking: collaborators.marking,
            references: collaborators.references,
        })
    }

    /// Replace the relocation set selection policy.
    pub fn with_selection_policy(mut self, policy: Arc<dyn SelectionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    pub fn logger(&self) -> &Arc<GcLogger> {
        &self.logger
    }

    /// Colored pointer predicates and conversions for mutator barriers
    pub fn address_space(&self) -> &AddressSpace {
        &self.address_space
    }

    pub fn geometry(&self) -> &PageGeometry {
        self.page_allocator.geometry()
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: Phase) {
        log::debug!("Phase: {} -> {}", self.phase(), phase);
        self.phase.store(phase.as_u8(), Ordering::Release);
    }

    /// Number of the current (or last) cycle, 0 before the first one
    pub fn cycle(&self) -> u64 {
        self.cycle.load(Ordering::Relaxed)
    }

    pub fn seqnum(&self) -> u32 {
        self.global_seqnum.get()
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub fn is_resurrection_blocked(&self) -> bool {
        self.resurrection_blocked.load(Ordering::Acquire)
    }

    pub fn page_allocator(&self) -> &PageAllocator {
        &self.page_allocator
    }

    pub fn relocator(&self) -> &Relocator {
        &self.relocator
    }

    /// Selection statistics of the last `select_relocation_set`
    pub fn selector_stats(&self) -> SelectorStats {
        *self.selector_stats.lock()
    }

    /// Pages in the current relocation set
    pub fn relocation_set_len(&self) -> usize {
        self.relocation_set.read().len()
    }

    fn ensure_phase(&self, expected: Phase) -> Result<()> {
        ensure!(!self.is_aborted(), HeapError::Aborted);
        let actual = self.phase();
        ensure!(actual == expected, HeapError::InvalidPhase { expected, actual });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// True when `ptr` is a colored pointer into an allocated object range.
    pub fn is_in(&self, ptr: ColoredPointer) -> bool {
        if !self.address_space.is_in(ptr) {
            return false;
        }
        let offset = self.address_space.offset_of(ptr);
        let guard = epoch::pin();
        self.page_table
            .get(offset, &guard)
            .map_or(false, |page| page.is_in(offset))
    }

    /// Committed bytes
    pub fn capacity(&self) -> usize {
        self.page_allocator.capacity()
    }

    /// Bytes in allocated pages
    pub fn used(&self) -> usize {
        self.page_allocator.used()
    }

    pub fn max_capacity(&self) -> usize {
        self.page_allocator.max_capacity()
    }

    /// Bytes still available for page allocation
    pub fn unused(&self) -> usize {
        self.page_allocator.unused()
    }

    pub fn page_count(&self) -> usize {
        self.page_table.len()
    }

    /// Page covering `offset`
    pub fn page(&self, offset: Offset) -> Option<Arc<Page>> {
        let guard = epoch::pin();
        self.page_table.get_arc(offset, &guard)
    }

    /// Every page, in offset order
    pub fn pages(&self) -> Vec<Arc<Page>> {
        let guard = epoch::pin();
        self.page_table.pages(&guard)
    }

    /// Machine address of an object, through the remapped view.
    pub fn object_address(&self, offset: Offset) -> usize {
        self.address_space
            .layout()
            .view_address(offset, View::Remapped)
    }

    /// Return idle cached memory to the OS.
    pub fn uncommit(&self) -> (usize, Option<Duration>) {
        self.page_allocator.uncommit()
    }

    // ------------------------------------------------------------------
    // Pages
    // ------------------------------------------------------------------

    /// Unpublish `page` and return its memory to the page cache.
    pub(crate) fn free_page(&self, page: Arc<Page>) {
        drop(self.page_table.remove(&page));
        self.page_allocator.free_page(page);
    }

    fn free_pages(&self, pages: Vec<Arc<Page>>) {
        for page in pages {
            self.free_page(page);
        }
    }

    /// Page for a relocation worker, or None when memory is exhausted.
    pub(crate) fn alloc_relocation_page(&self, page_type: PageType) -> Option<Arc<Page>> {
        let size = self.geometry().page_size(page_type)?;
        let page = self.page_allocator.try_alloc_page(page_type, size)?;
        self.page_table.insert(&page);
        Some(page)
    }

    // ------------------------------------------------------------------
    // Objects
    // ------------------------------------------------------------------

    /// Allocate an object of `size` bytes, returning a good pointer.
    pub fn alloc_object(&self, size: usize) -> Result<ColoredPointer> {
        let offset = self.object_allocator.alloc_object(self, size)?;
        Ok(self.address_space.good(offset))
    }

    /// Take back the most recent allocation. See
    /// [`ObjectAllocator::undo_alloc_object`].
    pub fn undo_alloc_object(&self, ptr: ColoredPointer, size: usize) -> bool {
        let offset = self.address_space.offset_of(ptr);
        match self.page(offset) {
            Some(page) => self
                .object_allocator
                .undo_alloc_object(self, page, offset, size),
            None => false,
        }
    }

    pub(crate) fn alloc_object_for_relocation(&self, size: usize) -> Option<Offset> {
        self.object_allocator
            .alloc_object(&RelocationPages(self), size)
            .ok()
    }

    pub(crate) fn undo_alloc_object_for_relocation(&self, offset: Offset, size: usize) {
        if let Some(page) = self.page(offset) {
            self.object_allocator
                .undo_alloc_object(&RelocationPages(self), page, offset, size);
        }
    }

    /// Record the object at `offset` as live. For marking collaborators.
    ///
    /// Objects on allocating pages are implicitly live and are not marked.
    /// Returns true when this call changed the object's mark.
    pub fn mark_object(&self, offset: Offset, finalizable: bool) -> bool {
        let guard = epoch::pin();
        let Some(page) = self.page_table.get(offset, &guard) else {
            return false;
        };
        if !page.is_relocatable() {
            return false;
        }

        let result = page.mark_object(offset, finalizable);
        if result.inc_live() {
            let size = self.relocator.object_size(self.object_address(offset));
            page.inc_live(1, Alignment::align_up(size, page.object_alignment()));
        }
        result.is_marked()
    }

    // ------------------------------------------------------------------
    // Barrier slow paths
    // ------------------------------------------------------------------

    /// Relocate (or find the relocated copy of) the object behind `ptr`.
    pub fn relocate_object(&self, ptr: ColoredPointer) -> ColoredPointer {
        let offset = self.address_space.offset_of(ptr);
        let guard = epoch::pin();
        let to = match self.forwarding_table.get(offset, &guard) {
            Some(forwarding) => self.relocator.relocate_object(self, forwarding, offset),
            None => offset,
        };
        self.address_space.good(to)
    }

    /// Good pointer for the object behind a stale `ptr`, outside relocation.
    pub fn remap_object(&self, ptr: ColoredPointer) -> ColoredPointer {
        let offset = self.address_space.offset_of(ptr);
        if self.address_space.is_remapped(ptr) || self.address_space.is_marked(ptr) {
            return self.address_space.good(offset);
        }

        let guard = epoch::pin();
        let to = match self.forwarding_table.get(offset, &guard) {
            Some(forwarding) => Relocator::forward_object(forwarding, offset),
            None => offset,
        };
        self.address_space.good(to)
    }

    /// Heal a pointer that failed the load barrier fast path.
    pub fn barrier_slow_path(&self, ptr: ColoredPointer) -> ColoredPointer {
        if ptr.is_null() || self.address_space.is_good(ptr) {
            return ptr;
        }

        if self.phase() == Phase::Relocate {
            self.relocate_object(ptr)
        } else {
            self.remap_object(ptr)
        }
    }

    // ------------------------------------------------------------------
    // Phases
    // ------------------------------------------------------------------

    /// Start a cycle. Safepoint.
    ///
    /// The previous relocation set stays published for remapping until
    /// [`Heap::reset_relocation_set`].
    pub fn mark_start(&self) -> Result<()> {
        self.ensure_phase(Phase::Relocate)?;

        self.address_space.flip_to_marked();
        self.global_seqnum.increment();
        self.object_allocator.retire_pages();
        self.page_allocator.reset_statistics();

        let cycle = self.cycle.fetch_add(1, Ordering::Relaxed) + 1;
        log::debug!(
            "Mark start: cycle {}, seqnum {}, good mask {:#x}",
            cycle,
            self.global_seqnum.get(),
            self.address_space.good_mask()
        );

        self.set_phase(Phase::Mark);
        self.marking.start(self);
        Ok(())
    }

    /// Concurrent marking, from roots when `initial`.
    pub fn mark(&self, initial: bool) -> Result<()> {
        self.ensure_phase(Phase::Mark)?;
        self.marking.mark(self, initial);
        Ok(())
    }

    /// Try to end marking. Safepoint.
    ///
    /// Returns false while the marking collaborator still has work.
    pub fn mark_end(&self) -> Result<bool> {
        self.ensure_phase(Phase::Mark)?;

        if !self.marking.end(self) {
            return Ok(false);
        }

        self.set_phase(Phase::MarkCompleted);
        self.resurrection_blocked.store(true, Ordering::Release);
        log::debug!("Mark end: cycle {}", self.cycle());
        Ok(true)
    }

    /// Weak, soft and phantom reference processing.
    pub fn process_non_strong_references(&self) -> Result<()> {
        self.ensure_phase(Phase::MarkCompleted)?;
        self.references.process(self);
        self.resurrection_blocked.store(false, Ordering::Release);
        Ok(())
    }

    /// Unpublish the previous cycle's forwardings.
    pub fn reset_relocation_set(&self) -> Result<()> {
        self.ensure_phase(Phase::MarkCompleted)?;
        self.relocation_set.write().reset(&self.forwarding_table);
        Ok(())
    }

    /// Free empty pages and choose the pages to relocate.
    pub fn select_relocation_set(&self) -> Result<()> {
        self.ensure_phase(Phase::MarkCompleted)?;
        self.relocation_set.write().reset(&self.forwarding_table);

        let mut selector = RelocationSetSelector::new(self.geometry(), Arc::clone(&self.policy));
        let batch = self.config.empty_page_batch;

        for page in self.pages() {
            if !page.is_relocatable() {
                continue;
            }

            if page.is_marked() {
                selector.register_live_page(page);
            } else {
                selector.register_empty_page(page);
                if selector.should_free_empty_pages(batch) {
                    self.free_pages(selector.take_empty_pages());
                }
            }
        }
        self.free_pages(selector.take_empty_pages());

        selector.select();
        let stats = selector.stats();
        for page_type in [PageType::Small, PageType::Medium] {
            let group = stats.group(page_type);
            self.logger.log(GcEvent::RelocationSet {
                group: page_type,
                candidates: group.candidates,
                selected: group.selected,
                empty_bytes: group.empty,
                compacting_from: group.compacting_from,
                compacting_to: group.compacting_to,
            });
        }
        *self.selector_stats.lock() = stats;

        self.relocation_set.write().install(
            &selector.selected(),
            selector.forwarding_entries(),
            &self.forwarding_table,
        );
        Ok(())
    }

    /// Enter relocation. Safepoint.
    pub fn relocate_start(&self) -> Result<()> {
        self.ensure_phase(Phase::MarkCompleted)?;

        self.address_space.flip_to_remapped();
        self.relocator.counters().reset();
        self.set_phase(Phase::Relocate);
        Ok(())
    }

    /// Relocate the relocation set with the worker pool.
    pub fn relocate(&self) -> Result<RelocationStats> {
        self.ensure_phase(Phase::Relocate)?;

        {
            let set = self.relocation_set.read();
            self.relocator.relocate(self, set.forwardings());
        }

        let stats = self.relocator.counters().snapshot();
        self.logger.log(GcEvent::Relocated {
            pages: stats.pages,
            in_place: stats.in_place,
            relocated_bytes: stats.relocated_bytes,
            contention: stats.contention,
        });
        Ok(stats)
    }

    /// Stop collecting for good.
    ///
    /// Published forwarding entries stay valid. Pages not yet relocated are
    /// left in place, and mutators waiting on them are released.
    pub fn abort(&self) {
        if self.aborted.swap(true, Ordering::AcqRel) {
            return;
        }

        for forwarding in self.relocation_set.read().forwardings() {
            forwarding.abort_page();
        }
        self.logger.log(GcEvent::Aborted {
            cycle: self.cycle(),
        });
    }
}

impl PageSource for Heap {
    fn alloc_page(&self, page_type: PageType, size: usize) -> Result<Arc<Page>> {
        let page = self.page_allocator.alloc_page(page_type, size)?;
        self.page_table.insert(&page);
        Ok(page)
    }

    fn undo_alloc_page(&self, page: Arc<Page>) {
        drop(self.page_table.remove(&page));
        self.page_allocator.undo_alloc_page(page);
    }
}

/// Page source for mutator relocation: failure is silent and ends in
/// waiting for the worker instead.
struct RelocationPages<'a>(&'a Heap);

impl PageSource for RelocationPages<'_> {
    fn alloc_page(&self, page_type: PageType, size: usize) -> Result<Arc<Page>> {
        let heap = self.0;
        let page = heap
            .page_allocator
            .try_alloc_page(page_type, size)
            .ok_or_else(|| HeapError::OutOfMemory {
                requested: size,
                available: heap.page_allocator.unused(),
            })?;
        heap.page_table.insert(&page);
        Ok(page)
    }

    fn undo_alloc_page(&self, page: Arc<Page>) {
        self.0.undo_alloc_page(page);
    }
}
