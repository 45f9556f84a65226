//! Relocate Module - Concurrent Object Relocation
//!
//! Live objects of the pages in the relocation set are copied to fresh
//! pages while mutators keep running. Workers and mutators race on the
//! same [`Forwarding`] entries; whoever publishes first wins and the loser
//! throws its copy away.
//!
//! ## Worker Flow (per page)
//!
//! 1. Walk the live objects in address order
//! 2. Skip objects a mutator already relocated
//! 3. Copy into the worker's target page for the size class, publish
//! 4. Target full -> allocate a new target page
//! 5. No page available -> claim the page and compact it in place
//! 6. Release the page; free it unless it was compacted in place
//!
//! ## Mutator Flow (barrier slow path)
//!
//! ```text
//!   find entry ──found──────────────────────────────> to
//!       │
//!   retain page ──ok──> copy to shared page, insert ─> to
//!       │                      │ no memory
//!       │               wait for release ──aborted──> in place (from)
//!       ▼                      ▼
//!   (released)  ────────> find entry ───────────────> to
//! ```

pub mod forwarding;
pub mod forwarding_table;
pub mod relocation_set;
pub mod selector;

pub use forwarding::{Forwarding, ForwardingEntry};
pub use forwarding_table::ForwardingTable;
pub use relocation_set::RelocationSet;
pub use selector::{
    Cutoff, FragmentationPolicy, GroupInfo, RelocationSetSelector, SelectionPolicy,
    SelectorGroupStats, SelectorStats,
};

use crate::address::Offset;
use crate::collaborator::ObjectModel;
use crate::globals::PageType;
use crate::heap::page::Page;
use crate::heap::Heap;
use crate::stats::RelocationCounters;
use crate::util::fatal;
use crate::util::memory::{copy_memory, copy_memory_overlapping};
use crate::workers::{WorkCursor, Workers};
use std::sync::Arc;

/// Per-worker target pages
#[derive(Default)]
struct Targets {
    small: Option<Arc<Page>>,
    medium: Option<Arc<Page>>,
}

impl Targets {
    fn get(&self, page_type: PageType) -> Option<&Arc<Page>> {
        match page_type {
            PageType::Small => self.small.as_ref(),
            PageType::Medium => self.medium.as_ref(),
            PageType::Large => None,
        }
    }

    fn set(&mut self, page_type: PageType, page: Arc<Page>) {
        match page_type {
            PageType::Small => self.small = Some(page),
            PageType::Medium => self.medium = Some(page),
            PageType::Large => debug_assert!(false, "large pages are never relocated"),
        }
    }
}

/// Relocator - copies live objects out of the relocation set
pub struct Relocator {
    object_model: Arc<dyn ObjectModel>,
    workers: Workers,
    counters: RelocationCounters,
}

impl Relocator {
    pub fn new(object_model: Arc<dyn ObjectModel>, workers: Workers) -> Self {
        Self {
            object_model,
            workers,
            counters: RelocationCounters::new(),
        }
    }

    pub fn counters(&self) -> &RelocationCounters {
        &self.counters
    }

    pub fn workers(&self) -> Workers {
        self.workers
    }

    /// Size of the object at machine address `addr`.
    pub fn object_size(&self, addr: usize) -> usize {
        self.object_model.object_size(addr)
    }

    /// Relocate every page of the set using all workers.
    pub fn relocate(&self, heap: &Heap, forwardings: &[Arc<Forwarding>]) {
        let cursor = WorkCursor::new(forwardings.len());

        self.workers.run("Relocate", |_| {
            let mut targets = Targets::default();
            while let Some(index) = cursor.claim() {
                self.relocate_page(heap, &forwardings[index], &mut targets);
            }
        });
    }

    fn relocate_page(&self, heap: &Heap, forwarding: &Forwarding, targets: &mut Targets) {
        if heap.is_aborted() {
            forwarding.abort_page();
            return;
        }

        let Some(page) = forwarding.page() else {
            return;
        };
        let page_type = forwarding.page_type();
        let mut in_place = false;

        page.for_each_live_object(|from| {
            while !self.relocate_object_to(heap, forwarding, from, targets.get(page_type)) {
                if in_place {
                    fatal("in-place relocation ran out of space");
                }

                if let Some(target) = heap.alloc_relocation_page(page_type) {
                    targets.set(page_type, target);
                    continue;
                }

                // No memory for a new target: compact the page into itself.
                forwarding.claim_page();
                page.reset_for_in_place_relocation();
                forwarding.set_in_place();
                targets.set(page_type, Arc::clone(&page));
                in_place = true;
            }
        });

        forwarding.release_page();

        if in_place {
            log::trace!("Relocated page {} in place", page.start());
            self.counters.page_done(true, 0);
        } else if let Some(detached) = forwarding.detach_page() {
            let size = detached.size();
            heap.free_page(detached);
            self.counters.page_done(false, size);
        }
    }

    /// Worker copy of one object into `target`.
    ///
    /// Returns false when the object needs a target page with more room.
    fn relocate_object_to(
        &self,
        heap: &Heap,
        forwarding: &Forwarding,
        from: Offset,
        target: Option<&Arc<Page>>,
    ) -> bool {
        let from_index = forwarding.index_of(from);
        let mut cursor = 0;
        if forwarding.find(from_index, &mut cursor).populated() {
            return true;
        }

        let Some(target) = target else {
            return false;
        };

        let from_addr = heap.object_address(from);
        let size = self.object_model.object_size(from_addr);
        let Some(to) = target.alloc_object(size) else {
            return false;
        };

        if to != from {
            let to_addr = heap.object_address(to);
            // SAFETY: both ranges are mapped; the target slot is private to
            // this worker until published.
            unsafe {
                if forwarding.in_place() && to + size > from {
                    copy_memory_overlapping(from_addr, to_addr, size);
                } else {
                    copy_memory(from_addr, to_addr, size);
                }
            }
        }

        if forwarding.insert(from_index, to, &mut cursor) == to {
            self.counters.object_relocated(size);
        } else {
            target.undo_alloc_object(to, size);
            self.counters.contended();
        }
        true
    }

    /// Mutator relocation of the object at `from`, returning its new offset.
    pub fn relocate_object(&self, heap: &Heap, forwarding: &Forwarding, from: Offset) -> Offset {
        let from_index = forwarding.index_of(from);
        let mut cursor = 0;
        let entry = forwarding.find(from_index, &mut cursor);
        if entry.populated() {
            return entry.to_offset();
        }

        if forwarding.retain_page() {
            let to = self.relocate_object_inner(heap, forwarding, from, &mut cursor);
            forwarding.release_page();

            if let Some(to) = to {
                return to;
            }

            // Out of memory. Let the worker finish the page; if relocation
            // is aborted first, the object stays where it is.
            if !forwarding.wait_page_released() {
                return forwarding.insert(from_index, from, &mut cursor);
            }
        }

        Self::forward_object(forwarding, from)
    }

    fn relocate_object_inner(
        &self,
        heap: &Heap,
        forwarding: &Forwarding,
        from: Offset,
        cursor: &mut usize,
    ) -> Option<Offset> {
        let from_addr = heap.object_address(from);
        let size = self.object_model.object_size(from_addr);
        let to = heap.alloc_object_for_relocation(size)?;

        // SAFETY: `from` is live on a retained page and `to` is a fresh
        // allocation nobody else can see yet.
        unsafe { copy_memory(from_addr, heap.object_address(to), size) };

        let winner = forwarding.insert(forwarding.index_of(from), to, cursor);
        if winner == to {
            self.counters.object_relocated(size);
        } else {
            heap.undo_alloc_object_for_relocation(to, size);
            self.counters.contended();
        }
        Some(winner)
    }

    /// Offset of an object whose page is done relocating.
    pub fn forward_object(forwarding: &Forwarding, from: Offset) -> Offset {
        match forwarding.forwarded(from) {
            Some(to) => to,
            None => {
                debug_assert!(forwarding.is_aborted(), "object {} not forwarded", from);
                from
            },
        }
    }
}
