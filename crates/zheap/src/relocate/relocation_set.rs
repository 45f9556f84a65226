//! Relocation Set
//!
//! The forwardings of the pages chosen for relocation in one cycle. All of
//! them carve their hash tables out of a single arena allocated when the
//! set is installed.
//!
//! The set owns the forwardings; the [`ForwardingTable`] only points at
//! them. After relocation the set is kept for remapping until the next
//! cycle resets it, at which point the forwardings are unpublished and
//! dropped once no pinned reader can still see them.

use crate::relocate::forwarding::Forwarding;
use crate::relocate::forwarding_table::ForwardingTable;
use crate::heap::page::Page;
use crossbeam::epoch;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

/// RelocationSet - forwardings of one cycle
#[derive(Default)]
pub struct RelocationSet {
    forwardings: Vec<Arc<Forwarding>>,
    arena_len: usize,
}

impl RelocationSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a forwarding per page and publish it in `table`.
    ///
    /// `entries` is the arena size, the sum of the per-page capacities.
    pub fn install(&mut self, pages: &[Arc<Page>], entries: usize, table: &ForwardingTable) {
        debug_assert!(self.forwardings.is_empty(), "relocation set not reset");

        let arena: Arc<[AtomicU64]> = (0..entries).map(|_| AtomicU64::new(0)).collect();
        let mut base = 0;

        for page in pages {
            let capacity = Forwarding::capacity_for(page.live_objects() as usize);
            let forwarding = Arc::new(Forwarding::new(
                Arc::clone(page),
                Arc::clone(&arena),
                base,
                capacity,
            ));
            base += capacity;

            table.insert(&forwarding);
            self.forwardings.push(forwarding);
        }

        debug_assert_eq!(base, entries, "forwarding entries mismatch");
        self.arena_len = entries;
    }

    pub fn forwardings(&self) -> &[Arc<Forwarding>] {
        &self.forwardings
    }

    pub fn len(&self) -> usize {
        self.forwardings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forwardings.is_empty()
    }

    /// Arena slots of the installed set.
    pub fn entries(&self) -> usize {
        self.arena_len
    }

    /// Unpublish every forwarding and release them through the epoch.
    pub fn reset(&mut self, table: &ForwardingTable) {
        if self.forwardings.is_empty() {
            return;
        }

        let forwardings = std::mem::take(&mut self.forwardings);
        for forwarding in &forwardings {
            table.remove(forwarding);
        }
        self.arena_len = 0;

        let guard = epoch::pin();
        guard.defer(move || drop(forwardings));
    }
}
