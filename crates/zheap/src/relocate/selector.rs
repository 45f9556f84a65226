//! Relocation Set Selector
//!
//! After marking, every relocatable page is registered either as empty (no
//! live bytes) or as live. Empty pages are freed in batches as they come
//! in. Live pages are grouped by size class; within the small and medium
//! groups a [`SelectionPolicy`] decides which pages are candidates, in what
//! order they are considered and how many of them are relocated.
//!
//! Large pages hold a single object and are never relocated.
//!
//! ## Default Policy
//!
//! A page is a candidate when its garbage exceeds `fragmentation_limit`
//! percent of the page size. Candidates are semi-sorted by live bytes into
//! 2048 buckets, sparsest first. The set then grows one page at a time,
//! and a larger set is accepted only when the extra pages it frees,
//! relative to the extra pages it adds, beat the same limit.

use crate::globals::{PageGeometry, PageType};
use crate::heap::page::Page;
use crate::relocate::forwarding::Forwarding;
use serde::Serialize;
use std::sync::Arc;

const PARTITIONS_SHIFT: u32 = 11;
const PARTITIONS: usize = 1 << PARTITIONS_SHIFT;

/// Size class parameters of one selector group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupInfo {
    pub page_type: PageType,
    pub page_size: usize,
    pub object_size_limit: usize,
}

/// Outcome of a selection: the first `from` candidates are relocated and
/// are expected to fit in `to` pages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cutoff {
    pub from: usize,
    pub to: usize,
}

/// Replaceable relocation heuristic.
pub trait SelectionPolicy: Send + Sync {
    /// Whether a live page should be considered for relocation.
    fn is_candidate(&self, group: &GroupInfo, page: &Page) -> bool;

    /// Order candidates, the most profitable to relocate first.
    fn sort(&self, group: &GroupInfo, pages: Vec<Arc<Page>>) -> Vec<Arc<Page>>;

    /// How many of the sorted candidates to relocate.
    fn cutoff(&self, group: &GroupInfo, pages: &[Arc<Page>]) -> Cutoff;
}

/// FragmentationPolicy - garbage threshold plus live-bytes semi-sort
#[derive(Debug, Clone, Copy)]
pub struct FragmentationPolicy {
    limit: f64,
}

impl FragmentationPolicy {
    /// `limit` in percent, 0 to 100.
    pub fn new(limit: f64) -> Self {
        Self { limit }
    }

    pub fn limit(&self) -> f64 {
        self.limit
    }
}

impl SelectionPolicy for FragmentationPolicy {
    fn is_candidate(&self, group: &GroupInfo, page: &Page) -> bool {
        let garbage = page.size() - page.live_bytes();
        garbage as f64 > group.page_size as f64 * self.limit / 100.0
    }

    fn sort(&self, group: &GroupInfo, pages: Vec<Arc<Page>>) -> Vec<Arc<Page>> {
        let partition_size = (group.page_size >> PARTITIONS_SHIFT).max(1);
        let partition_shift = partition_size.trailing_zeros();
        let partition = |page: &Page| (page.live_bytes() >> partition_shift).min(PARTITIONS - 1);

        let mut fingers = vec![0usize; PARTITIONS];
        for page in &pages {
            fingers[partition(page)] += 1;
        }

        let mut finger = 0;
        for slot in fingers.iter_mut() {
            let count = *slot;
            *slot = finger;
            finger += count;
        }

        let mut sorted: Vec<Option<Arc<Page>>> = vec![None; pages.len()];
        for page in pages {
            let index = partition(&page);
            sorted[fingers[index]] = Some(page);
            fingers[index] += 1;
        }
        sorted.into_iter().flatten().collect()
    }

    fn cutoff(&self, group: &GroupInfo, pages: &[Arc<Page>]) -> Cutoff {
        let capacity = (group.page_size - group.object_size_limit) as f64;
        let mut selected = Cutoff::default();
        let mut from_live_bytes = 0;

        for (index, page) in pages.iter().enumerate() {
            let from = index + 1;
            from_live_bytes += page.live_bytes();

            // Pages the candidates are guaranteed to fit in, whatever the
            // order of relocation.
            let to = (from_live_bytes as f64 / capacity).ceil() as usize;

            let diff_from = from - selected.from;
            let diff_to = to - selected.to;
            let diff_reclaimable = 100.0 - diff_to as f64 * 100.0 / diff_from as f64;
            let accept = diff_reclaimable > self.limit;
            if accept {
                selected = Cutoff { from, to };
            }

            log::trace!(
                "Candidate Relocation Set ({} Pages): {}->{}, {:.1}% relative defragmentation, {}",
                group.page_type,
                from,
                to,
                diff_reclaimable,
                if accept { "Selected" } else { "Rejected" }
            );
        }

        selected
    }
}

/// Per-group selection statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SelectorGroupStats {
    pub npages: usize,
    pub total: usize,
    pub live: usize,
    pub garbage: usize,
    pub empty: usize,
    pub candidates: usize,
    pub selected: usize,
    pub compacting_from: usize,
    pub compacting_to: usize,
}

/// Statistics of one selection, by size class
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SelectorStats {
    pub small: SelectorGroupStats,
    pub medium: SelectorGroupStats,
    pub large: SelectorGroupStats,
}

impl SelectorStats {
    pub fn group(&self, page_type: PageType) -> &SelectorGroupStats {
        match page_type {
            PageType::Small => &self.small,
            PageType::Medium => &self.medium,
            PageType::Large => &self.large,
        }
    }
}

struct SelectorGroup {
    info: GroupInfo,
    enabled: bool,
    selectable: bool,
    live_pages: Vec<Arc<Page>>,
    forwarding_entries: usize,
    stats: SelectorGroupStats,
}

impl SelectorGroup {
    fn new(info: GroupInfo, enabled: bool, selectable: bool) -> Self {
        Self {
            info,
            enabled,
            selectable,
            live_pages: Vec::new(),
            forwarding_entries: 0,
            stats: SelectorGroupStats::default(),
        }
    }

    fn register_live_page(&mut self, policy: &dyn SelectionPolicy, page: Arc<Page>) {
        let size = page.size();
        let live = page.live_bytes();
        let garbage = size - live;

        self.stats.npages += 1;
        self.stats.total += size;
        self.stats.live += live;
        self.stats.garbage += garbage;

        if self.selectable && policy.is_candidate(&self.info, &page) {
            self.live_pages.push(page);
        }
    }

    fn register_empty_page(&mut self, page: &Page) {
        let size = page.size();
        self.stats.npages += 1;
        self.stats.total += size;
        self.stats.empty += size;
        self.stats.garbage += size;
    }

    fn select(&mut self, policy: &dyn SelectionPolicy) {
        self.stats.candidates = self.live_pages.len();
        if !self.enabled || !self.selectable {
            self.live_pages.clear();
            return;
        }

        let sorted = policy.sort(&self.info, std::mem::take(&mut self.live_pages));
        let cutoff = policy.cutoff(&self.info, &sorted);
        self.live_pages = sorted;
        self.live_pages.truncate(cutoff.from);

        self.forwarding_entries = self
            .live_pages
            .iter()
            .map(|page| Forwarding::capacity_for(page.live_objects() as usize))
            .sum();

        self.stats.selected = cutoff.from;
        self.stats.compacting_from = cutoff.from * self.info.page_size;
        self.stats.compacting_to = cutoff.to * self.info.page_size;

        log::trace!(
            "Relocation Set ({} Pages): {}->{}, {} skipped, {} forwarding entries",
            self.info.page_type,
            cutoff.from,
            cutoff.to,
            self.stats.candidates - cutoff.from,
            self.forwarding_entries
        );
    }
}

/// RelocationSetSelector - classifies pages after marking
pub struct RelocationSetSelector {
    policy: Arc<dyn SelectionPolicy>,
    small: SelectorGroup,
    medium: SelectorGroup,
    large: SelectorGroup,
    empty_pages: Vec<Arc<Page>>,
}

impl RelocationSetSelector {
    pub fn new(geometry: &PageGeometry, policy: Arc<dyn SelectionPolicy>) -> Self {
        Self {
            policy,
            small: SelectorGroup::new(
                GroupInfo {
                    page_type: PageType::Small,
                    page_size: geometry.small_page_size(),
                    object_size_limit: geometry.small_object_limit(),
                },
                true,
                true,
            ),
            medium: SelectorGroup::new(
                GroupInfo {
                    page_type: PageType::Medium,
                    page_size: geometry.medium_page_size(),
                    object_size_limit: geometry.medium_object_limit(),
                },
                geometry.medium_enabled(),
                true,
            ),
            large: SelectorGroup::new(
                GroupInfo {
                    page_type: PageType::Large,
                    page_size: 0,
                    object_size_limit: 0,
                },
                true,
                false,
            ),
            empty_pages: Vec::new(),
        }
    }

    fn group(&mut self, page_type: PageType) -> &mut SelectorGroup {
        match page_type {
            PageType::Small => &mut self.small,
            PageType::Medium => &mut self.medium,
            PageType::Large => &mut self.large,
        }
    }

    /// Register a relocatable page with live objects.
    pub fn register_live_page(&mut self, page: Arc<Page>) {
        let policy = Arc::clone(&self.policy);
        self.group(page.page_type())
            .register_live_page(policy.as_ref(), page);
    }

    /// Register a relocatable page without live objects.
    pub fn register_empty_page(&mut self, page: Arc<Page>) {
        self.group(page.page_type()).register_empty_page(&page);
        self.empty_pages.push(page);
    }

    /// True once at least `bulk` empty pages are waiting to be freed.
    pub fn should_free_empty_pages(&self, bulk: usize) -> bool {
        !self.empty_pages.is_empty() && self.empty_pages.len() >= bulk
    }

    pub fn empty_pages(&self) -> &[Arc<Page>] {
        &self.empty_pages
    }

    pub fn clear_empty_pages(&mut self) {
        self.empty_pages.clear();
    }

    /// Hand over the empty pages collected so far.
    pub fn take_empty_pages(&mut self) -> Vec<Arc<Page>> {
        std::mem::take(&mut self.empty_pages)
    }

    /// Decide the relocation set of each group.
    pub fn select(&mut self) {
        let policy = Arc::clone(&self.policy);
        self.large.select(policy.as_ref());
        self.medium.select(policy.as_ref());
        self.small.select(policy.as_ref());
    }

    pub fn small(&self) -> &[Arc<Page>] {
        &self.small.live_pages
    }

    pub fn medium(&self) -> &[Arc<Page>] {
        &self.medium.live_pages
    }

    /// Selected pages, medium first.
    pub fn selected(&self) -> Vec<Arc<Page>> {
        self.medium
            .live_pages
            .iter()
            .chain(self.small.live_pages.iter())
            .cloned()
            .collect()
    }

    /// Forwarding table slots needed by the selected pages.
    pub fn forwarding_entries(&self) -> usize {
        self.small.forwarding_entries + self.medium.forwarding_entries
    }

    pub fn stats(&self) -> SelectorStats {
        SelectorStats {
            small: self.small.stats,
            medium: self.medium.stats,
            large: self.large.stats,
        }
    }
}
