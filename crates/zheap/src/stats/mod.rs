//! Stats Module - Collector Statistics
//!
//! Per-cycle records and totals across cycles:
//! - Phase durations, in execution order
//! - Relocation counters (pages, in-place pages, bytes, contention)
//! - Relocation set selection per page group
//! - Heap occupancy before and after the cycle

pub mod timer;

pub use timer::{GcTimer, PhaseTimings};

use crate::relocate::selector::SelectorStats;
use crate::util::AtomicUtils;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Counters updated by relocation workers and mutators during one
/// relocation phase.
#[derive(Debug, Default)]
pub struct RelocationCounters {
    pages: AtomicUsize,
    in_place: AtomicUsize,
    freed: AtomicUsize,
    objects: AtomicUsize,
    bytes: AtomicUsize,
    contention: AtomicUsize,
}

impl RelocationCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self) {
        self.pages.store(0, Ordering::Relaxed);
        self.in_place.store(0, Ordering::Relaxed);
        self.freed.store(0, Ordering::Relaxed);
        self.objects.store(0, Ordering::Relaxed);
        self.bytes.store(0, Ordering::Relaxed);
        self.contention.store(0, Ordering::Relaxed);
    }

    /// A page was fully relocated.
    pub fn page_done(&self, in_place: bool, freed_bytes: usize) {
        self.pages.fetch_add(1, Ordering::Relaxed);
        if in_place {
            self.in_place.fetch_add(1, Ordering::Relaxed);
        }
        self.freed.fetch_add(freed_bytes, Ordering::Relaxed);
    }

    pub fn object_relocated(&self, size: usize) {
        self.objects.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(size, Ordering::Relaxed);
    }

    /// Another thread relocated the object first; the copy was thrown away.
    pub fn contended(&self) {
        self.contention.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RelocationStats {
        RelocationStats {
            pages: self.pages.load(Ordering::Relaxed),
            in_place: self.in_place.load(Ordering::Relaxed),
            freed_bytes: self.freed.load(Ordering::Relaxed),
            relocated_objects: self.objects.load(Ordering::Relaxed),
            relocated_bytes: self.bytes.load(Ordering::Relaxed),
            contention: self.contention.load(Ordering::Relaxed),
        }
    }
}

/// Relocation outcome of one cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelocationStats {
    pub pages: usize,
    pub in_place: usize,
    pub freed_bytes: usize,
    pub relocated_objects: usize,
    pub relocated_bytes: usize,
    pub contention: usize,
}

/// Everything recorded about one collection cycle
#[derive(Debug, Clone, Default)]
pub struct CycleStats {
    pub cycle: u64,
    pub cause: String,
    pub phases: PhaseTimings,
    pub selector: SelectorStats,
    pub relocation: RelocationStats,
    pub used_before: usize,
    pub used_after: usize,
    pub reclaimed: usize,
    pub aborted: bool,
}

impl CycleStats {
    pub fn new(cycle: u64, cause: impl Into<String>) -> Self {
        Self {
            cycle,
            cause: cause.into(),
            ..Default::default()
        }
    }

    /// Sum of all phase durations
    pub fn duration(&self) -> Duration {
        self.phases.total()
    }
}

/// Totals across all cycles
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GcSummary {
    pub cycles: u64,
    pub aborted_cycles: u64,
    pub reclaimed_bytes: usize,
    pub relocated_bytes: usize,
    pub peak_used: usize,
}

/// GcStats - cycle history and totals
pub struct GcStats {
    history: RwLock<Vec<CycleStats>>,
    max_history: usize,
    cycles: AtomicU64,
    aborted_cycles: AtomicU64,
    reclaimed: AtomicUsize,
    relocated: AtomicUsize,
    peak_used: AtomicUsize,
}

impl GcStats {
    pub fn new(max_history: usize) -> Self {
        Self {
            history: RwLock::new(Vec::with_capacity(max_history)),
            max_history,
            cycles: AtomicU64::new(0),
            aborted_cycles: AtomicU64::new(0),
            reclaimed: AtomicUsize::new(0),
            relocated: AtomicUsize::new(0),
            peak_used: AtomicUsize::new(0),
        }
    }

    pub fn record_cycle(&self, stats: CycleStats) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        if stats.aborted {
            self.aborted_cycles.fetch_add(1, Ordering::Relaxed);
        }
        self.reclaimed.fetch_add(stats.reclaimed, Ordering::Relaxed);
        self.relocated
            .fetch_add(stats.relocation.relocated_bytes, Ordering::Relaxed);
        AtomicUtils::fetch_max(&self.peak_used, stats.used_before.max(stats.used_after));

        let mut history = self.history.write();
        if self.max_history == 0 {
            return;
        }
        if history.len() >= self.max_history {
            history.remove(0);
        }
        history.push(stats);
    }

    /// Most recent cycle, if any
    pub fn last_cycle(&self) -> Option<CycleStats> {
        self.history.read().last().cloned()
    }

    /// Recorded cycles, oldest first
    pub fn history(&self) -> Vec<CycleStats> {
        self.history.read().clone()
    }

    pub fn summary(&self) -> GcSummary {
        GcSummary {
            cycles: self.cycles.load(Ordering::Relaxed),
            aborted_cycles: self.aborted_cycles.load(Ordering::Relaxed),
            reclaimed_bytes: self.reclaimed.load(Ordering::Relaxed),
            relocated_bytes: self.relocated.load(Ordering::Relaxed),
            peak_used: self.peak_used.load(Ordering::Relaxed),
        }
    }
}

impl Default for GcStats {
    fn default() -> Self {
        Self::new(16)
    }
}
