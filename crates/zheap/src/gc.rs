//! GC Core Module - Collection Cycle Driver
//!
//! Runs one complete cycle through the heap phases:
//!
//! ```text
//!  Pause Mark Start          flip to marked, new sequence number
//!  Concurrent Mark           marking collaborator, from roots
//!  Pause Mark End            repeated with more marking until drained
//!  Concurrent Process Non-Strong References
//!  Concurrent Reset Relocation Set
//!  Concurrent Select Relocation Set
//!  Pause Relocate Start      flip to remapped
//!  Concurrent Relocate       worker pool
//! ```
//!
//! Pauses are where the embedding runtime stops its mutators; this driver
//! only sequences the phases and records how long each one took.

use crate::address::ColoredPointer;
use crate::error::{HeapError, Result};
use crate::heap::Heap;
use crate::logging::GcEvent;
use crate::stats::{CycleStats, GcStats, GcTimer};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Reason for starting a cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GcCause {
    /// Explicit request
    Explicit,
    /// An allocation of `size` bytes failed
    AllocationFailure { size: usize },
    /// Heap usage crossed a threshold
    HeapThreshold { used: usize, threshold: usize },
    /// Periodic timer
    Timer,
}

impl fmt::Display for GcCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GcCause::Explicit => f.write_str("Explicit"),
            GcCause::AllocationFailure { size } => write!(f, "Allocation Failure ({}B)", size),
            GcCause::HeapThreshold { used, threshold } => {
                write!(f, "Heap Threshold ({}M > {}M)", used >> 20, threshold >> 20)
            },
            GcCause::Timer => f.write_str("Timer"),
        }
    }
}

/// GarbageCollector - drives collection cycles of one heap
pub struct GarbageCollector {
    heap: Arc<Heap>,
    stats: Arc<GcStats>,
    cycle_lock: Mutex<()>,
    collecting: AtomicBool,
}

impl GarbageCollector {
    pub fn new(heap: Arc<Heap>) -> Self {
        Self {
            heap,
            stats: Arc::new(GcStats::default()),
            cycle_lock: Mutex::new(()),
            collecting: AtomicBool::new(false),
        }
    }

    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    pub fn stats(&self) -> Arc<GcStats> {
        Arc::clone(&self.stats)
    }

    pub fn is_collecting(&self) -> bool {
        self.collecting.load(Ordering::Acquire)
    }

    /// Run one full cycle. Cycles are serialized.
    pub fn collect(&self, cause: GcCause) -> Result<CycleStats> {
        let _cycle = self.cycle_lock.lock();
        self.collecting.store(true, Ordering::Release);

        let mut record = CycleStats::new(self.heap.cycle() + 1, cause.to_string());
        record.used_before = self.heap.used();
        let timer = GcTimer::new();

        self.heap.logger().log(GcEvent::CycleStart {
            cycle: record.cycle,
            cause: record.cause.clone(),
        });

        let result = self.run_cycle(&mut record);
        self.collecting.store(false, Ordering::Release);

        if let Err(err) = result {
            if matches!(err, HeapError::Aborted) {
                record.aborted = true;
                self.stats.record_cycle(record);
            }
            return Err(err);
        }

        record.used_after = self.heap.used();
        record.reclaimed = self.heap.page_allocator().stats().reclaimed;

        let logger = self.heap.logger();
        logger.log(GcEvent::CycleEnd {
            cycle: record.cycle,
            duration_ms: timer.elapsed_ms(),
            reclaimed_bytes: record.reclaimed,
        });
        logger.log(GcEvent::HeapStats {
            used_bytes: record.used_after,
            capacity_bytes: self.heap.capacity(),
            max_capacity_bytes: self.heap.max_capacity(),
        });

        self.stats.record_cycle(record.clone());
        Ok(record)
    }

    fn run_cycle(&self, record: &mut CycleStats) -> Result<()> {
        let heap = &self.heap;

        self.pause(record, "Pause Mark Start", || heap.mark_start())?;
        self.concurrent(record, "Concurrent Mark", || heap.mark(true))?;
        while !self.pause(record, "Pause Mark End", || heap.mark_end())? {
            self.concurrent(record, "Concurrent Mark Continue", || heap.mark(false))?;
        }

        self.concurrent(record, "Concurrent Process Non-Strong References", || {
            heap.process_non_strong_references()
        })?;
        self.concurrent(record, "Concurrent Reset Relocation Set", || {
            heap.reset_relocation_set()
        })?;
        self.concurrent(record, "Concurrent Select Relocation Set", || {
            heap.select_relocation_set()
        })?;
        record.selector = heap.selector_stats();

        self.pause(record, "Pause Relocate Start", || heap.relocate_start())?;
        record.relocation = self.concurrent(record, "Concurrent Relocate", || heap.relocate())?;

        // Pages left behind by an abort are still published and usable.
        ensure!(!heap.is_aborted(), HeapError::Aborted);
        Ok(())
    }

    fn pause<T>(
        &self,
        record: &mut CycleStats,
        phase: &'static str,
        f: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        let timer = GcTimer::new();
        let result = f();
        record.phases.record(phase, timer.elapsed());
        self.heap.logger().log(GcEvent::Pause {
            phase: phase.to_string(),
            duration_us: timer.elapsed_us(),
        });
        result
    }

    fn concurrent<T>(
        &self,
        record: &mut CycleStats,
        phase: &'static str,
        f: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        let logger = self.heap.logger();
        logger.log(GcEvent::PhaseStart {
            phase: phase.to_string(),
            cycle: record.cycle,
        });

        let timer = GcTimer::new();
        let result = f();
        record.phases.record(phase, timer.elapsed());

        logger.log(GcEvent::PhaseEnd {
            phase: phase.to_string(),
            duration_ms: timer.elapsed_ms(),
            cycle: record.cycle,
        });
        result
    }

    /// Allocate, collecting once and retrying when the heap is full.
    pub fn alloc_object(&self, size: usize) -> Result<ColoredPointer> {
        match self.heap.alloc_object(size) {
            Err(err) if err.is_recoverable() => {
                log::debug!("Allocation of {} bytes failed, collecting: {}", size, err);
                self.collect(GcCause::AllocationFailure { size })?;
                self.heap.alloc_object(size)
            },
            result => result,
        }
    }

    /// Stop collecting; the current cycle, if any, fails with `Aborted`.
    pub fn abort(&self) {
        self.heap.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::globals::MB;

    #[test]
    fn test_cause_display() {
        assert_eq!(GcCause::Explicit.to_string(), "Explicit");
        assert_eq!(
            GcCause::AllocationFailure { size: 4096 }.to_string(),
            "Allocation Failure (4096B)"
        );
        assert_eq!(
            GcCause::HeapThreshold {
                used: 96 * MB,
                threshold: 64 * MB
            }
            .to_string(),
            "Heap Threshold (96M > 64M)"
        );
    }
}
