//! GC Timer - Timing Utilities
//!
//! Wall-clock timing of phases and pauses.

use indexmap::IndexMap;
use std::time::{Duration, Instant};

/// GcTimer - timer for measuring GC operations
#[derive(Debug, Clone, Copy)]
pub struct GcTimer {
    start: Instant,
}

impl GcTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn elapsed_us(&self) -> u64 {
        self.elapsed().as_micros() as u64
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed().as_secs_f64() * 1000.0
    }
}

impl Default for GcTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Duration per phase name, in the order the phases first ran.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhaseTimings {
    phases: IndexMap<&'static str, Duration>,
}

impl PhaseTimings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `duration` to `phase`. A phase that runs repeatedly accumulates.
    pub fn record(&mut self, phase: &'static str, duration: Duration) {
        *self.phases.entry(phase).or_default() += duration;
    }

    pub fn get(&self, phase: &str) -> Option<Duration> {
        self.phases.get(phase).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, Duration)> + '_ {
        self.phases.iter().map(|(name, duration)| (*name, *duration))
    }

    pub fn total(&self) -> Duration {
        self.phases.values().sum()
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }
}
