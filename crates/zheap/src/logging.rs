//! GC Logging
//!
//! Structured events for heap initialization and collection cycles.
//! Events are forwarded to the `log` facade under the `zheap::gc` target,
//! either as human-readable lines or as JSON, and can be kept in memory for
//! inspection.
//!
//! Log Levels:
//! - ERROR: allocation failures
//! - WARN: degraded address space, lowered capacity, aborted cycles
//! - INFO: initialization, cycle start/end, heap summaries
//! - DEBUG: phases and pauses
//! - TRACE: relocation set and relocation details

use crate::globals::PageType;
use parking_lot::Mutex;
use serde::Serialize;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

const TARGET: &str = "zheap::gc";

/// Log level for GC events
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    fn as_log_level(self) -> log::Level {
        match self {
            LogLevel::Error => log::Level::Error,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Trace => log::Level::Trace,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

/// GC event types
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GcEvent {
    /// Address space reserved at initialization
    AddressSpace {
        contiguous: bool,
        complete: bool,
        reserved_bytes: usize,
        views: usize,
    },

    /// Initial heap capacities
    HeapInitialized {
        min_capacity: usize,
        initial_capacity: usize,
        max_capacity: usize,
        medium_page_size: usize,
        uncommit: bool,
    },

    /// Collection cycle started
    CycleStart { cycle: u64, cause: String },

    /// Phase started
    PhaseStart { phase: String, cycle: u64 },

    /// Phase completed
    PhaseEnd {
        phase: String,
        duration_ms: f64,
        cycle: u64,
    },

    /// Pause (safepoint operation) completed
    Pause { phase: String, duration_us: u64 },

    /// Relocation set selected for one page group
    RelocationSet {
        group: PageType,
        candidates: usize,
        selected: usize,
        empty_bytes: usize,
        compacting_from: usize,
        compacting_to: usize,
    },

    /// Relocation completed
    Relocated {
        pages: usize,
        in_place: usize,
        relocated_bytes: usize,
        contention: usize,
    },

    /// Collection cycle completed
    CycleEnd {
        cycle: u64,
        duration_ms: f64,
        reclaimed_bytes: usize,
    },

    /// Heap occupancy
    HeapStats {
        used_bytes: usize,
        capacity_bytes: usize,
        max_capacity_bytes: usize,
    },

    /// Memory returned to the OS
    Uncommit { bytes: usize },

    /// Commit failure forced a lower max capacity
    CapacityLowered { old_max: usize, new_max: usize },

    /// Page allocation failure
    AllocationFailure { size: usize, used_bytes: usize },

    /// Cycle aborted
    Aborted { cycle: u64 },
}

/// GC Logger configuration
#[derive(Debug, Clone)]
pub struct GcLoggerConfig {
    /// Minimum log level
    pub level: LogLevel,

    /// Emit JSON instead of text
    pub json: bool,

    /// Keep emitted events in memory
    pub record: bool,

    /// Prefix text lines with a wall-clock timestamp
    pub timestamps: bool,
}

impl Default for GcLoggerConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            json: false,
            record: true,
            timestamps: true,
        }
    }
}

/// GC Logger - per-heap event sink
pub struct GcLogger {
    config: GcLoggerConfig,
    events: Mutex<Vec<(Instant, GcEvent)>>,
    enabled: AtomicBool,
}

impl GcLogger {
    pub fn new(config: GcLoggerConfig) -> Self {
        Self {
            config,
            events: Mutex::new(Vec::new()),
            enabled: AtomicBool::new(true),
        }
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Log a GC event
    pub fn log(&self, event: GcEvent) {
        if !self.is_enabled() {
            return;
        }

        let level = Self::event_level(&event);
        if level > self.config.level {
            return;
        }

        let log_level = level.as_log_level();
        if log::log_enabled!(target: TARGET, log_level) {
            let line = if self.config.json {
                Self::format_json(&event)
            } else {
                Self::format_human(&event)
            };
            if self.config.timestamps && !self.config.json {
                let now = chrono::Local::now();
                log::log!(target: TARGET, log_level, "[{}] {}", now.format("%Y-%m-%d %H:%M:%S%.3f"), line);
            } else {
                log::log!(target: TARGET, log_level, "{}", line);
            }
        }

        if self.config.record {
            self.events.lock().push((Instant::now(), event));
        }
    }

    /// Recorded events, oldest first
    pub fn events(&self) -> Vec<GcEvent> {
        self.events.lock().iter().map(|(_, e)| e.clone()).collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    fn event_level(event: &GcEvent) -> LogLevel {
        match event {
            GcEvent::AllocationFailure { .. } => LogLevel::Error,
            GcEvent::CapacityLowered { .. } | GcEvent::Aborted { .. } => LogLevel::Warn,
            GcEvent::AddressSpace { complete, .. } if !complete => LogLevel::Warn,
            GcEvent::AddressSpace { .. }
            | GcEvent::HeapInitialized { .. }
            | GcEvent::CycleStart { .. }
            | GcEvent::CycleEnd { .. }
            | GcEvent::HeapStats { .. }
            | GcEvent::Uncommit { .. } => LogLevel::Info,
            GcEvent::PhaseStart { .. } | GcEvent::PhaseEnd { .. } | GcEvent::Pause { .. } => {
                LogLevel::Debug
            },
            GcEvent::RelocationSet { .. } | GcEvent::Relocated { .. } => LogLevel::Trace,
        }
    }

    fn format_json(event: &GcEvent) -> String {
        serde_json::to_string(event).unwrap_or_else(|e| format!("{{\"error\":\"{}\"}}", e))
    }

    fn format_human(event: &GcEvent) -> String {
        match event {
            GcEvent::AddressSpace {
                contiguous,
                complete,
                reserved_bytes,
                views,
            } => format!(
                "Address Space Type: {}/{}, Size: {}M x {} = {}M",
                if *contiguous { "Contiguous" } else { "Discontiguous" },
                if *complete { "Complete" } else { "Degraded" },
                reserved_bytes >> 20,
                views,
                (reserved_bytes * views) >> 20
            ),
            GcEvent::HeapInitialized {
                min_capacity,
                initial_capacity,
                max_capacity,
                medium_page_size,
                uncommit,
            } => format!(
                "Min Capacity: {}M, Initial Capacity: {}M, Max Capacity: {}M, Medium Page Size: {}M, Uncommit: {}",
                min_capacity >> 20,
                initial_capacity >> 20,
                max_capacity >> 20,
                medium_page_size >> 20,
                if *uncommit { "Enabled" } else { "Disabled" }
            ),
            GcEvent::CycleStart { cycle, cause } => {
                format!("GC({}) Garbage Collection ({})", cycle, cause)
            },
            GcEvent::PhaseStart { phase, cycle } => format!("GC({}) {}", cycle, phase),
            GcEvent::PhaseEnd {
                phase,
                duration_ms,
                cycle,
            } => format!("GC({}) {} {:.3}ms", cycle, phase, duration_ms),
            GcEvent::Pause { phase, duration_us } => {
                format!("{} pause: {} us", phase, duration_us)
            },
            GcEvent::RelocationSet {
                group,
                candidates,
                selected,
                empty_bytes,
                compacting_from,
                compacting_to,
            } => format!(
                "{} Pages: {} candidates, {} selected, {}M empty, {}M -> {}M compacted",
                group,
                candidates,
                selected,
                empty_bytes >> 20,
                compacting_from >> 20,
                compacting_to >> 20
            ),
            GcEvent::Relocated {
                pages,
                in_place,
                relocated_bytes,
                contention,
            } => format!(
                "Relocated {} pages ({} in-place), {} bytes, {} contended objects",
                pages, in_place, relocated_bytes, contention
            ),
            GcEvent::CycleEnd {
                cycle,
                duration_ms,
                reclaimed_bytes,
            } => format!(
                "GC({}) completed {:.3}ms, reclaimed {}M",
                cycle,
                duration_ms,
                reclaimed_bytes >> 20
            ),
            GcEvent::HeapStats {
                used_bytes,
                capacity_bytes,
                max_capacity_bytes,
            } => format!(
                "Heap: {}M used, {}M capacity, {}M max",
                used_bytes >> 20,
                capacity_bytes >> 20,
                max_capacity_bytes >> 20
            ),
            GcEvent::Uncommit { bytes } => format!("Uncommitted: {}M", bytes >> 20),
            GcEvent::CapacityLowered { old_max, new_max } => format!(
                "Forced to lower max heap size from {}M to {}M",
                old_max >> 20,
                new_max >> 20
            ),
            GcEvent::AllocationFailure { size, used_bytes } => format!(
                "Allocation failure: {} bytes (heap used: {})",
                size, used_bytes
            ),
            GcEvent::Aborted { cycle } => format!("GC({}) aborted", cycle),
        }
    }
}

impl Default for GcLogger {
    fn default() -> Self {
        Self::new(GcLoggerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_are_recorded() {
        let logger = GcLogger::default();
        logger.log(GcEvent::CycleStart {
            cycle: 1,
            cause: "test".into(),
        });
        logger.log(GcEvent::Uncommit { bytes: 2 << 20 });

        let events = logger.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], GcEvent::Uncommit { bytes: 2 << 20 });
    }

    #[test]
    fn test_level_filter_drops_verbose_events() {
        let logger = GcLogger::new(GcLoggerConfig {
            level: LogLevel::Info,
            ..Default::default()
        });
        logger.log(GcEvent::Pause {
            phase: "Pause Mark Start".into(),
            duration_us: 10,
        });
        assert!(logger.events().is_empty());
    }

    #[test]
    fn test_disabled_logger_records_nothing() {
        let logger = GcLogger::default();
        logger.disable();
        logger.log(GcEvent::Aborted { cycle: 3 });
        assert!(logger.events().is_empty());
        logger.enable();
        logger.log(GcEvent::Aborted { cycle: 3 });
        assert_eq!(logger.events().len(), 1);
    }

    #[test]
    fn test_json_format_is_tagged() {
        let json = GcLogger::format_json(&GcEvent::Uncommit { bytes: 4096 });
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "uncommit");
        assert_eq!(value["bytes"], 4096);
    }

    #[test]
    fn test_log_level_parse() {
        assert_eq!("DEBUG".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert!("loud".parse::<LogLevel>().is_err());
    }
}
