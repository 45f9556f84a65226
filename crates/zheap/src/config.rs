//! Configuration Module - Heap Parameters
//!
//! Capacities, worker count, relocation policy knobs, uncommit and logging.
//! All capacities are in bytes and must be granule multiples.

use crate::globals::{GRANULE_SIZE, MB};
use crate::logging::{GcLoggerConfig, LogLevel};
use crate::util::Alignment;
use std::time::Duration;

/// Main configuration for a heap
///
/// # Examples
///
/// ```rust
/// use zheap::HeapConfig;
///
/// let config = HeapConfig {
///     max_heap_size: 256 * 1024 * 1024,
///     gc_threads: Some(2),
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct HeapConfig {
    /// Maximum heap size in bytes
    ///
    /// Hard limit for committed memory. Also sizes the object space
    /// (16x this value per view) and the medium page size.
    /// Default: 1GB
    pub max_heap_size: usize,

    /// Minimum heap size in bytes
    ///
    /// Uncommit never shrinks capacity below this.
    /// Default: 16MB
    pub min_heap_size: usize,

    /// Initial heap size in bytes
    ///
    /// Committed at start-up and placed in the page cache.
    /// Default: 16MB
    pub initial_heap_size: usize,

    /// Relocation worker threads
    ///
    /// None = a quarter of the CPUs, at least one.
    pub gc_threads: Option<usize>,

    /// Fragmentation limit, percent
    ///
    /// A page is a relocation candidate when its garbage exceeds this share
    /// of the page size, and a larger relocation set is only chosen when it
    /// reclaims more than this share of the extra pages it adds.
    /// Default: 25.0
    pub fragmentation_limit: f64,

    /// Empty pages collected before they are freed in one batch
    ///
    /// Default: 64
    pub empty_page_batch: usize,

    /// Return unused cached memory to the OS
    ///
    /// Disabled automatically when min == max or the OS cannot uncommit.
    /// Default: true
    pub uncommit: bool,

    /// Minimum time a cached page stays unused before it is uncommitted
    ///
    /// Default: 300s
    pub uncommit_delay: Duration,

    /// Touch every OS page of newly committed memory
    ///
    /// Default: false
    pub always_pretouch: bool,

    /// Back the heap with large/huge pages
    ///
    /// Linux uses hugetlb memfd; Windows uses AWE with a shared section.
    /// Default: false
    pub large_pages: bool,

    /// Minimum level of GC events forwarded to the `log` facade
    ///
    /// Default: Info
    pub log_level: LogLevel,

    /// Emit GC events as JSON
    ///
    /// Default: false
    pub json_logs: bool,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            max_heap_size: DEFAULT_MAX_HEAP,
            min_heap_size: DEFAULT_MIN_HEAP,
            initial_heap_size: DEFAULT_MIN_HEAP,
            gc_threads: None,
            fragmentation_limit: 25.0,
            empty_page_batch: 64,
            uncommit: true,
            uncommit_delay: Duration::from_secs(300),
            always_pretouch: false,
            large_pages: false,
            log_level: LogLevel::Info,
            json_logs: false,
        }
    }
}

impl HeapConfig {
    /// Validate configuration
    ///
    /// Returns an error if any parameter is outside its valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_heap_size < GRANULE_SIZE {
            return Err(ConfigError::InvalidHeapSize(format!(
                "max_heap_size must be at least {} bytes",
                GRANULE_SIZE
            )));
        }

        for (name, size) in [
            ("max_heap_size", self.max_heap_size),
            ("min_heap_size", self.min_heap_size),
            ("initial_heap_size", self.initial_heap_size),
        ] {
            if !Alignment::is_granule_aligned(size) {
                return Err(ConfigError::InvalidHeapSize(format!(
                    "{} must be a multiple of {} bytes",
                    name, GRANULE_SIZE
                )));
            }
        }

        if self.min_heap_size > self.max_heap_size {
            return Err(ConfigError::InvalidHeapSize(
                "min_heap_size cannot exceed max_heap_size".to_string(),
            ));
        }

        if self.initial_heap_size < self.min_heap_size
            || self.initial_heap_size > self.max_heap_size
        {
            return Err(ConfigError::InvalidHeapSize(
                "initial_heap_size must be between min and max heap size".to_string(),
            ));
        }

        if !(0.0..=100.0).contains(&self.fragmentation_limit) {
            return Err(ConfigError::InvalidThreshold(
                "fragmentation_limit must be between 0 and 100".to_string(),
            ));
        }

        if self.empty_page_batch == 0 {
            return Err(ConfigError::InvalidThreshold(
                "empty_page_batch must be > 0".to_string(),
            ));
        }

        if self.gc_threads == Some(0) {
            return Err(ConfigError::InvalidGcThreads(
                "gc_threads must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Number of relocation workers
    pub fn workers(&self) -> usize {
        self.gc_threads
            .unwrap_or_else(|| (num_cpus::get() / 4).max(1))
    }

    /// Logger configuration derived from this config
    pub fn logger_config(&self) -> GcLoggerConfig {
        GcLoggerConfig {
            level: self.log_level,
            json: self.json_logs,
            ..Default::default()
        }
    }

    /// Create config from environment variables
    ///
    /// Sizes accept `K`, `M` and `G` suffixes. Unparseable values are
    /// ignored and the default is kept.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(size) = env_size("ZHEAP_MAX_HEAP") {
            config.max_heap_size = size;
            config.min_heap_size = config.min_heap_size.min(size);
            config.initial_heap_size = config.initial_heap_size.min(size);
        }

        if let Some(size) = env_size("ZHEAP_MIN_HEAP") {
            config.min_heap_size = size;
            config.initial_heap_size = config.initial_heap_size.max(size);
        }

        if let Some(size) = env_size("ZHEAP_INITIAL_HEAP") {
            config.initial_heap_size = size;
        }

        if let Ok(val) = std::env::var("ZHEAP_GC_THREADS") {
            if let Ok(threads) = val.parse::<usize>() {
                config.gc_threads = Some(threads);
            }
        }

        if let Ok(val) = std::env::var("ZHEAP_FRAGMENTATION_LIMIT") {
            if let Ok(limit) = val.parse::<f64>() {
                config.fragmentation_limit = limit;
            }
        }

        if let Ok(val) = std::env::var("ZHEAP_EMPTY_PAGE_BATCH") {
            if let Ok(batch) = val.parse::<usize>() {
                config.empty_page_batch = batch;
            }
        }

        if let Ok(val) = std::env::var("ZHEAP_UNCOMMIT") {
            config.uncommit = parse_bool(&val);
        }

        if let Ok(val) = std::env::var("ZHEAP_UNCOMMIT_DELAY_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                config.uncommit_delay = Duration::from_secs(secs);
            }
        }

        if let Ok(val) = std::env::var("ZHEAP_PRETOUCH") {
            config.always_pretouch = parse_bool(&val);
        }

        if let Ok(val) = std::env::var("ZHEAP_LARGE_PAGES") {
            config.large_pages = parse_bool(&val);
        }

        if let Ok(val) = std::env::var("ZHEAP_LOG_LEVEL") {
            if let Ok(level) = val.parse::<LogLevel>() {
                config.log_level = level;
            }
        }

        if let Ok(val) = std::env::var("ZHEAP_LOG_JSON") {
            config.json_logs = parse_bool(&val);
        }

        config
    }
}

/// Error types for configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid heap size: {0}")]
    InvalidHeapSize(String),

    #[error("Invalid threshold: {0}")]
    InvalidThreshold(String),

    #[error("Invalid GC threads: {0}")]
    InvalidGcThreads(String),
}

// ============================================================================
// CONSTANTS & HELPERS
// ============================================================================

const DEFAULT_MAX_HEAP: usize = 1024 * MB;
const DEFAULT_MIN_HEAP: usize = 16 * MB;

fn parse_bool(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

fn env_size(name: &str) -> Option<usize> {
    std::env::var(name).ok().and_then(|val| parse_size(&val))
}

/// Parse a byte size such as `4096`, `64K`, `256M` or `2G`.
pub fn parse_size(value: &str) -> Option<usize> {
    let value = value.trim();
    let (digits, shift) = match value.chars().last()? {
        'k' | 'K' => (&value[..value.len() - 1], 10),
        'm' | 'M' => (&value[..value.len() - 1], 20),
        'g' | 'G' => (&value[..value.len() - 1], 30),
        _ => (value, 0),
    };
    digits.parse::<usize>().ok()?.checked_mul(1usize << shift)
}
