//! Error Module - zheap Error Types
//!
//! Defines the error types returned by heap operations.
//!
//! # Error Categories
//!
//! ## Memory Errors
//! - `OutOfMemory` - capacity exhausted or commit shortfall
//!
//! ## Initialization Errors
//! - `AddressSpaceReservation` - the multi-view address space could not be reserved
//! - `Backing` - the platform backing could not be created
//! - `Configuration` - invalid configuration
//!
//! ## Phase Errors
//! - `InvalidPhase` - a phase transition was requested out of order
//! - `Aborted` - the collector was aborted
//!
//! Failures of mapping operations after a successful reservation are not
//! represented here; they are fatal (see [`crate::util::fatal`]).

use crate::config::ConfigError;
use crate::globals::Phase;
use thiserror::Error;

/// Main error type for all heap operations
///
/// # Examples
///
/// ```rust
/// use zheap::error::HeapError;
///
/// fn handle_error(err: HeapError) {
///     match err {
///         HeapError::OutOfMemory { requested, available } => {
///             eprintln!("OOM: requested {}, available {}", requested, available);
///         }
///         _ if err.is_bug() => panic!("collector bug: {}", err),
///         _ => eprintln!("Other error: {}", err),
///     }
/// }
/// ```
#[derive(Debug, Error)]
pub enum HeapError {
    /// Out of memory
    ///
    /// **When returned:** A page allocation would exceed the max capacity, or
    /// the backing could only commit part of the requested memory.
    ///
    /// **Recovery strategy:** Run a collection cycle and retry, or surface an
    /// allocation failure to the caller.
    #[error("Out of memory: requested {requested} bytes, available {available} bytes")]
    OutOfMemory { requested: usize, available: usize },

    /// Address space reservation failed
    ///
    /// **When returned:** Start-up could not reserve enough of the multi-view
    /// address space for the max heap size.
    ///
    /// **Recovery strategy:** Cannot recover - lower the max heap size.
    #[error("Failed to reserve address space: {0}")]
    AddressSpaceReservation(String),

    /// Platform backing could not be created
    ///
    /// **When returned:** The backing file, section or page-frame array could
    /// not be set up at start-up.
    ///
    /// **Recovery strategy:** Cannot recover - check OS limits and privileges.
    #[error("Backing initialization failed: {0}")]
    Backing(String),

    /// Invalid configuration
    ///
    /// **When returned:** `HeapConfig::validate` rejected the configuration.
    ///
    /// **Recovery strategy:** Fix the configuration.
    #[error("Invalid configuration: {0}")]
    Configuration(#[from] ConfigError),

    /// Phase transition requested in the wrong phase
    ///
    /// **When returned:** A heap entry point that is only valid in `expected`
    /// was called while the heap is in `actual`.
    ///
    /// **Recovery strategy:** None - this is a driver bug.
    #[error("Invalid phase: expected {expected}, actual {actual}")]
    InvalidPhase { expected: Phase, actual: Phase },

    /// Invalid argument
    ///
    /// **When returned:** A size or offset argument is out of range.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The collector was aborted
    ///
    /// **When returned:** A phase entry point was called after `Heap::abort`.
    #[error("Collector aborted")]
    Aborted,
}

impl HeapError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(self, HeapError::OutOfMemory { .. })
    }

    /// Check if this error indicates a bug in the caller or the collector
    pub fn is_bug(&self) -> bool {
        matches!(
            self,
            HeapError::InvalidPhase { .. } | HeapError::InvalidArgument(_)
        )
    }
}

/// Result type alias for heap operations
pub type Result<T> = std::result::Result<T, HeapError>;

/// Return early with an error unless the condition holds
macro_rules! ensure {
    ($cond:expr, $err:expr) => {
        if !$cond {
            return Err($err);
        }
    };
}
