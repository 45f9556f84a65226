//! # zheap - Concurrent Relocating Heap Substrate
//!
//! zheap is the memory engine of a ZGC-style collector: a region based heap
//! addressed through colored pointers, with concurrent relocation of
//! fragmented regions.
//!
//! ## Overview
//!
//! - **Colored Pointers**: Metadata bits above the heap offset select one of
//!   three virtual views (marked0, marked1, remapped) of the same memory
//! - **Multi-Mapping**: Every committed granule is mapped at all three views
//! - **Pages**: Small, medium and large regions with bump allocation and a
//!   per-cycle live map
//! - **Relocation Set Selection**: Pages are picked by how much garbage they
//!   hold, through a pluggable [`SelectionPolicy`]
//! - **Forwarding**: Lock-free per-page tables that let workers and mutators
//!   race to relocate the same object
//!
//! Marking and reference processing are supplied by the embedding runtime,
//! see [`collaborator`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use zheap::{Collaborators, GarbageCollector, GcCause, Heap, HeapConfig, NoMarking, SizeHeader};
//!
//! fn main() -> zheap::Result<()> {
//!     let config = HeapConfig::from_env();
//!     let collaborators = Collaborators::new(Arc::new(NoMarking), Arc::new(SizeHeader));
//!     let heap = Arc::new(Heap::new(config, collaborators)?);
//!     let gc = GarbageCollector::new(Arc::clone(&heap));
//!
//!     let ptr = gc.alloc_object(64)?;
//!     unsafe { *ptr.as_mut_ptr::<usize>() = 64 };
//!
//!     let cycle = gc.collect(GcCause::Explicit)?;
//!     println!("reclaimed {} bytes", cycle.reclaimed);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ GarbageCollector         phase sequencing, statistics    │
//! ├──────────────────────────────────────────────────────────┤
//! │ Heap                     phases, barrier slow paths      │
//! │  ├─ ObjectAllocator      shared small/medium pages       │
//! │  ├─ RelocationSetSelector / Relocator / ForwardingTable  │
//! │  ├─ PageTable            offset -> page                  │
//! │  └─ PageAllocator        capacity, page cache, uncommit  │
//! │      ├─ VirtualMemoryManager   offset ranges             │
//! │      └─ PhysicalMemoryManager  granule backing, views    │
//! ├──────────────────────────────────────────────────────────┤
//! │ backing                  memfd / shm / file mapping, AWE │
//! └──────────────────────────────────────────────────────────┘
//! ```

#[cfg(not(target_pointer_width = "64"))]
compile_error!("zheap requires a 64-bit target");

#[macro_use]
pub mod error;

pub mod address;
pub mod backing;
pub mod collaborator;
pub mod config;
pub mod gc;
pub mod globals;
pub mod heap;
pub mod logging;
pub mod relocate;
pub mod stats;
pub mod util;
pub mod workers;

pub use address::{AddressSpace, ColoredPointer, Offset, View};
pub use collaborator::{
    Collaborators, MarkingCollaborator, NoMarking, NoReferences, ObjectModel,
    ReferenceCollaborator, SizeHeader,
};
pub use config::HeapConfig;
pub use error::{HeapError, Result};
pub use gc::{GarbageCollector, GcCause};
pub use globals::{PageType, Phase};
pub use heap::{Heap, Page};
pub use logging::{GcEvent, GcLogger};
pub use relocate::{FragmentationPolicy, SelectionPolicy};
pub use stats::{CycleStats, GcStats};

/// zheap version string from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
