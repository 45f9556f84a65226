//! Object Allocator
//!
//! Small and medium objects are bump allocated from one shared page per
//! size class. Large objects get a page of their own, rounded up to whole
//! granules.
//!
//! ## Allocation Flow
//!
//! 1. Pick the size class for the object size
//! 2. Large -> dedicated page, object at the page start
//! 3. Small/medium -> atomic bump in the shared page
//! 4. Shared page full -> allocate a fresh page and install it
//!
//! At mark start the shared pages are retired so objects allocated during
//! the cycle land on pages carrying the new sequence number.

use crate::address::Offset;
use crate::error::{HeapError, Result};
use crate::globals::{PageGeometry, PageType, GRANULE_SIZE};
use crate::heap::page::Page;
use crate::util::Alignment;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Where the object allocator gets its pages from.
pub trait PageSource {
    /// Allocate and publish a page.
    fn alloc_page(&self, page_type: PageType, size: usize) -> Result<Arc<Page>>;

    /// Unpublish and free a page nothing was allocated in.
    fn undo_alloc_page(&self, page: Arc<Page>);
}

/// ObjectAllocator - shared allocation pages per size class
pub struct ObjectAllocator {
    geometry: PageGeometry,
    shared_small: Mutex<Option<Arc<Page>>>,
    shared_medium: Mutex<Option<Arc<Page>>>,
    allocated: AtomicUsize,
    undone: AtomicUsize,
}

impl ObjectAllocator {
    pub fn new(geometry: PageGeometry) -> Self {
        Self {
            geometry,
            shared_small: Mutex::new(None),
            shared_medium: Mutex::new(None),
            allocated: AtomicUsize::new(0),
            undone: AtomicUsize::new(0),
        }
    }

    /// Allocate `size` bytes, returning the object offset.
    pub fn alloc_object(&self, source: &impl PageSource, size: usize) -> Result<Offset> {
        ensure!(
            size > 0,
            HeapError::InvalidArgument("object size must be positive".to_string())
        );

        let offset = match self.geometry.type_for_object(size) {
            PageType::Small => self.alloc_object_in_shared_page(
                source,
                &self.shared_small,
                PageType::Small,
                self.geometry.small_page_size(),
                size,
            ),
            PageType::Medium => self.alloc_object_in_shared_page(
                source,
                &self.shared_medium,
                PageType::Medium,
                self.geometry.medium_page_size(),
                size,
            ),
            PageType::Large => self.alloc_large_object(source, size),
        }?;

        self.allocated.fetch_add(size, Ordering::Relaxed);
        Ok(offset)
    }

    fn alloc_large_object(&self, source: &impl PageSource, size: usize) -> Result<Offset> {
        let page_size =
            Alignment::checked_align_up(size, GRANULE_SIZE).ok_or(HeapError::OutOfMemory {
                requested: size,
                available: 0,
            })?;
        let page = source.alloc_page(PageType::Large, page_size)?;
        page.alloc_object(size).ok_or(HeapError::OutOfMemory {
            requested: size,
            available: page.remaining(),
        })
    }

    fn alloc_object_in_shared_page(
        &self,
        source: &impl PageSource,
        slot: &Mutex<Option<Arc<Page>>>,
        page_type: PageType,
        page_size: usize,
        size: usize,
    ) -> Result<Offset> {
        let mut shared = slot.lock();
        if let Some(offset) = shared.as_ref().and_then(|page| page.alloc_object_atomic(size)) {
            return Ok(offset);
        }

        let page = source.alloc_page(page_type, page_size)?;
        let offset = page
            .alloc_object_atomic(size)
            .ok_or(HeapError::OutOfMemory {
                requested: size,
                available: page.remaining(),
            })?;
        *shared = Some(page);
        Ok(offset)
    }

    /// Take back the most recent allocation of `size` bytes at `offset`.
    ///
    /// A large object takes its page with it. For shared pages this only
    /// succeeds when nothing was allocated after the object.
    pub fn undo_alloc_object(
        &self,
        source: &impl PageSource,
        page: Arc<Page>,
        offset: Offset,
        size: usize,
    ) -> bool {
        let undone = if page.page_type() == PageType::Large {
            debug_assert_eq!(page.start(), offset);
            source.undo_alloc_page(page);
            true
        } else {
            page.undo_alloc_object_atomic(offset, size)
        };

        if undone {
            self.undone.fetch_add(size, Ordering::Relaxed);
        }
        undone
    }

    /// Stop allocating in the current shared pages.
    pub fn retire_pages(&self) {
        *self.shared_small.lock() = None;
        *self.shared_medium.lock() = None;
    }

    /// Bytes handed out, minus undone allocations
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed) - self.undone.load(Ordering::Relaxed)
    }

    /// Free bytes in the shared small page
    pub fn remaining(&self) -> usize {
        self.shared_small
            .lock()
            .as_ref()
            .map_or(0, |page| page.remaining())
    }
}
