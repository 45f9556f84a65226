//! Platform backings for the multi-mapped heap.
//!
//! Two strategy objects are chosen once at start-up by [`platform`]:
//!
//! - an [`AddressReserver`] that reserves inaccessible address ranges for
//!   each heap view, and
//! - a [`Backing`] that owns the physical memory, addressed by a physical
//!   offset in `[0, max_capacity)`, and maps it into the reserved views.
//!
//! ```text
//!   physical offset space           view reservations
//!  +------+------+------+          marked0  [ page A | page B |   ]
//!  | seg0 | seg1 | seg2 |  map --> marked1  [ page A | page B |   ]
//!  +------+------+------+          remapped [ page A | page B |   ]
//! ```
//!
//! `map` and `unmap` failures after start-up are fatal to the caller: a view
//! that no longer aliases the others cannot be repaired.

#[cfg(target_vendor = "apple")]
mod macos;
#[cfg(all(unix, not(target_vendor = "apple")))]
mod posix;
#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

use crate::address::AddressLayout;
use crate::config::HeapConfig;
use crate::error::Result;
use crate::globals::GRANULE_SIZE;
use crate::heap::memory_manager::{MemoryCallbacks, NoCallbacks};
use crate::util::{os_page_size, Alignment};
use std::io;
use std::sync::Arc;

/// Physical memory provider.
pub trait Backing: Send + Sync {
    /// Short name for logging
    fn name(&self) -> &'static str;

    /// Commit `[offset, offset + length)` completely, or fail without
    /// committing anything.
    fn commit_inner(&self, offset: usize, length: usize) -> bool;

    /// Release `[offset, offset + length)` back to the OS.
    fn uncommit_inner(&self, offset: usize, length: usize) -> bool;

    /// Commit as much of the range as possible, returning the number of bytes
    /// committed from `offset` onwards.
    ///
    /// The whole range is tried first. On failure the remaining span is
    /// halved (granule aligned): a successful half is kept and the search
    /// continues above it, a failed half is excluded. Stops once the span
    /// drops below one granule.
    fn commit(&self, offset: usize, length: usize) -> usize {
        if self.commit_inner(offset, length) {
            return length;
        }

        let mut start = offset;
        let mut end = offset + length;
        loop {
            let half = Alignment::align_down_to_granule((end - start) / 2);
            if half < GRANULE_SIZE {
                return start - offset;
            }

            if self.commit_inner(start, half) {
                start += half;
            } else {
                end -= half;
            }
        }
    }

    /// Uncommit the range, returning the number of bytes uncommitted.
    fn uncommit(&self, offset: usize, length: usize) -> usize {
        if self.uncommit_inner(offset, length) {
            length
        } else {
            log::error!(
                "Failed to uncommit {:#x}..{:#x} ({})",
                offset,
                offset + length,
                self.name()
            );
            0
        }
    }

    /// Map `size` bytes of physical memory at `offset` to virtual `addr`.
    fn map(&self, addr: usize, size: usize, offset: usize) -> io::Result<()>;

    /// Remove the mapping at `addr`, keeping the address range reserved.
    fn unmap(&self, addr: usize, size: usize) -> io::Result<()>;

    /// Stride used when pretouching mapped memory.
    fn pretouch_granularity(&self) -> usize {
        os_page_size()
    }
}

/// Address range reservation for the heap views.
pub trait AddressReserver: Send + Sync {
    /// Reserve `[addr, addr + size)` exactly at `addr`. Returns false when
    /// that range is unavailable; nothing stays reserved in that case.
    fn reserve(&self, addr: usize, size: usize) -> bool;

    /// Release a range previously reserved with [`AddressReserver::reserve`].
    fn unreserve(&self, addr: usize, size: usize);

    /// Free-list hooks for the virtual memory manager.
    fn callbacks(&self, _layout: AddressLayout) -> Box<dyn MemoryCallbacks> {
        Box::new(NoCallbacks)
    }
}

/// The strategy pair for one heap.
#[derive(Clone)]
pub struct Platform {
    pub backing: Arc<dyn Backing>,
    pub reserver: Arc<dyn AddressReserver>,
}

/// Select the backing for the current OS.
pub fn platform(config: &HeapConfig) -> Result<Platform> {
    #[cfg(all(unix, not(target_vendor = "apple")))]
    {
        posix::platform(config)
    }
    #[cfg(target_vendor = "apple")]
    {
        macos::platform(config)
    }
    #[cfg(windows)]
    {
        windows::platform(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::BTreeSet;

    /// Succeeds only for granules outside `failing`.
    struct Patchy {
        failing: BTreeSet<usize>,
        attempts: Mutex<Vec<(usize, usize)>>,
    }

    impl Backing for Patchy {
        fn name(&self) -> &'static str {
            "patchy"
        }

        fn commit_inner(&self, offset: usize, length: usize) -> bool {
            self.attempts.lock().push((offset, length));
            (offset..offset + length)
                .step_by(GRANULE_SIZE)
                .all(|o| !self.failing.contains(&(o / GRANULE_SIZE)))
        }

        fn uncommit_inner(&self, _offset: usize, _length: usize) -> bool {
            true
        }

        fn map(&self, _addr: usize, _size: usize, _offset: usize) -> io::Result<()> {
            Ok(())
        }

        fn unmap(&self, _addr: usize, _size: usize) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_commit_whole_range_first() {
        let backing = Patchy {
            failing: BTreeSet::new(),
            attempts: Mutex::new(Vec::new()),
        };
        assert_eq!(backing.commit(0, 8 * GRANULE_SIZE), 8 * GRANULE_SIZE);
        assert_eq!(backing.attempts.lock().len(), 1);
    }

    #[test]
    fn test_commit_partial_prefix() {
        // Granule 5 fails: the committed prefix is granules 0..5.
        let backing = Patchy {
            failing: [5].into_iter().collect(),
            attempts: Mutex::new(Vec::new()),
        };
        let committed = backing.commit(0, 8 * GRANULE_SIZE);
        assert_eq!(committed, 5 * GRANULE_SIZE);
    }

    #[test]
    fn test_commit_nothing_when_first_granule_fails() {
        let backing = Patchy {
            failing: [0].into_iter().collect(),
            attempts: Mutex::new(Vec::new()),
        };
        assert_eq!(backing.commit(0, 4 * GRANULE_SIZE), 0);
    }
}
