//! File descriptor backing for Linux and the other non-Apple Unixes.
//!
//! Physical memory is an anonymous shared memory file sized to the max
//! capacity. Committing allocates blocks in the file, and every view maps
//! the same file offset with `MAP_SHARED | MAP_FIXED`, so all views alias
//! the same pages.

use super::unix::{unmap_to_reserved, PosixReserver};
use super::{Backing, Platform};
use crate::config::HeapConfig;
use crate::error::{HeapError, Result};
use crate::globals::GRANULE_SIZE;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Arc;

pub(super) fn platform(config: &HeapConfig) -> Result<Platform> {
    let backing = FileBacking::new(config.max_heap_size, config.large_pages)?;
    log::info!(
        "Heap Backing: {} ({}M)",
        backing.name(),
        config.max_heap_size >> 20
    );
    Ok(Platform {
        backing: Arc::new(backing),
        reserver: Arc::new(PosixReserver),
    })
}

/// FileBacking - shared memory file mapped into every view
pub struct FileBacking {
    fd: OwnedFd,
    size: usize,
    large_pages: bool,
}

impl FileBacking {
    pub fn new(size: usize, large_pages: bool) -> Result<Self> {
        let fd = create_fd(large_pages)
            .map_err(|e| HeapError::Backing(format!("failed to create backing file: {}", e)))?;

        // SAFETY: fd is a valid, owned descriptor.
        if unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) } != 0 {
            return Err(HeapError::Backing(format!(
                "failed to truncate backing file to {} bytes: {}",
                size,
                io::Error::last_os_error()
            )));
        }

        Ok(Self {
            fd,
            size,
            large_pages,
        })
    }

    fn check_range(&self, offset: usize, length: usize) -> io::Result<()> {
        match offset.checked_add(length) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "range {:#x}+{:#x} outside backing file of {:#x} bytes",
                    offset, length, self.size
                ),
            )),
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn create_fd(large_pages: bool) -> io::Result<OwnedFd> {
    let mut flags = libc::MFD_CLOEXEC;
    if large_pages {
        flags |= libc::MFD_HUGETLB;
    }
    // SAFETY: the name is a valid C string.
    let fd = unsafe { libc::memfd_create(c"zheap".as_ptr(), flags) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fd was just created and is owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn create_fd(_large_pages: bool) -> io::Result<OwnedFd> {
    use std::ffi::CString;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let name = format!(
        "/zheap.{}.{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    );
    let name = CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    // SAFETY: name is a valid C string.
    let fd = unsafe {
        libc::shm_open(
            name.as_ptr(),
            libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
            0o600 as libc::mode_t,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // The object lives on through the descriptor.
    unsafe { libc::shm_unlink(name.as_ptr()) };
    // SAFETY: fd was just created and is owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn fallocate(fd: &OwnedFd, punch_hole: bool, offset: usize, length: usize) -> io::Result<()> {
    let mode = if punch_hole {
        libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE
    } else {
        0
    };
    // SAFETY: fd is valid; the range lies within the file.
    let res = unsafe {
        libc::fallocate(
            fd.as_raw_fd(),
            mode,
            offset as libc::off_t,
            length as libc::off_t,
        )
    };
    if res == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

impl Backing for FileBacking {
    fn name(&self) -> &'static str {
        if self.large_pages {
            "shared memory file (large pages)"
        } else {
            "shared memory file"
        }
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn commit_inner(&self, offset: usize, length: usize) -> bool {
        if let Err(e) = self.check_range(offset, length) {
            log::debug!("Failed to commit: {}", e);
            return false;
        }
        match fallocate(&self.fd, false, offset, length) {
            Ok(()) => true,
            // Filesystem without fallocate: pages are allocated on first touch.
            Err(e) if e.raw_os_error() == Some(libc::EOPNOTSUPP) => true,
            Err(e) => {
                log::debug!(
                    "Failed to commit {:#x}..{:#x}: {}",
                    offset,
                    offset + length,
                    e
                );
                false
            },
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn commit_inner(&self, _offset: usize, _length: usize) -> bool {
        true
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn uncommit_inner(&self, offset: usize, length: usize) -> bool {
        self.check_range(offset, length).is_ok()
            && fallocate(&self.fd, true, offset, length).is_ok()
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn uncommit_inner(&self, _offset: usize, _length: usize) -> bool {
        false
    }

    fn map(&self, addr: usize, size: usize, offset: usize) -> io::Result<()> {
        self.check_range(offset, size)?;
        // SAFETY: addr lies in a view reservation owned by the heap.
        let res = unsafe {
            libc::mmap(
                addr as *mut libc::c_void,
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_FIXED | libc::MAP_SHARED,
                self.fd.as_raw_fd(),
                offset as libc::off_t,
            )
        };
        if res == libc::MAP_FAILED {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    fn unmap(&self, addr: usize, size: usize) -> io::Result<()> {
        unmap_to_reserved(addr, size)
    }

    fn pretouch_granularity(&self) -> usize {
        if self.large_pages {
            GRANULE_SIZE
        } else {
            crate::util::os_page_size()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::unix::{munmap, reserve_anon};
    use crate::backing::AddressReserver;

    #[test]
    fn test_two_mappings_alias() {
        let backing = FileBacking::new(4 * GRANULE_SIZE, false).unwrap();
        assert_eq!(backing.commit(0, 2 * GRANULE_SIZE), 2 * GRANULE_SIZE);

        let a = reserve_anon(0, GRANULE_SIZE).unwrap();
        let b = reserve_anon(0, GRANULE_SIZE).unwrap();
        backing.map(a, GRANULE_SIZE, GRANULE_SIZE).unwrap();
        backing.map(b, GRANULE_SIZE, GRANULE_SIZE).unwrap();

        unsafe {
            *(a as *mut u64).add(7) = 0xfeed;
            assert_eq!(*(b as *const u64).add(7), 0xfeed);
        }

        backing.unmap(a, GRANULE_SIZE).unwrap();
        backing.unmap(b, GRANULE_SIZE).unwrap();
        PosixReserver.unreserve(a, GRANULE_SIZE);
        munmap(b, GRANULE_SIZE).unwrap();
    }

    #[test]
    fn test_map_outside_file_is_rejected() {
        let backing = FileBacking::new(2 * GRANULE_SIZE, false).unwrap();
        let addr = reserve_anon(0, GRANULE_SIZE).unwrap();

        let err = backing.map(addr, GRANULE_SIZE, 2 * GRANULE_SIZE).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(backing.map(addr, GRANULE_SIZE, usize::MAX).is_err());

        munmap(addr, GRANULE_SIZE).unwrap();
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn test_commit_outside_file_fails() {
        let backing = FileBacking::new(2 * GRANULE_SIZE, false).unwrap();
        assert_eq!(backing.commit(GRANULE_SIZE, GRANULE_SIZE), GRANULE_SIZE);
        assert_eq!(backing.commit(2 * GRANULE_SIZE, 2 * GRANULE_SIZE), 0);
        assert_eq!(backing.uncommit(4 * GRANULE_SIZE, GRANULE_SIZE), 0);
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn test_uncommit_discards_contents() {
        let backing = FileBacking::new(2 * GRANULE_SIZE, false).unwrap();
        backing.commit(0, GRANULE_SIZE);

        let addr = reserve_anon(0, GRANULE_SIZE).unwrap();
        backing.map(addr, GRANULE_SIZE, 0).unwrap();
        unsafe { *(addr as *mut u64) = 99 };
        assert_eq!(backing.uncommit(0, GRANULE_SIZE), GRANULE_SIZE);
        assert_eq!(unsafe { *(addr as *const u64) }, 0);

        backing.unmap(addr, GRANULE_SIZE).unwrap();
        munmap(addr, GRANULE_SIZE).unwrap();
    }
}
