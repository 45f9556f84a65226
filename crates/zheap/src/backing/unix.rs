//! Reservation helpers shared by the POSIX backings.

use super::AddressReserver;
use crate::util::fatal;
use std::io;
use std::ptr;

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "netbsd",
    target_os = "solaris",
    target_os = "illumos",
))]
pub(super) const MAP_NORESERVE: libc::c_int = libc::MAP_NORESERVE;

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "netbsd",
    target_os = "solaris",
    target_os = "illumos",
)))]
pub(super) const MAP_NORESERVE: libc::c_int = 0;

/// Inaccessible anonymous reservation.
pub(super) fn reserve_anon(addr: usize, size: usize) -> io::Result<usize> {
    let hint = if addr == 0 {
        ptr::null_mut()
    } else {
        addr as *mut libc::c_void
    };
    let flags = libc::MAP_PRIVATE | libc::MAP_ANON | MAP_NORESERVE;
    // SAFETY: no MAP_FIXED, so existing mappings are never replaced.
    let res = unsafe { libc::mmap(hint, size, libc::PROT_NONE, flags, -1, 0) };
    if res == libc::MAP_FAILED {
        Err(io::Error::last_os_error())
    } else {
        Ok(res as usize)
    }
}

/// Replace whatever is mapped at `[addr, addr + size)` with an inaccessible
/// reservation.
pub(super) fn unmap_to_reserved(addr: usize, size: usize) -> io::Result<()> {
    let flags = libc::MAP_FIXED | libc::MAP_PRIVATE | libc::MAP_ANON | MAP_NORESERVE;
    // SAFETY: the range belongs to a view reservation owned by the heap.
    let res = unsafe { libc::mmap(addr as *mut libc::c_void, size, libc::PROT_NONE, flags, -1, 0) };
    if res == libc::MAP_FAILED {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

pub(super) fn munmap(addr: usize, size: usize) -> io::Result<()> {
    // SAFETY: callers only pass ranges they mapped.
    if unsafe { libc::munmap(addr as *mut libc::c_void, size) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Reserves views with plain anonymous mappings at a hinted address.
pub struct PosixReserver;

impl AddressReserver for PosixReserver {
    fn reserve(&self, addr: usize, size: usize) -> bool {
        match reserve_anon(addr, size) {
            Ok(res) if res == addr => true,
            Ok(res) => {
                // Kernel placed it elsewhere.
                if let Err(e) = munmap(res, size) {
                    log::warn!("Failed to release misplaced reservation at {:#x}: {}", res, e);
                }
                false
            },
            Err(_) => false,
        }
    }

    fn unreserve(&self, addr: usize, size: usize) {
        if let Err(e) = munmap(addr, size) {
            fatal(&format!(
                "Failed to unreserve {:#x}..{:#x}: {}",
                addr,
                addr + size,
                e
            ));
        }
    }
}
