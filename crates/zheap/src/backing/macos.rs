//! Mach backing for macOS.
//!
//! Physical memory lives in a private backing region of the max capacity,
//! reserved once at start-up. Committing makes part of that region
//! accessible, and each view is a `mach_vm_remap` alias of the backing
//! pages (shared, not copied).

use super::unix::{reserve_anon, unmap_to_reserved, PosixReserver, MAP_NORESERVE};
use super::{Backing, Platform};
use crate::config::HeapConfig;
use crate::error::{HeapError, Result};
use crate::util::fatal;
use std::io;
use std::sync::Arc;

type MachPort = u32;
type KernReturn = i32;

const KERN_SUCCESS: KernReturn = 0;
const VM_FLAGS_FIXED: i32 = 0x0000;
const VM_FLAGS_OVERWRITE: i32 = 0x4000;
const VM_INHERIT_COPY: u32 = 1;

extern "C" {
    static mach_task_self_: MachPort;

    fn mach_vm_remap(
        target_task: MachPort,
        target_address: *mut u64,
        size: u64,
        mask: u64,
        flags: i32,
        src_task: MachPort,
        src_address: u64,
        copy: i32,
        cur_protection: *mut i32,
        max_protection: *mut i32,
        inheritance: u32,
    ) -> KernReturn;
}

pub(super) fn platform(config: &HeapConfig) -> Result<Platform> {
    if config.large_pages {
        log::warn!("Large pages are not supported on this platform, ignoring");
    }
    let backing = MachBacking::new(config.max_heap_size)?;
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

/// MachBacking - remaps a private backing region into the views
pub struct MachBacking {
    base: usize,
    size: usize,
}

impl MachBacking {
    pub fn new(size: usize) -> Result<Self> {
        let base = reserve_anon(0, size).map_err(|e| {
            HeapError::Backing(format!("failed to reserve {} bytes of backing: {}", size, e))
        })?;
        Ok(Self { base, size })
    }
}

impl Drop for MachBacking {
    fn drop(&mut self) {
        // SAFETY: base..base+size is the region reserved in `new`.
        unsafe { libc::munmap(self.base as *mut libc::c_void, self.size) };
    }
}

impl Backing for MachBacking {
    fn name(&self) -> &'static str {
        "mach backing region"
    }

    fn commit_inner(&self, offset: usize, length: usize) -> bool {
        let addr = self.base + offset;
        let flags = libc::MAP_FIXED | libc::MAP_PRIVATE | libc::MAP_ANON | MAP_NORESERVE;
        // SAFETY: the range lies inside the backing region owned by self.
        let res = unsafe {
            libc::mmap(
                addr as *mut libc::c_void,
                length,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                -1,
                0,
            )
        };
        res != libc::MAP_FAILED
    }

    fn uncommit_inner(&self, offset: usize, length: usize) -> bool {
        unmap_to_reserved(self.base + offset, length).is_ok()
    }

    fn map(&self, addr: usize, size: usize, offset: usize) -> io::Result<()> {
        let mut target = addr as u64;
        let mut cur_prot = 0;
        let mut max_prot = 0;
        // SAFETY: target lies in a view reservation owned by the heap, the
        // source in the backing region.
        let kr = unsafe {
            mach_vm_remap(
                mach_task_self_,
                &mut target,
                size as u64,
                0,
                VM_FLAGS_FIXED | VM_FLAGS_OVERWRITE,
                mach_task_self_,
                (self.base + offset) as u64,
                0,
                &mut cur_prot,
                &mut max_prot,
                VM_INHERIT_COPY,
            )
        };
        if kr != KERN_SUCCESS {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("mach_vm_remap failed: kern_return {}", kr),
            ));
        }
        if target as usize != addr {
            fatal("mach_vm_remap moved a fixed mapping");
        }
        Ok(())
    }

    fn unmap(&self, addr: usize, size: usize) -> io::Result<()> {
        unmap_to_reserved(addr, size)
    }
}
