//! Windows backings.
//!
//! Small pages: every committed granule is its own pagefile-backed section.
//! View reservations are placeholders, split into granule-sized placeholders
//! while allocated and coalesced again when returned to the free list, so a
//! granule view can replace its placeholder with `MapViewOfFile3`.
//!
//! Large pages: one shared AWE section. Physical large pages are allocated
//! into a page-frame array, one frame per granule, and mapped into each view
//! reservation with `MapUserPhysicalPages`.

use super::{AddressReserver, Backing, Platform};
use crate::address::{AddressLayout, Offset, View};
use crate::config::HeapConfig;
use crate::error::{HeapError, Result};
use crate::globals::{GRANULE_SIZE, GRANULE_SIZE_SHIFT};
use crate::heap::granule_map::GranuleMap;
use crate::heap::memory_manager::MemoryCallbacks;
use crate::util::fatal;
use parking_lot::Mutex;
use std::ffi::c_void;
use std::io;
use std::ptr;
use std::sync::Arc;
use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE};
use windows_sys::Win32::System::Memory::{
    AllocateUserPhysicalPages, CreateFileMapping2, CreateFileMappingW, FreeUserPhysicalPages,
    MapUserPhysicalPages, MapViewOfFile3, UnmapViewOfFile2, VirtualAlloc2, VirtualFree,
    MemExtendedParameterUserPhysicalHandle, MemSectionExtendedParameterUserPhysicalFlags,
    MEMORY_MAPPED_VIEW_ADDRESS, MEM_EXTENDED_PARAMETER, MEM_PHYSICAL, MEM_RELEASE,
    MEM_REPLACE_PLACEHOLDER, MEM_RESERVE, MEM_RESERVE_PLACEHOLDER, PAGE_NOACCESS,
    PAGE_READWRITE, SEC_COMMIT, SEC_LARGE_PAGES, SEC_RESERVE,
};
use windows_sys::Win32::System::Threading::GetCurrentProcess;

const MEM_COALESCE_PLACEHOLDERS: u32 = 0x1;
const MEM_PRESERVE_PLACEHOLDER: u32 = 0x2;
const SECTION_MAP_WRITE: u32 = 0x2;
const SECTION_MAP_READ: u32 = 0x4;

pub(super) fn platform(config: &HeapConfig) -> Result<Platform> {
    if config.large_pages {
        let section = Arc::new(AweSection::create()?);
        let backing = LargePageBacking::new(Arc::clone(&section), config.max_heap_size);
        log::info!(
            "Heap Backing: {} ({}M)",
            backing.name(),
            config.max_heap_size >> 20
        );
        Ok(Platform {
            backing: Arc::new(backing),
            reserver: Arc::new(AweReserver { section }),
        })
    } else {
        let backing = SmallPageBacking::new(config.max_heap_size)?;
        log::info!(
            "Heap Backing: {} ({}M)",
            backing.name(),
            config.max_heap_size >> 20
        );
        Ok(Platform {
            backing: Arc::new(backing),
            reserver: Arc::new(PlaceholderReserver),
        })
    }
}

fn last_error() -> io::Error {
    io::Error::last_os_error()
}

// ============================================================================
// SMALL PAGES
// ============================================================================

/// Reserves views as placeholders.
pub struct PlaceholderReserver;

impl AddressReserver for PlaceholderReserver {
    fn reserve(&self, addr: usize, size: usize) -> bool {
        // SAFETY: no existing mapping is replaced by a placeholder reservation.
        let res = unsafe {
            VirtualAlloc2(
                GetCurrentProcess(),
                addr as *const c_void,
                size,
                MEM_RESERVE | MEM_RESERVE_PLACEHOLDER,
                PAGE_NOACCESS,
                ptr::null_mut(),
                0,
            )
        };
        if res.is_null() {
            return false;
        }
        if res as usize != addr {
            unsafe { VirtualFree(res, 0, MEM_RELEASE) };
            return false;
        }
        true
    }

    fn unreserve(&self, addr: usize, size: usize) {
        // SAFETY: the range is a placeholder reserved by `reserve`.
        if unsafe { VirtualFree(addr as *mut c_void, 0, MEM_RELEASE) } == 0 {
            fatal(&format!(
                "Failed to unreserve {:#x}..{:#x}: {}",
                addr,
                addr + size,
                last_error()
            ));
        }
    }

    fn callbacks(&self, layout: AddressLayout) -> Box<dyn MemoryCallbacks> {
        Box::new(PlaceholderCallbacks { layout })
    }
}

/// Keeps placeholders in step with the virtual free list: allocated ranges
/// are granule-sized placeholders, free areas are one placeholder each.
struct PlaceholderCallbacks {
    layout: AddressLayout,
}

impl PlaceholderCallbacks {
    fn split(&self, start: usize, size: usize) {
        for view in View::MAPPED {
            let addr = self.layout.view_address(Offset::new(start), view);
            // SAFETY: the range lies inside a placeholder of this view.
            let res = unsafe {
                VirtualFree(
                    addr as *mut c_void,
                    size,
                    MEM_RELEASE | MEM_PRESERVE_PLACEHOLDER,
                )
            };
            if res == 0 {
                fatal(&format!(
                    "Failed to split placeholder {:#x}..{:#x}: {}",
                    addr,
                    addr + size,
                    last_error()
                ));
            }
        }
    }

    fn coalesce(&self, start: usize, size: usize) {
        if size <= GRANULE_SIZE {
            return;
        }
        for view in View::MAPPED {
            let addr = self.layout.view_address(Offset::new(start), view);
            // SAFETY: the range is covered by adjacent placeholders.
            let res = unsafe {
                VirtualFree(
                    addr as *mut c_void,
                    size,
                    MEM_RELEASE | MEM_COALESCE_PLACEHOLDERS,
                )
            };
            if res == 0 {
                fatal(&format!(
                    "Failed to coalesce placeholders {:#x}..{:#x}: {}",
                    addr,
                    addr + size,
                    last_error()
                ));
            }
        }
    }

    /// Split `[start, start + size)` into granule placeholders. When the
    /// range is a whole placeholder the last granule is what remains.
    fn split_into_granules(&self, start: usize, size: usize, whole: bool) {
        let end = start + size;
        let mut addr = start;
        while addr < end {
            if !(whole && addr + GRANULE_SIZE == end) {
                self.split(addr, GRANULE_SIZE);
            }
            addr += GRANULE_SIZE;
        }
    }
}

impl MemoryCallbacks for PlaceholderCallbacks {
    fn create(&self, start: usize, size: usize) {
        self.coalesce(start, size);
    }

    fn destroy(&self, start: usize, size: usize) {
        self.split_into_granules(start, size, true);
    }

    fn shrink_from_front(&self, start: usize, _area_size: usize, size: usize) {
        self.split_into_granules(start, size, false);
    }

    fn shrink_from_back(&self, start: usize, area_size: usize, size: usize) {
        self.split_into_granules(start + area_size - size, size, false);
    }

    fn grow_from_front(&self, start: usize, area_size: usize, size: usize) {
        self.coalesce(start - size, area_size + size);
    }

    fn grow_from_back(&self, start: usize, area_size: usize, size: usize) {
        self.coalesce(start, area_size + size);
    }
}

/// SmallPageBacking - one paging-file section per granule
pub struct SmallPageBacking {
    handles: GranuleMap<isize>,
}

impl SmallPageBacking {
    pub fn new(max_capacity: usize) -> Result<Self> {
        Ok(Self {
            handles: GranuleMap::new(max_capacity)?,
        })
    }

    fn create_section() -> Option<HANDLE> {
        // SAFETY: creates an unnamed pagefile-backed section.
        let handle = unsafe {
            CreateFileMappingW(
                INVALID_HANDLE_VALUE,
                ptr::null(),
                PAGE_READWRITE | SEC_COMMIT,
                0,
                GRANULE_SIZE as u32,
                ptr::null(),
            )
        };
        if handle == 0 {
            None
        } else {
            Some(handle)
        }
    }
}

impl Drop for SmallPageBacking {
    fn drop(&mut self) {
        for handle in self.handles.iter().filter(|&h| h != 0) {
            unsafe { CloseHandle(handle) };
        }
    }
}

impl Backing for SmallPageBacking {
    fn name(&self) -> &'static str {
        "paging file sections"
    }

    fn commit_inner(&self, offset: usize, length: usize) -> bool {
        let mut committed = 0;
        while committed < length {
            let Some(handle) = Self::create_section() else {
                // Roll back so the range is all or nothing.
                self.uncommit_inner(offset, committed);
                return false;
            };
            self.handles.put(Offset::new(offset + committed), handle);
            committed += GRANULE_SIZE;
        }
        true
    }

    fn uncommit_inner(&self, offset: usize, length: usize) -> bool {
        let mut current = offset;
        while current < offset + length {
            let granule = Offset::new(current);
            let handle = self.handles.get(granule);
            if handle != 0 {
                // The section memory is released once the last view is gone.
                unsafe { CloseHandle(handle) };
                self.handles.put(granule, 0);
            }
            current += GRANULE_SIZE;
        }
        true
    }

    fn map(&self, addr: usize, size: usize, offset: usize) -> io::Result<()> {
        for i in 0..size >> GRANULE_SIZE_SHIFT {
            let handle = self.handles.get(Offset::new(offset + i * GRANULE_SIZE));
            let view_addr = addr + i * GRANULE_SIZE;
            // SAFETY: view_addr is a granule placeholder owned by the heap.
            let res = unsafe {
                MapViewOfFile3(
                    handle,
                    GetCurrentProcess(),
                    view_addr as *const c_void,
                    0,
                    GRANULE_SIZE,
                    MEM_REPLACE_PLACEHOLDER,
                    PAGE_READWRITE,
                    ptr::null_mut(),
                    0,
                )
            };
            if res.Value as usize != view_addr {
                return Err(last_error());
            }
        }
        Ok(())
    }

    fn unmap(&self, addr: usize, size: usize) -> io::Result<()> {
        for i in 0..size >> GRANULE_SIZE_SHIFT {
            let view = MEMORY_MAPPED_VIEW_ADDRESS {
                Value: (addr + i * GRANULE_SIZE) as *mut c_void,
            };
            // SAFETY: the granule view was mapped by `map`.
            let res =
                unsafe { UnmapViewOfFile2(GetCurrentProcess(), view, MEM_PRESERVE_PLACEHOLDER) };
            if res == 0 {
                return Err(last_error());
            }
        }
        Ok(())
    }
}

// ============================================================================
// LARGE PAGES
// ============================================================================

/// Shared AWE section. Views reserved against it can all map the same
/// physical pages.
pub struct AweSection {
    handle: HANDLE,
}

// The handle is only used in thread-safe kernel calls.
unsafe impl Send for AweSection {}
unsafe impl Sync for AweSection {}

impl AweSection {
    fn create() -> Result<Self> {
        // SAFETY: zeroed extended parameter is a valid starting value.
        let mut param: MEM_EXTENDED_PARAMETER = unsafe { std::mem::zeroed() };
        param.Anonymous1._bitfield = MemSectionExtendedParameterUserPhysicalFlags as u64;
        param.Anonymous2.ULong64 = 0;

        let handle = unsafe {
            CreateFileMapping2(
                INVALID_HANDLE_VALUE,
                ptr::null(),
                SECTION_MAP_READ | SECTION_MAP_WRITE,
                PAGE_READWRITE,
                SEC_RESERVE | SEC_LARGE_PAGES,
                0,
                ptr::null(),
                &mut param,
                1,
            )
        };
        if handle == 0 {
            return Err(HeapError::Backing(format!(
                "failed to create shared AWE section: {}",
                last_error()
            )));
        }
        Ok(Self { handle })
    }
}

impl Drop for AweSection {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.handle) };
    }
}

/// Reserves views as physical (AWE) regions of the shared section.
pub struct AweReserver {
    section: Arc<AweSection>,
}

impl AddressReserver for AweReserver {
    fn reserve(&self, addr: usize, size: usize) -> bool {
        // SAFETY: zeroed extended parameter is a valid starting value.
        let mut param: MEM_EXTENDED_PARAMETER = unsafe { std::mem::zeroed() };
        param.Anonymous1._bitfield = MemExtendedParameterUserPhysicalHandle as u64;
        param.Anonymous2.Handle = self.section.handle;

        let res = unsafe {
            VirtualAlloc2(
                GetCurrentProcess(),
                addr as *const c_void,
                size,
                MEM_RESERVE | MEM_PHYSICAL,
                PAGE_READWRITE,
                &mut param,
                1,
            )
        };
        if res.is_null() {
            return false;
        }
        if res as usize != addr {
            unsafe { VirtualFree(res, 0, MEM_RELEASE) };
            return false;
        }
        true
    }

    fn unreserve(&self, addr: usize, size: usize) {
        if unsafe { VirtualFree(addr as *mut c_void, 0, MEM_RELEASE) } == 0 {
            fatal(&format!(
                "Failed to unreserve {:#x}..{:#x}: {}",
                addr,
                addr + size,
                last_error()
            ));
        }
    }
}

/// LargePageBacking - AWE page frames, one per granule
pub struct LargePageBacking {
    section: Arc<AweSection>,
    frames: Mutex<Vec<usize>>,
}

impl LargePageBacking {
    pub fn new(section: Arc<AweSection>, max_capacity: usize) -> Self {
        Self {
            section,
            frames: Mutex::new(vec![0; max_capacity >> GRANULE_SIZE_SHIFT]),
        }
    }
}

impl Backing for LargePageBacking {
    fn name(&self) -> &'static str {
        "shared AWE section (large pages)"
    }

    fn commit_inner(&self, offset: usize, length: usize) -> bool {
        let index = offset >> GRANULE_SIZE_SHIFT;
        let wanted = length >> GRANULE_SIZE_SHIFT;
        let mut npages = wanted;
        let mut frames = self.frames.lock();
        // SAFETY: the frame slice covers `npages` entries from `index`.
        let res = unsafe {
            AllocateUserPhysicalPages(self.section.handle, &mut npages, frames[index..].as_mut_ptr())
        };
        if res == 0 || npages != wanted {
            if npages > 0 {
                unsafe {
                    FreeUserPhysicalPages(self.section.handle, &mut npages, frames[index..].as_ptr())
                };
            }
            return false;
        }
        true
    }

    fn uncommit_inner(&self, offset: usize, length: usize) -> bool {
        let index = offset >> GRANULE_SIZE_SHIFT;
        let mut npages = length >> GRANULE_SIZE_SHIFT;
        let frames = self.frames.lock();
        // SAFETY: the frames were allocated by `commit_inner`.
        unsafe { FreeUserPhysicalPages(self.section.handle, &mut npages, frames[index..].as_ptr()) != 0 }
    }

    fn map(&self, addr: usize, size: usize, offset: usize) -> io::Result<()> {
        let index = offset >> GRANULE_SIZE_SHIFT;
        let frames = self.frames.lock();
        // SAFETY: addr lies in an AWE view reservation of the shared section.
        let res = unsafe {
            MapUserPhysicalPages(
                addr as *const c_void,
                size >> GRANULE_SIZE_SHIFT,
                frames[index..].as_ptr(),
            )
        };
        if res == 0 {
            Err(last_error())
        } else {
            Ok(())
        }
    }

    fn unmap(&self, addr: usize, size: usize) -> io::Result<()> {
        // SAFETY: a null frame array unmaps the range.
        let res =
            unsafe { MapUserPhysicalPages(addr as *const c_void, size >> GRANULE_SIZE_SHIFT, ptr::null()) };
        if res == 0 {
            Err(last_error())
        } else {
            Ok(())
        }
    }

    fn pretouch_granularity(&self) -> usize {
        GRANULE_SIZE
    }
}
