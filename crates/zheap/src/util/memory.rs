//! Raw memory helpers used when moving objects between pages.

use std::ptr;

/// Copy `size` bytes between non-overlapping regions.
///
/// # Safety
///
/// - `src` must be valid for reads of `size` bytes
/// - `dst` must be valid for writes of `size` bytes
/// - `src` and `dst` must not overlap
#[inline]
pub unsafe fn copy_memory(src: usize, dst: usize, size: usize) {
    if size == 0 {
        return;
    }
    ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, size);
}

/// Copy `size` bytes between possibly overlapping regions, like `memmove`.
///
/// # Safety
///
/// - `src` must be valid for reads of `size` bytes
/// - `dst` must be valid for writes of `size` bytes
#[inline]
pub unsafe fn copy_memory_overlapping(src: usize, dst: usize, size: usize) {
    if size == 0 {
        return;
    }
    ptr::copy(src as *const u8, dst as *mut u8, size);
}

/// Touch one byte per `page_size` so the OS backs the range eagerly.
///
/// # Safety
///
/// `[addr, addr + size)` must be mapped read-write.
pub unsafe fn pretouch(addr: usize, size: usize, page_size: usize) {
    let mut current = addr;
    while current < addr + size {
        let byte = current as *mut u8;
        ptr::write_volatile(byte, ptr::read_volatile(byte));
        current += page_size;
    }
}
