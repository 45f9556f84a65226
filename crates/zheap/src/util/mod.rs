//! Utility Module
//!
//! Alignment, atomics, raw memory helpers, hashing and fatal error exit.

pub mod alignment;
pub mod atomic;
pub mod memory;

pub use alignment::Alignment;
pub use atomic::AtomicUtils;

/// System page size, as reported by the OS.
pub fn os_page_size() -> usize {
    page_size::get()
}

/// 32-bit integer mix used to spread forwarding table indices.
#[inline]
pub fn hash_u32(key: u32) -> u32 {
    let mut key = (!key).wrapping_add(key << 15);
    key ^= key >> 12;
    key = key.wrapping_add(key << 2);
    key ^= key >> 4;
    key = key.wrapping_mul(2057);
    key ^= key >> 16;
    key
}

/// Report an unrecoverable host error and abort the process.
///
/// Used when a mapping operation fails after the address space has been
/// reserved: the views would no longer alias the same memory.
#[cold]
pub fn fatal(message: &str) -> ! {
    log::error!("Fatal heap error: {}", message);
    eprintln!("Fatal heap error: {}", message);
    std::process::abort()
}
