//! Atomic Utilities
//!
//! Helpers for the live map reset and the collector statistics.

use std::sync::atomic::{AtomicUsize, Ordering};

/// AtomicUtils - utility for atomic operations
pub struct AtomicUtils;

impl AtomicUtils {
    /// Atomic max, returns the previous value
    pub fn fetch_max(atomic: &AtomicUsize, value: usize) -> usize {
        atomic.fetch_max(value, Ordering::AcqRel)
    }

    /// Spin until `condition` holds, with exponential backoff.
    ///
    /// Yields the thread once the backoff saturates, so a waiter never burns
    /// a core while the owner is descheduled.
    pub fn spin_until<F>(mut condition: F)
    where
        F: FnMut() -> bool,
    {
        let mut backoff = 1;

        while !condition() {
            if backoff < 1024 {
                for _ in 0..backoff {
                    std::hint::spin_loop();
                }
                backoff *= 2;
            } else {
                std::thread::yield_now();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fetch_max() {
        let value = AtomicUsize::new(5);
        AtomicUtils::fetch_max(&value, 3);
        assert_eq!(value.load(Ordering::Relaxed), 5);
        AtomicUtils::fetch_max(&value, 9);
        assert_eq!(value.load(Ordering::Relaxed), 9);
    }

    #[test]
    fn test_spin_until_observes_other_thread() {
        let flag = Arc::new(AtomicBool::new(false));
        let setter = {
            let flag = Arc::clone(&flag);
            thread::spawn(move || flag.store(true, Ordering::Release))
        };
        AtomicUtils::spin_until(|| flag.load(Ordering::Acquire));
        setter.join().unwrap();
    }
}
