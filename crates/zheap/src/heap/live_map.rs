//! Live Map - Per-Page Liveness Bits
//!
//! Two bits per object slot (one slot per alignment unit of the page):
//!
//! ```text
//!  bit 2i     marked            (finalizable or strong)
//!  bit 2i+1   strongly marked
//! ```
//!
//! The map carries the sequence number of the cycle it was last marked in.
//! A map from an older cycle reads as empty and is cleared lazily by the
//! first marker of the new cycle; concurrent markers wait for that reset.

use crate::util::AtomicUtils;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

const RESETTING: u32 = u32::MAX;
const NEVER_MARKED: u32 = 0;

/// Outcome of marking one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkResult {
    /// Already marked with at least the requested strength.
    Unchanged,
    /// Finalizable mark upgraded to strong; already counted live.
    Upgraded,
    /// First mark of this object in the cycle; count it live.
    NewlyMarked,
}

impl MarkResult {
    /// True when the mark changed anything.
    pub fn is_marked(self) -> bool {
        self != MarkResult::Unchanged
    }

    /// True when the caller should account the object with `inc_live`.
    pub fn inc_live(self) -> bool {
        self == MarkResult::NewlyMarked
    }
}

/// LiveMap - lazily reset 2-bit-per-object bitmap
pub struct LiveMap {
    seqnum: AtomicU32,
    live_objects: AtomicU32,
    live_bytes: AtomicUsize,
    object_count: usize,
    bits: Box<[AtomicU64]>,
}

impl LiveMap {
    pub fn new(object_count: usize) -> Self {
        let words = (object_count * 2 + 63) / 64;
        Self {
            seqnum: AtomicU32::new(NEVER_MARKED),
            live_objects: AtomicU32::new(0),
            live_bytes: AtomicUsize::new(0),
            object_count,
            bits: (0..words).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn object_count(&self) -> usize {
        self.object_count
    }

    /// True when marked during cycle `seqnum`.
    pub fn is_marked(&self, seqnum: u32) -> bool {
        self.seqnum.load(Ordering::Acquire) == seqnum
    }

    /// Forget all marks, as if never marked.
    pub fn reset(&mut self) {
        *self.seqnum.get_mut() = NEVER_MARKED;
        *self.live_objects.get_mut() = 0;
        *self.live_bytes.get_mut() = 0;
        for word in self.bits.iter_mut() {
            *word.get_mut() = 0;
        }
    }

    /// Clear the map for cycle `seqnum` unless that already happened.
    fn reset_for(&self, seqnum: u32) {
        loop {
            let current = self.seqnum.load(Ordering::Acquire);
            if current == seqnum {
                return;
            }

            if current == RESETTING {
                AtomicUtils::spin_until(|| self.seqnum.load(Ordering::Acquire) != RESETTING);
                continue;
            }

            if self
                .seqnum
                .compare_exchange(current, RESETTING, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                for word in self.bits.iter() {
                    word.store(0, Ordering::Relaxed);
                }
                self.live_objects.store(0, Ordering::Relaxed);
                self.live_bytes.store(0, Ordering::Relaxed);
                self.seqnum.store(seqnum, Ordering::Release);
                return;
            }
        }
    }

    fn bit(&self, bit: usize) -> bool {
        let word = self.bits[bit / 64].load(Ordering::Acquire);
        word & (1 << (bit % 64)) != 0
    }

    /// Object `index` marked (finalizable or strong) in cycle `seqnum`.
    pub fn get(&self, seqnum: u32, index: usize) -> bool {
        self.is_marked(seqnum) && self.bit(index * 2)
    }

    /// Object `index` strongly marked in cycle `seqnum`.
    pub fn get_strong(&self, seqnum: u32, index: usize) -> bool {
        self.is_marked(seqnum) && self.bit(index * 2 + 1)
    }

    /// Mark object `index` for cycle `seqnum`.
    ///
    /// A finalizable mark sets only the marked bit. A strong mark sets both
    /// bits, upgrading an earlier finalizable mark.
    pub fn set(&self, seqnum: u32, index: usize, finalizable: bool) -> MarkResult {
        debug_assert!(index < self.object_count, "object index out of range");
        self.reset_for(seqnum);

        let bit = index * 2;
        let word = &self.bits[bit / 64];
        let marked = 1u64 << (bit % 64);
        let pair = marked | (marked << 1);

        if finalizable {
            let old = word.fetch_or(marked, Ordering::AcqRel);
            return if old & marked == 0 {
                MarkResult::NewlyMarked
            } else {
                MarkResult::Unchanged
            };
        }

        let mut old = word.load(Ordering::Relaxed);
        loop {
            if old & pair == pair {
                return MarkResult::Unchanged;
            }
            match word.compare_exchange_weak(old, old | pair, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => {
                    return if old & marked == 0 {
                        MarkResult::NewlyMarked
                    } else {
                        MarkResult::Upgraded
                    };
                },
                Err(actual) => old = actual,
            }
        }
    }

    pub fn inc_live(&self, seqnum: u32, objects: u32, bytes: usize) {
        self.reset_for(seqnum);
        self.live_objects.fetch_add(objects, Ordering::Relaxed);
        self.live_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn live_objects(&self, seqnum: u32) -> u32 {
        if self.is_marked(seqnum) {
            self.live_objects.load(Ordering::Relaxed)
        } else {
            0
        }
    }

    pub fn live_bytes(&self, seqnum: u32) -> usize {
        if self.is_marked(seqnum) {
            self.live_bytes.load(Ordering::Relaxed)
        } else {
            0
        }
    }

    /// Visit the index of every object marked in cycle `seqnum`, ascending.
    pub fn for_each_marked<F>(&self, seqnum: u32, mut f: F)
    where
        F: FnMut(usize),
    {
        if !self.is_marked(seqnum) {
            return;
        }

        for (word_index, word) in self.bits.iter().enumerate() {
            // Only the even (marked) bits.
            let mut bits = word.load(Ordering::Acquire) & 0x5555_5555_5555_5555;
            while bits != 0 {
                let bit = bits.trailing_zeros() as usize;
                f((word_index * 64 + bit) / 2);
                bits &= bits - 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_strong_and_finalizable_marks() {
        let map = LiveMap::new(128);
        assert_eq!(map.set(1, 3, true), MarkResult::NewlyMarked);
        assert!(map.get(1, 3));
        assert!(!map.get_strong(1, 3));

        assert_eq!(map.set(1, 3, true), MarkResult::Unchanged);
        assert_eq!(map.set(1, 3, false), MarkResult::Upgraded);
        assert!(map.get_strong(1, 3));
        assert_eq!(map.set(1, 3, false), MarkResult::Unchanged);
    }

    #[test]
    fn test_old_cycle_reads_empty_and_resets_lazily() {
        let map = LiveMap::new(64);
        map.set(1, 10, false);
        map.inc_live(1, 1, 16);
        assert_eq!(map.live_bytes(1), 16);

        assert!(!map.get(2, 10));
        assert_eq!(map.live_objects(2), 0);

        assert_eq!(map.set(2, 11, false), MarkResult::NewlyMarked);
        assert!(!map.get(2, 10));
        assert_eq!(map.live_bytes(2), 0);
    }

    #[test]
    fn test_for_each_marked_in_order() {
        let map = LiveMap::new(256);
        for index in [200, 0, 31, 32, 33] {
            map.set(5, index, index % 2 == 0);
        }
        let mut seen = Vec::new();
        map.for_each_marked(5, |index| seen.push(index));
        assert_eq!(seen, vec![0, 31, 32, 33, 200]);

        seen.clear();
        map.for_each_marked(6, |index| seen.push(index));
        assert!(seen.is_empty());
    }

    #[test]
    fn test_concurrent_marking_counts_each_object_once() {
        let map = Arc::new(LiveMap::new(1024));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let map = Arc::clone(&map);
                thread::spawn(move || {
                    let mut newly = 0;
                    for index in 0..1024 {
                        if map.set(7, index, false).inc_live() {
                            newly += 1;
                        }
                    }
                    newly
                })
            })
            .collect();

        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 1024);
    }

    #[test]
    fn test_reset_forgets_marks() {
        let mut map = LiveMap::new(8);
        map.set(3, 1, false);
        map.reset();
        assert!(!map.is_marked(3));
        assert!(!map.get(3, 1));
    }
}
