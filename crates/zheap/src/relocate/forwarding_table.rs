//! Forwarding Table
//!
//! Granule lookup from an old object offset to the [`Forwarding`] of its
//! page. Populated when a relocation set is installed and emptied when it
//! is reset. The table does not own the forwardings: the relocation set
//! does, and it releases them through the epoch after removing them here.

use crate::address::Offset;
use crate::error::Result;
use crate::heap::granule_map::GranuleMap;
use crate::relocate::forwarding::Forwarding;
use crossbeam::epoch::Guard;
use std::ptr;

/// ForwardingTable - granule to forwarding lookup
pub struct ForwardingTable {
    map: GranuleMap<*const Forwarding>,
}

impl ForwardingTable {
    pub fn new(max_offset: usize) -> Result<Self> {
        Ok(Self {
            map: GranuleMap::new(max_offset)?,
        })
    }

    pub fn insert(&self, forwarding: &Forwarding) {
        debug_assert!(self.map.get(forwarding.start()).is_null());
        self.map
            .release_put_range(forwarding.start(), forwarding.size(), forwarding as *const Forwarding);
    }

    pub fn remove(&self, forwarding: &Forwarding) {
        debug_assert!(ptr::eq(self.map.get(forwarding.start()), forwarding));
        self.map
            .release_put_range(forwarding.start(), forwarding.size(), ptr::null());
    }

    /// Forwarding covering `offset`, valid while `guard` is pinned.
    pub fn get<'g>(&self, offset: Offset, _guard: &'g Guard) -> Option<&'g Forwarding> {
        let raw = self.map.get_acquire(offset);
        // SAFETY: forwardings are dropped through the epoch after removal.
        unsafe { raw.as_ref() }
    }
}
