//! Colored pointers.
//!
//! Every heap offset is visible through three virtual views (marked0,
//! marked1, remapped) that alias the same physical memory. Which view is
//! "good" changes twice per cycle; a pointer whose view bit differs from the
//! good mask is "bad" and must take the barrier slow path.

pub mod address_space;
pub mod colored_ptr;

pub use address_space::{AddressLayout, AddressSpace};
pub use colored_ptr::{ColoredPointer, Offset, View};
