//! Collaborators - What the Heap Delegates to the Runtime
//!
//! The heap manages memory, colors and relocation. Finding live objects,
//! processing weak references and knowing object sizes belong to the
//! runtime embedding it:
//!
//! - [`MarkingCollaborator`] traces the object graph during `Mark` and
//!   records liveness through [`Heap::mark_object`]
//! - [`ReferenceCollaborator`] runs between mark end and relocate start
//! - [`ObjectModel`] reports object sizes for relocation copying

use crate::heap::Heap;
use std::sync::Arc;

/// Marking driver
pub trait MarkingCollaborator: Send + Sync {
    /// Called from `mark_start`, after the flip to the new marked view.
    fn start(&self, heap: &Heap);

    /// Mark from roots (`initial`) or continue with pending work.
    fn mark(&self, heap: &Heap, initial: bool);

    /// True once marking has no work left.
    fn end(&self, heap: &Heap) -> bool;
}

/// Weak, soft and phantom reference processing
pub trait ReferenceCollaborator: Send + Sync {
    fn process(&self, heap: &Heap);
}

/// Object layout knowledge needed to move objects
pub trait ObjectModel: Send + Sync {
    /// Size in bytes of the object at machine address `addr`.
    fn object_size(&self, addr: usize) -> usize;
}

/// Marking that finds nothing live.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMarking;

impl MarkingCollaborator for NoMarking {
    fn start(&self, _heap: &Heap) {}

    fn mark(&self, _heap: &Heap, _initial: bool) {}

    fn end(&self, _heap: &Heap) -> bool {
        true
    }
}

/// Reference processing that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoReferences;

impl ReferenceCollaborator for NoReferences {
    fn process(&self, _heap: &Heap) {}
}

/// Objects whose first word holds their size in bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SizeHeader;

impl ObjectModel for SizeHeader {
    fn object_size(&self, addr: usize) -> usize {
        // SAFETY: relocation only asks about mapped, live objects.
        unsafe { std::ptr::read(addr as *const usize) }
    }
}

/// The collaborators of one heap
#[derive(Clone)]
pub struct Collaborators {
    pub marking: Arc<dyn MarkingCollaborator>,
    pub references: Arc<dyn ReferenceCollaborator>,
    pub object_model: Arc<dyn ObjectModel>,
}

impl Collaborators {
    pub fn new(marking: Arc<dyn MarkingCollaborator>, object_model: Arc<dyn ObjectModel>) -> Self {
        Self {
            marking,
            references: Arc::new(NoReferences),
            object_model,
        }
    }

    pub fn with_references(mut self, references: Arc<dyn ReferenceCollaborator>) -> Self {
        self.references = references;
        self
    }
}
