use std::sync::Mutex;

use crate::threads::{Mutator, ThreadId};
use crate::util::Address;
use crate::vm::ObjectReference;

/// Callback trait of tracing functions that report references.
pub trait ObjectTracer {
    /// Call this function for each reference held by the object being traced.
    fn trace_object(&mut self, object: ObjectReference);
}

/// This lets us use closures as ObjectTracer.
impl<F: FnMut(ObjectReference)> ObjectTracer for F {
    fn trace_object(&mut self, object: ObjectReference) {
        self(object)
    }
}

/// Callback trait of root-scanning functions.
pub trait RootVisitor {
    /// Report a root. The value is the address the root holds. Addresses that do not name an
    /// allocated object are ignored, so a conservative scanner may report any word.
    fn visit_root(&mut self, root: Address);
}

/// This lets us use closures as RootVisitor.
impl<F: FnMut(Address)> RootVisitor for F {
    fn visit_root(&mut self, root: Address) {
        self(root)
    }
}

/// A stopped thread, as seen by root scanning.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThreadSnapshot {
    pub id: ThreadId,
    /// The stack pointer recorded when the thread was counted into the rendezvous. The live part
    /// of the stack is `[stack_pointer, stack_high)`.
    pub stack_pointer: Address,
    pub stack_low: Address,
    pub stack_high: Address,
}

/// The frontend's root enumeration. Called by the collector while every thread is stopped.
pub trait RootProvider: Send + Sync {
    /// Report the roots held by one stopped thread.
    fn scan_thread_roots(&self, thread: &ThreadSnapshot, visitor: &mut dyn RootVisitor);

    /// Report roots that do not belong to any thread.
    fn scan_global_roots(&self, visitor: &mut dyn RootVisitor);
}

/// A provider that reports nothing. Every object is garbage at the next collection.
pub struct NoRoots;

impl RootProvider for NoRoots {
    fn scan_thread_roots(&self, _thread: &ThreadSnapshot, _visitor: &mut dyn RootVisitor) {}
    fn scan_global_roots(&self, _visitor: &mut dyn RootVisitor) {}
}

/// A handle to a slot of a [`RootTable`].
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct RootHandle(usize);

/// A table of global roots with stable handles, for frontends that keep their roots outside of
/// thread stacks.
///
/// The table lock is taken in native mode. A thread stopped by the suspension signal therefore
/// never holds it, and the collector can always scan the table.
#[derive(Default)]
pub struct RootTable {
    slots: Mutex<Vec<Option<ObjectReference>>>,
}

impl RootTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_slots<R>(
        &self,
        mutator: &Mutator,
        f: impl FnOnce(&mut Vec<Option<ObjectReference>>) -> R,
    ) -> R {
        mutator.in_native(|| f(&mut self.slots.lock().unwrap()))
    }

    /// Add a root and return its handle.
    pub fn add(&self, mutator: &Mutator, object: ObjectReference) -> RootHandle {
        self.with_slots(mutator, |slots| {
            if let Some(index) = slots.iter().position(|s| s.is_none()) {
                slots[index] = Some(object);
                RootHandle(index)
            } else {
                slots.push(Some(object));
                RootHandle(slots.len() - 1)
            }
        })
    }

    pub fn get(&self, mutator: &Mutator, handle: RootHandle) -> Option<ObjectReference> {
        self.with_slots(mutator, |slots| slots[handle.0])
    }

    pub fn set(&self, mutator: &Mutator, handle: RootHandle, object: ObjectReference) {
        self.with_slots(mutator, |slots| slots[handle.0] = Some(object))
    }

    /// Drop a root. The handle may be reused by a later `add`.
    pub fn remove(&self, mutator: &Mutator, handle: RootHandle) -> Option<ObjectReference> {
        self.with_slots(mutator, |slots| slots[handle.0].take())
    }

    /// Drop every root. Existing handles stay valid and read as empty.
    pub fn clear(&self, mutator: &Mutator) {
        self.with_slots(mutator, |slots| slots.iter_mut().for_each(|slot| *slot = None))
    }

    pub fn len(&self, mutator: &Mutator) -> usize {
        self.with_slots(mutator, |slots| slots.iter().flatten().count())
    }

    pub fn is_empty(&self, mutator: &Mutator) -> bool {
        self.len(mutator) == 0
    }
}

impl RootProvider for RootTable {
    fn scan_thread_roots(&self, _thread: &ThreadSnapshot, _visitor: &mut dyn RootVisitor) {}

    fn scan_global_roots(&self, visitor: &mut dyn RootVisitor) {
        for object in self.slots.lock().unwrap().iter().flatten() {
            visitor.visit_root(object.to_raw_address());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Made-up addresses. The table never dereferences them.
    fn fake(value: usize) -> ObjectReference {
        unsafe { ObjectReference::from_raw_address(Address::from_usize(value)) }.unwrap()
    }

    #[test]
    fn closures_as_visitors() {
        let mut count = 0;
        {
            let mut tracer = |_: ObjectReference| count += 1;
            let tracer: &mut dyn ObjectTracer = &mut tracer;
            tracer.trace_object(fake(0x10));
            tracer.trace_object(fake(0x20));
        }
        assert_eq!(count, 2);
    }
}
