//! The layout of heap objects.
//!
//! Every object starts with three words:
//!
//! | word | content |
//! |------|---------|
//! | 0 | pointer to the object's [`TypeDescriptor`] |
//! | 1 | the header word: lock state and GC bits, see `crate::monitor::header` |
//! | 2 | the payload length in words |
//!
//! The payload follows. A payload word holds either plain data or a reference; which is which is
//! known only to the type's tracer.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::util::constants::{BYTES_IN_WORD, LOG_BYTES_IN_WORD};
use crate::util::Address;
use crate::vm::ObjectTracer;

pub(crate) const TYPE_WORD: usize = 0;
pub(crate) const HEADER_WORD: usize = 1;
pub(crate) const LENGTH_WORD: usize = 2;
/// The number of words in front of the payload.
pub const OBJECT_HEADER_WORDS: usize = 3;

/// The number of payload words needed for `bytes` bytes.
pub const fn payload_words(bytes: usize) -> usize {
    (bytes + BYTES_IN_WORD - 1) >> LOG_BYTES_IN_WORD
}

/// What the collector needs to know about a type.
///
/// Descriptors are `'static`: an object stores a raw pointer to its descriptor.
pub struct TypeDescriptor {
    pub name: &'static str,
    /// Report every reference held by an object of this type.
    pub trace: fn(ObjectReference, &mut dyn ObjectTracer),
    /// Called once when an object of this type is found unreachable. Must not allocate.
    pub finalize: Option<fn(ObjectReference)>,
}

impl TypeDescriptor {
    /// A tracer for types without references.
    pub fn trace_nothing(_object: ObjectReference, _tracer: &mut dyn ObjectTracer) {}

    /// A tracer for types whose payload words are all references or zero.
    pub fn trace_all_fields(object: ObjectReference, tracer: &mut dyn ObjectTracer) {
        for i in 0..object.payload_len() {
            if let Some(child) = object.get_reference(i) {
                tracer.trace_object(child);
            }
        }
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("name", &self.name)
            .field("finalize", &self.finalize.is_some())
            .finish()
    }
}

/// A reference to a heap object: the address of its first word.
///
/// Accessors read and write the heap region of the runtime that allocated the object. An
/// `ObjectReference` must not be used after that runtime is dropped.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, Hash, PartialOrd, Ord, PartialEq)]
pub struct ObjectReference(NonZeroUsize);

impl ObjectReference {
    /// Cast an address to an object reference. Returns `None` for the zero address.
    ///
    /// # Safety
    /// `addr` must be the start of an object allocated by a live runtime.
    pub unsafe fn from_raw_address(addr: Address) -> Option<ObjectReference> {
        NonZeroUsize::new(addr.as_usize()).map(ObjectReference)
    }

    pub fn to_raw_address(self) -> Address {
        unsafe { Address::from_usize(self.0.get()) }
    }

    pub fn value(self) -> usize {
        self.0.get()
    }

    fn word(self, index: usize) -> &'static AtomicUsize {
        unsafe { (self.to_raw_address() + (index << LOG_BYTES_IN_WORD)).as_atomic_word() }
    }

    pub fn type_descriptor(self) -> &'static TypeDescriptor {
        let ptr = self.word(TYPE_WORD).load(Ordering::Acquire) as *const TypeDescriptor;
        debug_assert!(!ptr.is_null(), "{} has no type", self);
        unsafe { &*ptr }
    }

    /// The header word, shared by the monitor and the collector.
    pub(crate) fn header(self) -> &'static AtomicUsize {
        self.word(HEADER_WORD)
    }

    /// The payload length in words.
    pub fn payload_len(self) -> usize {
        self.word(LENGTH_WORD).load(Ordering::Relaxed)
    }

    fn payload_word(self, index: usize) -> &'static AtomicUsize {
        let len = self.payload_len();
        assert!(
            index < len,
            "Field {} out of bounds for {} with {} fields",
            index,
            self,
            len
        );
        self.word(OBJECT_HEADER_WORDS + index)
    }

    pub fn get_field(self, index: usize) -> usize {
        self.payload_word(index).load(Ordering::Relaxed)
    }

    pub fn set_field(self, index: usize, value: usize) {
        self.payload_word(index).store(value, Ordering::Relaxed)
    }

    pub fn get_reference(self, index: usize) -> Option<ObjectReference> {
        let value = self.payload_word(index).load(Ordering::Acquire);
        NonZeroUsize::new(value).map(ObjectReference)
    }

    pub fn set_reference(self, index: usize, target: Option<ObjectReference>) {
        let value = target.map_or(0, |t| t.value());
        self.payload_word(index).store(value, Ordering::Release)
    }

    /// Write the three header words of a freshly carved object.
    pub(crate) fn initialize(self, ty: &'static TypeDescriptor, header: usize, payload: usize) {
        self.word(TYPE_WORD)
            .store(ty as *const TypeDescriptor as usize, Ordering::Release);
        self.word(HEADER_WORD).store(header, Ordering::Relaxed);
        self.word(LENGTH_WORD).store(payload, Ordering::Relaxed);
    }

    pub(crate) fn set_payload_len(self, payload: usize) {
        self.word(LENGTH_WORD).store(payload, Ordering::Relaxed)
    }

    /// The address of payload word `index`, without a bounds check.
    pub(crate) fn payload_address(self, index: usize) -> Address {
        self.to_raw_address() + ((OBJECT_HEADER_WORDS + index) << LOG_BYTES_IN_WORD)
    }
}

impl fmt::Display for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static LEAF: TypeDescriptor = TypeDescriptor {
        name: "Leaf",
        trace: TypeDescriptor::trace_nothing,
        finalize: None,
    };

    // An object laid out by hand in a word array.
    fn fake_object(storage: &[AtomicUsize]) -> ObjectReference {
        let obj = unsafe { ObjectReference::from_raw_address(Address::from_ref(&storage[0])) }
            .unwrap();
        obj.initialize(&LEAF, 0, storage.len() - OBJECT_HEADER_WORDS);
        obj
    }

    #[test]
    fn payload_words_round_up() {
        assert_eq!(payload_words(0), 0);
        assert_eq!(payload_words(1), 1);
        assert_eq!(payload_words(BYTES_IN_WORD), 1);
        assert_eq!(payload_words(BYTES_IN_WORD + 1), 2);
    }

    #[test]
    fn fields() {
        let storage: Vec<AtomicUsize> = (0..5).map(|_| AtomicUsize::new(0)).collect();
        let obj = fake_object(&storage);
        assert_eq!(obj.payload_len(), 2);
        assert_eq!(obj.type_descriptor().name, "Leaf");
        obj.set_field(0, 42);
        assert_eq!(obj.get_field(0), 42);
        assert_eq!(obj.get_reference(1), None);
        obj.set_reference(1, Some(obj));
        assert_eq!(obj.get_reference(1), Some(obj));
        assert_eq!(storage[4].load(Ordering::SeqCst), obj.value());
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn field_out_of_bounds() {
        let storage: Vec<AtomicUsize> = (0..4).map(|_| AtomicUsize::new(0)).collect();
        let obj = fake_object(&storage);
        obj.get_field(1);
    }

    #[test]
    fn null_address() {
        assert!(unsafe { ObjectReference::from_raw_address(Address::ZERO) }.is_none());
    }
}
