//! The interface between the collector and the frontend: the object layout, type descriptors,
//! and root enumeration.

pub mod object_model;
pub mod scanning;

pub use self::object_model::{payload_words, ObjectReference, TypeDescriptor, OBJECT_HEADER_WORDS};
pub use self::scanning::{
    NoRoots, ObjectTracer, RootHandle, RootProvider, RootTable, RootVisitor, ThreadSnapshot,
};
