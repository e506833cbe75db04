//! rvgc is the thread and memory core of a small managed runtime.
//!
//! It provides:
//! * a registry of mutator threads running on pooled, size-aligned stacks,
//! * stop-the-world rendezvous, where threads join by polling or are stopped by a signal,
//! * per-object monitors with thin locks in the object header and fat locks on demand,
//! * a non-moving mark-sweep collector with a chunk allocator.
//!
//! A [`Runtime`] owns all of the above. Create one with a [`RuntimeBuilder`], then register
//! threads with [`Runtime::attach_current_thread`] or spawn them with [`Mutator::spawn`]. The
//! functions in [`memory_manager`] are a flat API over the same operations.
//!
//! The frontend describes its object types with [`TypeDescriptor`]s and reports roots through a
//! [`RootProvider`](vm::RootProvider).

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;

pub mod collector;
pub mod global_state;
pub mod memory_manager;
pub mod monitor;
pub mod rendezvous;
pub mod runtime;
pub mod threads;
pub mod util;
pub mod vm;

pub use crate::global_state::CollectionStats;
pub use crate::runtime::{OomAction, Runtime, RuntimeBuilder};
pub use crate::threads::{JoinHandle, Mutator, ThreadId};
pub use crate::util::{Address, RuntimeError};
pub use crate::vm::{ObjectReference, TypeDescriptor};
