//! Frontend-to-rvgc interface: a flat API over [`Runtime`].
//!
//! We expect a frontend to inherit and extend this API by:
//! 1. adding their language-specific functions,
//! 2. exposing the functions to native code if necessary. The frontend then has to manage the
//!    unsafety of handing [`Mutator`]s and [`ObjectReference`]s across the FFI boundary.
//!
//! Every function that may block or collect takes the calling thread's [`Mutator`].

use std::sync::Arc;

use crate::global_state::CollectionStats;
use crate::runtime::{Runtime, RuntimeBuilder};
use crate::threads::{JoinHandle, Mutator, ThreadId};
use crate::vm::{ObjectReference, TypeDescriptor};

/// Create a runtime. Setup failures are fatal.
///
/// We expect a frontend to initialize rvgc in the following steps:
///
/// 1. Create a [`RuntimeBuilder`] with [`RuntimeBuilder::new`], which reads `RVGC_*` environment
///    variables.
/// 2. Set options with [`process`] or [`process_bulk`], and set the root provider.
/// 3. Call this function.
/// 4. Register the main thread with [`attach_current_thread`].
///
/// Note that this method will attempt to initialize a logger. If the frontend would like to use
/// its own logger, it should initialize the logger before calling this method.
///
/// Arguments:
/// * `builder`: The builder holding the options.
pub fn runtime_init(builder: RuntimeBuilder) -> Arc<Runtime> {
    match builder.build() {
        Ok(runtime) => runtime,
        Err(e) => panic!("Failed to initialize rvgc: {}", e),
    }
}

/// Process an rvgc option. Returns true if the option is processed successfully.
///
/// Arguments:
/// * `builder`: The builder to set the option on.
/// * `name`: The name of the option.
/// * `value`: The value of the option (as a string).
pub fn process(builder: &mut RuntimeBuilder, name: &str, value: &str) -> bool {
    builder.set_option(name, value)
}

/// Process multiple options. Returns true if all the options are processed successfully.
///
/// Arguments:
/// * `builder`: The builder to set the options on.
/// * `options`: a string that is key value pairs separated by white spaces, e.g.
///   "max_threads=8 rendezvous=uncooperative"
pub fn process_bulk(builder: &mut RuntimeBuilder, options: &str) -> bool {
    builder.set_options_bulk_by_str(options)
}

/// Register the calling thread with a runtime. The thread is deregistered when the returned
/// mutator is dropped.
pub fn attach_current_thread(runtime: &Arc<Runtime>) -> Mutator {
    runtime.attach_current_thread()
}

/// Deregister a thread.
pub fn detach_current_thread(mutator: Mutator) {
    drop(mutator);
}

/// Start a registered thread on a pooled stack.
///
/// Arguments:
/// * `mutator`: The calling thread.
/// * `f`: The thread body. It receives the new thread's mutator.
pub fn spawn_thread<F, T>(mutator: &Mutator, f: F) -> JoinHandle<T>
where
    F: FnOnce(&Mutator) -> T + Send + 'static,
    T: Send + 'static,
{
    mutator.spawn(f)
}

/// Poll for a pending rendezvous. Instrumented code should call this at loop back-edges and
/// method entries.
#[inline(always)]
pub fn safepoint(mutator: &Mutator) {
    mutator.safepoint()
}

/// Announce that the calling thread enters code that does not touch the heap.
pub fn enter_native(mutator: &Mutator) {
    mutator.enter_native()
}

/// Announce that the calling thread comes back from native code.
pub fn leave_native(mutator: &Mutator) {
    mutator.leave_native()
}

/// The id of the calling thread, if it is registered with `runtime`.
pub fn current_thread(runtime: &Runtime) -> Option<ThreadId> {
    runtime.current_thread()
}

/// Allocate an object.
///
/// Arguments:
/// * `mutator`: The calling thread.
/// * `ty`: The type of the object.
/// * `size`: The number of payload bytes. The payload is zeroed.
pub fn alloc(mutator: &Mutator, ty: &'static TypeDescriptor, size: usize) -> ObjectReference {
    mutator.runtime().alloc(mutator, ty, size)
}

/// Resize an object. The result may be a different object holding a copy of the payload.
///
/// Arguments:
/// * `mutator`: The calling thread.
/// * `object`: The object to resize. It must not be locked.
/// * `size`: The new number of payload bytes.
pub fn realloc(mutator: &Mutator, object: ObjectReference, size: usize) -> ObjectReference {
    mutator.runtime().realloc(mutator, object, size)
}

/// Trigger a collection. Returns false if collection is suspended by [`apply_func`].
pub fn handle_user_collection_request(mutator: &Mutator) -> bool {
    mutator.runtime().collect(mutator)
}

/// Call `f` on every allocated object. No collection happens meanwhile.
pub fn apply_func(mutator: &Mutator, f: impl FnMut(ObjectReference)) {
    mutator.runtime().apply_func(mutator, f)
}

/// Allow the allocation budget to trigger collections.
pub fn enable_collection(runtime: &Runtime) {
    runtime.enable_collection()
}

/// Stop the allocation budget from triggering collections.
pub fn disable_collection(runtime: &Runtime) {
    runtime.disable_collection()
}

/// Collection statistics.
pub fn collection_stats(runtime: &Runtime) -> CollectionStats {
    runtime.stats()
}

/// Lock an object's monitor. Blocks in native mode if another thread holds it.
pub fn monitor_enter(mutator: &Mutator, object: ObjectReference) {
    mutator.runtime().monitor().acquire(mutator, object)
}

/// Unlock an object's monitor. Panics if the calling thread does not hold it.
pub fn monitor_exit(mutator: &Mutator, object: ObjectReference) {
    mutator.runtime().monitor().release(mutator, object)
}

/// Release an object's monitor, wait for a notification and lock it again.
pub fn monitor_wait(mutator: &Mutator, object: ObjectReference) {
    mutator.runtime().monitor().wait(mutator, object)
}

pub fn monitor_notify(mutator: &Mutator, object: ObjectReference) {
    mutator.runtime().monitor().notify(mutator, object)
}

pub fn monitor_notify_all(mutator: &Mutator, object: ObjectReference) {
    mutator.runtime().monitor().notify_all(mutator, object)
}

/// The thread holding an object's monitor.
pub fn monitor_owner(runtime: &Runtime, object: ObjectReference) -> Option<ThreadId> {
    runtime.monitor().owner(object)
}
