use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread;

use super::{os_thread_table, ThreadControlBlock, ThreadId};
use crate::runtime::Runtime;
use crate::util::os::{self, approximate_stack_pointer};
use crate::util::Address;

/// A thread registered with a [`Runtime`].
///
/// A `Mutator` is the proof that the current thread takes part in rendezvous rounds. Allocation,
/// locking and collection all take one. It cannot be sent to another thread. Dropping it takes the
/// thread out of the registry.
pub struct Mutator {
    runtime: Arc<Runtime>,
    id: ThreadId,
    _not_send: PhantomData<*const ()>,
}

impl Mutator {
    /// Register the current OS thread in slot `id`, which the caller reserved.
    pub(crate) fn bind(runtime: Arc<Runtime>, id: ThreadId, pooled: bool) -> Mutator {
        let registry = runtime.registry();
        let tcb = registry.get(id);
        tcb.pooled.store(pooled, Ordering::SeqCst);
        let key = os::thread::key_of(os::thread::current());
        tcb.os_thread.store(key, Ordering::SeqCst);
        let (low, high) = if pooled {
            let (low, size) = registry.stack(id);
            (low, low + size)
        } else {
            os::thread::current_stack_bounds()
                .unwrap_or((Address::ZERO, approximate_stack_pointer()))
        };
        tcb.stack_low.store(low, Ordering::SeqCst);
        tcb.stack_high.store(high, Ordering::SeqCst);
        os_thread_table::insert(key, tcb, runtime.rendezvous());

        registry.lock.lock(id);
        registry.register(id);
        registry.lock.unlock(id);
        Mutator {
            runtime,
            id,
            _not_send: PhantomData,
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    fn tcb(&self) -> &ThreadControlBlock {
        self.runtime.registry().get(self.id)
    }

    /// Poll for a pending rendezvous. Instrumented code calls this regularly.
    #[inline]
    pub fn safepoint(&self) {
        let tcb = self.tcb();
        if tcb.is_yield_requested() {
            self.runtime.rendezvous().join(tcb);
        }
    }

    /// Is the thread between [`Mutator::enter_native`] and [`Mutator::leave_native`]?
    pub fn is_in_native(&self) -> bool {
        !self.tcb().last_sp().is_zero()
    }

    /// Announce that the thread stops touching the heap, for example before a blocking call.
    /// A rendezvous can complete without the thread until it calls [`Mutator::leave_native`].
    pub fn enter_native(&self) {
        self.runtime
            .rendezvous()
            .join_before_uncooperative(self.tcb())
    }

    /// Come back from native code. Waits for the end of any rendezvous in progress.
    pub fn leave_native(&self) {
        self.runtime
            .rendezvous()
            .join_after_uncooperative(self.tcb())
    }

    /// Run `f` in native mode. `f` must not touch the heap. Nested calls run `f` directly.
    pub fn in_native<R>(&self, f: impl FnOnce() -> R) -> R {
        if self.is_in_native() || self.tcb().is_in_rendezvous() {
            return f();
        }
        self.enter_native();
        let _scope = NativeScope(self);
        f()
    }

    /// Start a thread on a pooled stack and register it with the same runtime.
    ///
    /// If all slots are taken, exited threads are reclaimed and a collection runs before giving
    /// up.
    pub fn spawn<F, T>(&self, f: F) -> JoinHandle<T>
    where
        F: FnOnce(&Mutator) -> T + Send + 'static,
        T: Send + 'static,
    {
        let runtime = self.runtime.clone();
        let id = runtime.reserve_thread_slot(self);
        let (stack, size) = runtime.registry().stack(id);
        let packet: Arc<Mutex<Option<thread::Result<T>>>> = Arc::new(Mutex::new(None));

        let child_runtime = runtime.clone();
        let child_packet = packet.clone();
        let main = Box::new(move || {
            let result = run_spawned(child_runtime, id, f);
            *child_packet.lock().unwrap() = Some(result);
        });

        match os::thread::spawn_on_stack(stack, size, main) {
            Ok(os_thread) => JoinHandle {
                runtime,
                id,
                os_thread,
                packet,
                joined: false,
            },
            Err(e) => {
                runtime.registry().release_slot(id);
                panic!("Failed to start thread {}: {}", id, e)
            }
        }
    }
}

/// The body of a thread started by [`Mutator::spawn`]. The thread entry point must not unwind,
/// so registration and deregistration run under `catch_unwind` together with `f`.
fn run_spawned<F, T>(runtime: Arc<Runtime>, id: ThreadId, f: F) -> thread::Result<T>
where
    F: FnOnce(&Mutator) -> T,
{
    panic::catch_unwind(AssertUnwindSafe(move || {
        let mutator = Mutator::bind(runtime, id, true);
        f(&mutator)
    }))
}

impl Drop for Mutator {
    fn drop(&mut self) {
        let registry = self.runtime.registry();
        let tcb = registry.get(self.id);
        if !self.is_in_native() {
            self.enter_native();
        }
        registry.lock.lock(self.id);
        registry.remove(self.id);
        os_thread_table::remove(tcb.os_thread.load(Ordering::SeqCst));
        tcb.last_sp.store(Address::ZERO, Ordering::SeqCst);
        registry.lock.unlock(self.id);
        if !tcb.pooled.load(Ordering::SeqCst) {
            registry.release_slot(self.id);
        }
    }
}

struct NativeScope<'a>(&'a Mutator);

impl Drop for NativeScope<'_> {
    fn drop(&mut self) {
        self.0.leave_native();
    }
}

/// An owned permission to join a thread started by [`Mutator::spawn`].
///
/// Dropping the handle detaches the thread: its slot is reclaimed by the runtime once it exits.
pub struct JoinHandle<T> {
    runtime: Arc<Runtime>,
    id: ThreadId,
    os_thread: os::thread::OsThread,
    packet: Arc<Mutex<Option<thread::Result<T>>>>,
    joined: bool,
}

impl<T> JoinHandle<T> {
    pub fn thread_id(&self) -> ThreadId {
        self.id
    }

    /// Wait for the thread to finish. Returns `Err` with the panic payload if the thread panicked.
    /// The caller waits in native mode.
    pub fn join(mut self, mutator: &Mutator) -> thread::Result<T> {
        let os_thread = self.os_thread;
        if let Err(e) = mutator.in_native(|| os::thread::join(os_thread)) {
            panic!("Failed to join thread {}: {}", self.id, e);
        }
        self.joined = true;
        self.runtime.registry().free_joined(self.id);
        let result = self.packet.lock().unwrap().take();
        match result {
            Some(result) => result,
            None => panic!("Thread {} exited without a result", self.id),
        }
    }
}

impl<T> Drop for JoinHandle<T> {
    fn drop(&mut self) {
        if !self.joined {
            self.runtime
                .registry()
                .get(self.id)
                .detached
                .store(true, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::runtime_with;
    use crate::vm::NoRoots;

    #[test]
    fn failed_registration_is_returned_as_an_error() {
        let runtime = runtime_with("max_threads=2", Arc::new(NoRoots));
        // There is no slot 2.
        let result = run_spawned(runtime.clone(), ThreadId(2), |_| ());
        assert!(result.is_err());
        assert_eq!(runtime.thread_count(), 0);
    }
}
