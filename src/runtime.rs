use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::collector::{object_bytes, Collector, MarkSweepSpace};
use crate::global_state::{CollectionStats, GlobalState};
use crate::monitor::ObjectMonitor;
use crate::rendezvous::{preemption, Rendezvous};
use crate::threads::{os_thread_table, Mutator, ThreadId, ThreadRegistry};
use crate::util::options::Options;
use crate::util::os;
use crate::util::{Address, RuntimeError};
use crate::vm::{payload_words, NoRoots, ObjectReference, RootProvider, TypeDescriptor};

/// What to do after the out-of-memory handler ran.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum OomAction {
    /// The handler released memory. Collect and try once more.
    Retry,
    /// Give up. The allocation panics.
    Fail,
}

/// Called on the allocating thread with the size of the failed request when the heap is full
/// even after a collection.
pub type OomHandler = dyn Fn(&Mutator, usize) -> OomAction + Send + Sync;

/// Build a [`Runtime`].
pub struct RuntimeBuilder {
    /// The options for the runtime.
    pub options: Options,
    root_provider: Arc<dyn RootProvider>,
    oom_handler: Option<Box<OomHandler>>,
}

impl RuntimeBuilder {
    /// Create a builder with options read from `RVGC_*` environment variables.
    pub fn new() -> Self {
        let mut builder = Self::new_no_env_vars();
        builder.options.read_env_var_settings();
        builder
    }

    /// Create a builder with default options, ignoring the environment.
    pub fn new_no_env_vars() -> Self {
        RuntimeBuilder {
            options: Options::default(),
            root_provider: Arc::new(NoRoots),
            oom_handler: None,
        }
    }

    /// Set an option.
    pub fn set_option(&mut self, name: &str, val: &str) -> bool {
        self.options.set_from_str(name, val)
    }

    /// Set multiple options by a string. The string is a whitespace-separated list of
    /// `name=value` pairs.
    pub fn set_options_bulk_by_str(&mut self, options: &str) -> bool {
        self.options.set_bulk_from_str(options)
    }

    pub fn set_root_provider(&mut self, provider: Arc<dyn RootProvider>) -> &mut Self {
        self.root_provider = provider;
        self
    }

    pub fn set_oom_handler(
        &mut self,
        handler: impl Fn(&Mutator, usize) -> OomAction + Send + Sync + 'static,
    ) -> &mut Self {
        self.oom_handler = Some(Box::new(handler));
        self
    }

    /// Reserve the heap and the thread stacks, and install the preemption backend.
    pub fn build(self) -> Result<Arc<Runtime>, RuntimeError> {
        match crate::util::logger::try_init() {
            Ok(_) => debug!("rvgc initialized the logger."),
            Err(_) => debug!(
                "rvgc failed to initialize the logger. Possibly a logger has been initialized by user."
            ),
        }
        let options = self.options;
        options
            .check_consistency()
            .map_err(RuntimeError::InvalidOptions)?;
        let preemption = preemption::create(options.rendezvous)?;
        let registry = ThreadRegistry::new(options.max_threads, options.thread_stack_size)?;
        let space = MarkSweepSpace::new(options.max_heap_size, options.min_heap_size)?;
        #[cfg(feature = "extreme_assertions")]
        warn!("The feature 'extreme_assertions' is enabled. rvgc will run expensive run-time checks.");
        info!(
            "Created a runtime: {} rendezvous, {} bytes of heap, {} thread slots",
            preemption.kind(),
            options.max_heap_size,
            options.max_threads
        );
        Ok(Arc::new(Runtime {
            registry,
            rendezvous: Rendezvous::new(preemption),
            collector: Collector::new(space),
            monitor: ObjectMonitor::new(options.thin_lock_max_recursion),
            state: GlobalState::new(options.auto_collect),
            root_provider: self.root_provider,
            oom_handler: self.oom_handler,
            options,
        }))
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// One garbage-collected world: its threads, its heap, and its object monitors.
///
/// Lock order: the collector lock, then the registry lock, then the rendezvous round mutex. Only a
/// thread holding the collector lock starts a rendezvous.
pub struct Runtime {
    options: Options,
    registry: ThreadRegistry,
    rendezvous: Rendezvous,
    collector: Collector,
    monitor: ObjectMonitor,
    state: GlobalState,
    root_provider: Arc<dyn RootProvider>,
    oom_handler: Option<Box<OomHandler>>,
}

impl Runtime {
    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn registry(&self) -> &ThreadRegistry {
        &self.registry
    }

    pub fn rendezvous(&self) -> &Rendezvous {
        &self.rendezvous
    }

    pub fn monitor(&self) -> &ObjectMonitor {
        &self.monitor
    }

    pub fn global_state(&self) -> &GlobalState {
        &self.state
    }

    /// Register the calling OS thread. Panics if it is already registered with a runtime.
    pub fn attach_current_thread(self: &Arc<Self>) -> Mutator {
        let key = os::thread::key_of(os::thread::current());
        assert!(
            os_thread_table::lookup(key).is_none(),
            "The current thread is already attached to a runtime"
        );
        let id = self
            .registry
            .reserve_slot()
            .or_else(|| {
                self.registry.reclaim_exited();
                self.registry.reserve_slot()
            })
            .unwrap_or_else(|| {
                panic!(
                    "Out of thread slots: all {} slots are in use",
                    self.registry.max_threads()
                )
            });
        Mutator::bind(self.clone(), id, false)
    }

    /// Find a slot for a thread that `mutator` is about to spawn. Exited threads are reclaimed,
    /// then a collection runs, before giving up.
    pub(crate) fn reserve_thread_slot(&self, mutator: &Mutator) -> ThreadId {
        if let Some(id) = self.registry.reserve_slot() {
            return id;
        }
        mutator.in_native(|| self.registry.reclaim_exited());
        if let Some(id) = self.registry.reserve_slot() {
            return id;
        }
        debug!("Out of thread slots. Collecting before retrying.");
        self.collect(mutator);
        mutator.in_native(|| self.registry.reclaim_exited());
        self.registry.reserve_slot().unwrap_or_else(|| {
            panic!(
                "Out of thread slots: all {} slots are in use",
                self.registry.max_threads()
            )
        })
    }

    /// Allocate an object of type `ty` with a zeroed payload of at least `bytes` bytes.
    ///
    /// Collects when the allocation budget has run out. The check comes before the object is
    /// carved, so the allocation that uses up the budget returns normally and the collection
    /// happens at the next allocation. If the heap is full, collects and retries, then asks the
    /// out-of-memory handler. Panics if all of that fails.
    pub fn alloc(&self, mutator: &Mutator, ty: &'static TypeDescriptor, bytes: usize) -> ObjectReference {
        self.alloc_words(mutator, ty, payload_words(bytes))
    }

    fn alloc_words(
        &self,
        mutator: &Mutator,
        ty: &'static TypeDescriptor,
        payload: usize,
    ) -> ObjectReference {
        mutator.safepoint();
        {
            let mut space = self.collector.lock(mutator);
            // Collect before carving, so that the new object cannot be swept before the caller
            // stores it anywhere.
            if self.state.is_auto_collect_enabled() && space.budget_exhausted() {
                self.collect_locked(mutator, &mut space);
            }
            if let Some(object) = space.alloc_object(ty, payload) {
                return object;
            }
            debug!("Heap full. Collecting before retrying.");
            self.collect_locked(mutator, &mut space);
            if let Some(object) = space.alloc_object(ty, payload) {
                return object;
            }
        }

        let bytes = object_bytes(payload);
        if let Some(handler) = &self.oom_handler {
            if handler(mutator, bytes) == OomAction::Retry {
                let mut space = self.collector.lock(mutator);
                self.collect_locked(mutator, &mut space);
                if let Some(object) = space.alloc_object(ty, payload) {
                    return object;
                }
            }
        }
        panic!(
            "Out of memory: cannot allocate {} bytes for a {} in a heap of {} bytes",
            bytes, ty.name, self.options.max_heap_size
        )
    }

    /// Resize `object` to hold `bytes` bytes of payload. Returns `object` itself if its chunk is
    /// large enough. Otherwise returns a copy; the old object is left to the collector and its
    /// finalizer will not run.
    pub fn realloc(&self, mutator: &Mutator, object: ObjectReference, bytes: usize) -> ObjectReference {
        assert!(
            self.monitor.owner(object).is_none(),
            "Thread {} is reallocating a locked object {}",
            mutator.id(),
            object
        );
        let payload = payload_words(bytes);
        let old_len = object.payload_len();
        {
            let mut space = self.collector.lock(mutator);
            let capacity = space
                .capacity(object)
                .unwrap_or_else(|| panic!("{} is not an allocated object", object));
            if payload <= capacity {
                // Words past the length must be zero for a later grow.
                for i in payload..old_len {
                    object.set_field(i, 0);
                }
                object.set_payload_len(payload);
                return object;
            }
            space.pin(object);
        }
        let new = self.alloc_words(mutator, object.type_descriptor(), payload);
        for i in 0..old_len {
            new.set_field(i, object.get_field(i));
        }
        let mut space = self.collector.lock(mutator);
        space.unpin(object);
        space.suppress_finalizer(object);
        new
    }

    /// Run a collection. Returns false if collection is suspended. If another thread collected
    /// while this one waited for the collector lock, returns true without collecting again.
    pub fn collect(&self, mutator: &Mutator) -> bool {
        mutator.safepoint();
        let epoch = self.state.epoch();
        let mut space = self.collector.lock(mutator);
        if self.state.epoch() != epoch {
            debug!("Thread {} found a collection already done", mutator.id());
            return true;
        }
        self.collect_locked(mutator, &mut space)
    }

    fn collect_locked(&self, mutator: &Mutator, space: &mut MarkSweepSpace) -> bool {
        if self.state.is_collection_suspended() {
            debug!("Collection is suspended. Not collecting.");
            return false;
        }
        let me = mutator.id();
        let epoch = self.state.epoch();
        info!("Collection {} started by thread {}", epoch, me);

        self.rendezvous.synchronize(&self.registry, me);
        let snapshots = self.rendezvous.thread_snapshots(&self.registry);
        let mut roots: Vec<Address> = Vec::new();
        {
            let mut visitor = |root: Address| roots.push(root);
            for snapshot in &snapshots {
                self.root_provider.scan_thread_roots(snapshot, &mut visitor);
            }
            self.root_provider.scan_global_roots(&mut visitor);
        }
        space.flip_parity();
        let marked = space.mark(&roots);
        let result = space.sweep(self.options.min_heap_size, self.options.max_heap_size);
        self.rendezvous.finish_rv(&self.registry, me);

        // The dead objects stay untouched until we release the collector lock.
        for object in &result.finalizable {
            if let Some(finalize) = object.type_descriptor().finalize {
                finalize(*object);
            }
        }
        self.state
            .finalizers_run
            .fetch_add(result.finalizable.len(), Ordering::SeqCst);
        for object in &result.inflated {
            self.monitor.retire(*object);
        }

        self.state
            .record_collection(space.live_bytes(), result.freed_bytes, result.freed_objects);
        info!(
            "Collection {} finished: {} roots, {} objects marked, {} bytes live, {} bytes freed in {} objects",
            epoch,
            roots.len(),
            marked,
            space.live_bytes(),
            result.freed_bytes,
            result.freed_objects
        );
        true
    }

    /// Call `f` on every allocated object. No collection starts while this runs, so `f` may
    /// allocate, but an explicit [`Runtime::collect`] returns false.
    pub fn apply_func(&self, mutator: &Mutator, mut f: impl FnMut(ObjectReference)) {
        self.state.suspend_collection();
        let _resume = SuspendedCollection(&self.state);
        let objects = self.collector.lock(mutator).used_objects();
        for object in objects {
            f(object);
        }
    }

    /// Let the allocation budget trigger collections.
    pub fn enable_collection(&self) {
        self.state.set_auto_collect(true)
    }

    /// Stop the allocation budget from triggering collections. Explicit collections still run.
    pub fn disable_collection(&self) {
        self.state.set_auto_collect(false)
    }

    pub fn stats(&self) -> CollectionStats {
        self.state.stats()
    }

    /// The number of registered threads.
    pub fn thread_count(&self) -> usize {
        self.registry.len()
    }

    /// The registered threads, oldest first. Waits in native mode for a rendezvous to finish.
    pub fn thread_ids(&self, mutator: &Mutator) -> Vec<ThreadId> {
        let me = mutator.id();
        mutator.in_native(|| {
            self.registry.lock.lock(me);
            let ids = self.registry.thread_ids();
            self.registry.lock.unlock(me);
            ids
        })
    }

    /// The id of the calling thread, if it is registered with this runtime.
    pub fn current_thread(&self) -> Option<ThreadId> {
        self.registry.current()
    }

    pub fn acquire(&self, mutator: &Mutator, object: ObjectReference) {
        self.monitor.acquire(mutator, object)
    }

    pub fn release(&self, mutator: &Mutator, object: ObjectReference) {
        self.monitor.release(mutator, object)
    }

    pub fn owner(&self, object: ObjectReference) -> Option<ThreadId> {
        self.monitor.owner(object)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.registry.shutdown();
        debug!(
            "Runtime dropped after {} collections",
            self.state.epoch()
        );
    }
}

struct SuspendedCollection<'a>(&'a GlobalState);

impl Drop for SuspendedCollection<'_> {
    fn drop(&mut self) {
        self.0.resume_collection();
    }
}
