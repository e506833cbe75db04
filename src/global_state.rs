use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Collection state of a runtime that is read without the collector lock.
// The counters are written by the thread holding the collector lock and read by anyone, so
// `stats()` may mix values from two collections if it races with one.
pub struct GlobalState {
    /// Collect automatically when the allocation budget runs out.
    pub(crate) auto_collect: AtomicBool,
    /// Nesting depth of `apply_func` and other sections during which no collection may start.
    pub(crate) collection_suspended: AtomicUsize,
    /// Bumped at the end of every collection. A thread that waited for the collector lock uses it
    /// to find out whether someone else already collected.
    pub(crate) epoch: AtomicUsize,
    pub(crate) live_bytes: AtomicUsize,
    pub(crate) last_freed_bytes: AtomicUsize,
    pub(crate) last_freed_objects: AtomicUsize,
    pub(crate) total_freed_objects: AtomicUsize,
    pub(crate) finalizers_run: AtomicUsize,
}

/// A snapshot of collection statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CollectionStats {
    pub collections: usize,
    /// Bytes in used chunks right after the last collection.
    pub live_bytes: usize,
    pub last_freed_bytes: usize,
    pub last_freed_objects: usize,
    pub total_freed_objects: usize,
    pub finalizers_run: usize,
}

impl GlobalState {
    pub fn new(auto_collect: bool) -> Self {
        GlobalState {
            auto_collect: AtomicBool::new(auto_collect),
            collection_suspended: AtomicUsize::new(0),
            epoch: AtomicUsize::new(0),
            live_bytes: AtomicUsize::new(0),
            last_freed_bytes: AtomicUsize::new(0),
            last_freed_objects: AtomicUsize::new(0),
            total_freed_objects: AtomicUsize::new(0),
            finalizers_run: AtomicUsize::new(0),
        }
    }

    pub fn is_auto_collect_enabled(&self) -> bool {
        self.auto_collect.load(Ordering::SeqCst)
    }

    pub fn set_auto_collect(&self, enabled: bool) {
        self.auto_collect.store(enabled, Ordering::SeqCst)
    }

    pub fn is_collection_suspended(&self) -> bool {
        self.collection_suspended.load(Ordering::SeqCst) > 0
    }

    pub(crate) fn suspend_collection(&self) {
        self.collection_suspended.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn resume_collection(&self) {
        let old = self.collection_suspended.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(old > 0, "collection resumed more often than suspended");
    }

    /// The number of collections so far.
    pub fn epoch(&self) -> usize {
        self.epoch.load(Ordering::SeqCst)
    }

    pub(crate) fn record_collection(&self, live_bytes: usize, freed_bytes: usize, freed_objects: usize) {
        self.live_bytes.store(live_bytes, Ordering::SeqCst);
        self.last_freed_bytes.store(freed_bytes, Ordering::SeqCst);
        self.last_freed_objects.store(freed_objects, Ordering::SeqCst);
        self.total_freed_objects
            .fetch_add(freed_objects, Ordering::SeqCst);
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    pub fn stats(&self) -> CollectionStats {
        CollectionStats {
            collections: self.epoch(),
            live_bytes: self.live_bytes.load(Ordering::SeqCst),
            last_freed_bytes: self.last_freed_bytes.load(Ordering::SeqCst),
            last_freed_objects: self.last_freed_objects.load(Ordering::SeqCst),
            total_freed_objects: self.total_freed_objects.load(Ordering::SeqCst),
            finalizers_run: self.finalizers_run.load(Ordering::SeqCst),
        }
    }
}
