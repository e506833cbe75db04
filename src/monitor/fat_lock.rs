use spin::{Mutex, MutexGuard, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::threads::ThreadId;
use crate::util::locks::{Cond, LockRecursive};
use crate::util::Address;
use crate::vm::ObjectReference;

/// The inflated form of an object lock: a blocking recursive lock with a condition variable for
/// `wait`/`notify`.
#[derive(Default)]
pub struct FatLock {
    lock: LockRecursive,
    cond: Cond,
}

impl FatLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the lock is ours, then add one to its depth.
    pub fn acquire(&self, owner: ThreadId) {
        self.lock.lock(owner)
    }

    pub fn try_acquire(&self, owner: ThreadId) -> bool {
        self.lock.try_lock(owner)
    }

    /// Acquire at depth `depth`. Used when a thin lock is inflated by its owner.
    pub(crate) fn acquire_n(&self, owner: ThreadId, depth: usize) {
        self.lock.lock_n(owner, depth)
    }

    pub fn release(&self, owner: ThreadId) {
        match self.lock.owner() {
            None => panic!(
                "Thread {}: release of an unlocked object (fat lock)",
                owner
            ),
            Some(holder) if holder != owner => panic!(
                "Thread {}: release by non-owner of a fat lock held by {}",
                owner, holder
            ),
            Some(_) => self.lock.unlock(owner),
        }
    }

    pub fn owner(&self) -> Option<ThreadId> {
        self.lock.owner()
    }

    /// The recursion depth. Zero when unlocked.
    pub fn depth(&self) -> usize {
        self.lock.depth()
    }

    /// Release every level, wait for a notification and take the lock back at the same depth.
    pub fn wait(&self, owner: ThreadId) {
        self.cond.wait(&self.lock, owner)
    }

    pub fn notify(&self) {
        self.cond.signal()
    }

    pub fn notify_all(&self) {
        self.cond.broadcast()
    }

    pub fn waiters(&self) -> usize {
        self.cond.waiters()
    }
}

#[derive(Default)]
pub(crate) struct Escalation {
    /// The fat lock of each inflated object, by object address.
    by_object: HashMap<Address, usize>,
    /// Table indices whose object died.
    free: Vec<usize>,
}

/// All fat locks of a runtime. A header in the fat state stores an index into this table.
pub struct FatLockTable {
    locks: RwLock<Vec<Arc<FatLock>>>,
    escalation: Mutex<Escalation>,
    created: AtomicUsize,
}

impl FatLockTable {
    pub fn new() -> Self {
        FatLockTable {
            locks: RwLock::new(Vec::new()),
            escalation: Mutex::new(Escalation::default()),
            created: AtomicUsize::new(0),
        }
    }

    pub fn get(&self, index: usize) -> Arc<FatLock> {
        self.locks.read()[index].clone()
    }

    /// Take the escalation guard. Every thin-to-fat transition happens while holding it.
    pub(crate) fn escalate(&self) -> MutexGuard<'_, Escalation> {
        self.escalation.lock()
    }

    /// Find the fat lock of `object`, or create one. There is at most one fat lock per object.
    pub(crate) fn lookup_or_create(
        &self,
        guard: &mut MutexGuard<'_, Escalation>,
        object: ObjectReference,
    ) -> usize {
        let addr = object.to_raw_address();
        if let Some(&index) = guard.by_object.get(&addr) {
            return index;
        }
        let lock = Arc::new(FatLock::new());
        let index = {
            let mut locks = self.locks.write();
            match guard.free.pop() {
                Some(index) => {
                    locks[index] = lock;
                    index
                }
                None => {
                    locks.push(lock);
                    locks.len() - 1
                }
            }
        };
        guard.by_object.insert(addr, index);
        self.created.fetch_add(1, Ordering::SeqCst);
        trace!("Created fat lock {} for {}", index, object);
        index
    }

    /// Forget the fat lock of a dead object. Its index may be reused.
    pub(crate) fn retire(&self, object: ObjectReference) {
        let mut guard = self.escalation.lock();
        if let Some(index) = guard.by_object.remove(&object.to_raw_address()) {
            guard.free.push(index);
            trace!("Retired fat lock {} of {}", index, object);
        }
    }

    /// The number of fat locks associated with an object right now.
    pub fn len(&self) -> usize {
        self.escalation.lock().by_object.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The number of fat locks ever created.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl Default for FatLockTable {
    fn default() -> Self {
        Self::new()
    }
}
