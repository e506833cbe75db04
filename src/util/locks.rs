//! Lock primitives with explicit, owner-checked unlocking.
//!
//! Unlike `std::sync::Mutex`, [`LockNormal`] and [`LockRecursive`] do not hand out guards: a lock
//! may be taken in one call and released in another. The registry lock, for example, is held by
//! the initiator of a rendezvous from `synchronize` until `finish_rv`. Every unlock names the
//! thread releasing the lock, and releasing a lock held by someone else is a fatal error.

use std::sync::{Condvar, Mutex};

use crate::threads::ThreadId;

/// A lock that a [`Cond`] can release while waiting and take back afterwards.
pub trait RawLock {
    /// Release the lock completely and return the depth it was held at.
    fn release_all(&self, owner: ThreadId) -> usize;
    /// Take the lock back at the depth returned by `release_all`.
    fn reacquire(&self, owner: ThreadId, depth: usize);
}

/// A blocking, non-recursive lock.
pub struct LockNormal {
    owner: Mutex<Option<ThreadId>>,
    available: Condvar,
}

impl LockNormal {
    pub const fn new() -> Self {
        Self {
            owner: Mutex::new(None),
            available: Condvar::new(),
        }
    }

    pub fn lock(&self, owner: ThreadId) {
        let mut guard = self.owner.lock().unwrap();
        assert_ne!(
            *guard,
            Some(owner),
            "Thread {} locks a non-recursive lock it already holds",
            owner
        );
        while guard.is_some() {
            guard = self.available.wait(guard).unwrap();
        }
        *guard = Some(owner);
    }

    pub fn try_lock(&self, owner: ThreadId) -> bool {
        let mut guard = self.owner.lock().unwrap();
        if guard.is_some() {
            return false;
        }
        *guard = Some(owner);
        true
    }

    pub fn unlock(&self, owner: ThreadId) {
        let mut guard = self.owner.lock().unwrap();
        assert_eq!(
            *guard,
            Some(owner),
            "Thread {} unlocks a lock it does not hold",
            owner
        );
        *guard = None;
        drop(guard);
        self.available.notify_one();
    }

    pub fn owner(&self) -> Option<ThreadId> {
        *self.owner.lock().unwrap()
    }

    pub fn is_held_by(&self, owner: ThreadId) -> bool {
        self.owner() == Some(owner)
    }
}

impl Default for LockNormal {
    fn default() -> Self {
        Self::new()
    }
}

impl RawLock for LockNormal {
    fn release_all(&self, owner: ThreadId) -> usize {
        self.unlock(owner);
        1
    }

    fn reacquire(&self, owner: ThreadId, depth: usize) {
        debug_assert_eq!(depth, 1);
        self.lock(owner);
    }
}

struct RecursiveState {
    owner: Option<ThreadId>,
    depth: usize,
}

/// A blocking lock that its owner may take repeatedly.
pub struct LockRecursive {
    state: Mutex<RecursiveState>,
    available: Condvar,
}

impl LockRecursive {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(RecursiveState {
                owner: None,
                depth: 0,
            }),
            available: Condvar::new(),
        }
    }

    pub fn lock(&self, owner: ThreadId) {
        self.lock_n(owner, 1)
    }

    /// Acquire the lock, adding `n` to its depth.
    pub fn lock_n(&self, owner: ThreadId, n: usize) {
        debug_assert!(n > 0);
        let mut state = self.state.lock().unwrap();
        while state.owner.is_some_and(|o| o != owner) {
            state = self.available.wait(state).unwrap();
        }
        state.owner = Some(owner);
        state.depth += n;
    }

    pub fn try_lock(&self, owner: ThreadId) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.owner.is_some_and(|o| o != owner) {
            return false;
        }
        state.owner = Some(owner);
        state.depth += 1;
        true
    }

    pub fn unlock(&self, owner: ThreadId) {
        let mut state = self.state.lock().unwrap();
        assert_eq!(
            state.owner,
            Some(owner),
            "Thread {} unlocks a recursive lock it does not hold",
            owner
        );
        debug_assert!(state.depth > 0);
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            drop(state);
            self.available.notify_one();
        }
    }

    /// Release every level of the lock. Returns the depth so that [`LockRecursive::relock`] can
    /// restore it.
    pub fn unlock_all(&self, owner: ThreadId) -> usize {
        let mut state = self.state.lock().unwrap();
        assert_eq!(
            state.owner,
            Some(owner),
            "Thread {} unlocks a recursive lock it does not hold",
            owner
        );
        let depth = state.depth;
        state.owner = None;
        state.depth = 0;
        drop(state);
        self.available.notify_one();
        depth
    }

    pub fn relock(&self, owner: ThreadId, depth: usize) {
        self.lock_n(owner, depth)
    }

    pub fn owner(&self) -> Option<ThreadId> {
        self.state.lock().unwrap().owner
    }

    pub fn depth(&self) -> usize {
        self.state.lock().unwrap().depth
    }
}

impl Default for LockRecursive {
    fn default() -> Self {
        Self::new()
    }
}

impl RawLock for LockRecursive {
    fn release_all(&self, owner: ThreadId) -> usize {
        self.unlock_all(owner)
    }

    fn reacquire(&self, owner: ThreadId, depth: usize) {
        self.relock(owner, depth)
    }
}

#[derive(Default)]
struct CondState {
    /// Number of waiters that ever arrived. A waiter's ticket is the value before it arrived.
    arrived: u64,
    /// Waiters with a ticket below this value have been signalled.
    woken: u64,
}

/// A condition variable usable with either [`LockNormal`] or [`LockRecursive`].
///
/// Waiters are woken in arrival order. `signal` wakes exactly one waiter that arrived before the
/// call, if there is any.
#[derive(Default)]
pub struct Cond {
    state: Mutex<CondState>,
    changed: Condvar,
}

impl Cond {
    pub fn new() -> Self {
        Self::default()
    }

    /// Release `lock` completely, block until signalled, then take `lock` back at its previous
    /// depth.
    pub fn wait<L: RawLock>(&self, lock: &L, owner: ThreadId) {
        let mut state = self.state.lock().unwrap();
        let ticket = state.arrived;
        state.arrived += 1;
        // Release while holding our own mutex so that a signal sent right after the release
        // cannot be lost.
        let depth = lock.release_all(owner);
        while state.woken <= ticket {
            state = self.changed.wait(state).unwrap();
        }
        drop(state);
        lock.reacquire(owner, depth);
    }

    pub fn signal(&self) {
        let mut state = self.state.lock().unwrap();
        if state.woken < state.arrived {
            state.woken += 1;
            drop(state);
            self.changed.notify_all();
        }
    }

    pub fn broadcast(&self) {
        let mut state = self.state.lock().unwrap();
        if state.woken < state.arrived {
            state.woken = state.arrived;
            drop(state);
            self.changed.notify_all();
        }
    }

    /// Number of threads currently blocked in [`Cond::wait`].
    pub fn waiters(&self) -> usize {
        let state = self.state.lock().unwrap();
        (state.arrived - state.woken) as usize
    }
}

/// A spin lock for short critical sections that must not park the thread.
pub use spin::{Mutex as SpinLock, MutexGuard as SpinLockGuard};
