//! Object monitors: thin locks in the object header, inflated to fat locks on recursion overflow
//! or contention.
//!
//! An uncontended lock costs one CAS on the header word. A fat lock is created at most once per
//! object and the header never goes back to the thin encoding. Any thread that may block here does
//! so in native mode, so it never holds up a rendezvous.

pub mod fat_lock;
pub mod header;

use crossbeam::utils::Backoff;
use std::sync::Arc;

use self::fat_lock::{FatLock, FatLockTable};
use self::header::{HeaderWord, LockState};
use crate::threads::{Mutator, ThreadId};
use crate::vm::ObjectReference;

pub struct ObjectMonitor {
    table: FatLockTable,
    /// Recursion depth at which the owner inflates a thin lock.
    max_recursion: usize,
}

impl ObjectMonitor {
    pub fn new(max_recursion: usize) -> Self {
        ObjectMonitor {
            table: FatLockTable::new(),
            max_recursion,
        }
    }

    pub fn acquire(&self, mutator: &Mutator, object: ObjectReference) {
        let me = mutator.id();
        let header = HeaderWord::new(object.header());
        let mut contended = false;
        loop {
            let word = header.load();
            match LockState::decode(word) {
                LockState::Unlocked if !contended => {
                    let thin = LockState::Thin {
                        owner: me,
                        count: 1,
                    };
                    if header.transition(word, thin).is_ok() {
                        return;
                    }
                }
                LockState::Unlocked => {
                    if let Some(fat) = self.inflate_unlocked(object, word) {
                        self.acquire_fat(mutator, &fat);
                        return;
                    }
                }
                LockState::Thin { owner, count } if owner == me => {
                    if count < self.max_recursion {
                        let thin = LockState::Thin {
                            owner: me,
                            count: count + 1,
                        };
                        if header.transition(word, thin).is_ok() {
                            return;
                        }
                    } else {
                        self.inflate_owned(object, me, count + 1);
                        return;
                    }
                }
                LockState::Thin { .. } => {
                    contended = true;
                    mutator.in_native(|| {
                        let backoff = Backoff::new();
                        while matches!(header.state(), LockState::Thin { owner, .. } if owner != me)
                        {
                            backoff.snooze();
                        }
                    });
                }
                LockState::Fat { index } => {
                    let fat = self.table.get(index);
                    self.acquire_fat(mutator, &fat);
                    return;
                }
            }
        }
    }

    fn acquire_fat(&self, mutator: &Mutator, fat: &FatLock) {
        let me = mutator.id();
        if !fat.try_acquire(me) {
            mutator.in_native(|| fat.acquire(me));
        }
    }

    /// Swap an unlocked header to the fat encoding. Returns `None` if the header changed.
    fn inflate_unlocked(&self, object: ObjectReference, word: usize) -> Option<Arc<FatLock>> {
        let header = HeaderWord::new(object.header());
        let mut guard = self.table.escalate();
        let index = self.table.lookup_or_create(&mut guard, object);
        header
            .transition(word, LockState::Fat { index })
            .ok()
            .map(|_| {
                debug!("Inflated {} on contention (fat lock {})", object, index);
                self.table.get(index)
            })
    }

    /// Inflate a thin lock held by `me`, ending at recursion depth `depth`.
    fn inflate_owned(&self, object: ObjectReference, me: ThreadId, depth: usize) -> Arc<FatLock> {
        let header = HeaderWord::new(object.header());
        let mut guard = self.table.escalate();
        let index = self.table.lookup_or_create(&mut guard, object);
        let fat = self.table.get(index);
        fat.acquire_n(me, depth);
        loop {
            // Only the collector may touch the header of a thin lock we own, and only its GC bits.
            let word = header.load();
            debug_assert!(matches!(LockState::decode(word), LockState::Thin { owner, .. } if owner == me));
            if header.transition(word, LockState::Fat { index }).is_ok() {
                break;
            }
        }
        drop(guard);
        debug!("Inflated {} at depth {} (fat lock {})", object, depth, index);
        fat
    }

    pub fn release(&self, mutator: &Mutator, object: ObjectReference) {
        let me = mutator.id();
        let header = HeaderWord::new(object.header());
        loop {
            let word = header.load();
            match LockState::decode(word) {
                LockState::Unlocked => {
                    panic!("Thread {}: release of an unlocked object {}", me, object)
                }
                LockState::Thin { owner, count } => {
                    assert_eq!(
                        owner, me,
                        "Thread {}: release by non-owner of {}",
                        me, object
                    );
                    let new = if count == 1 {
                        LockState::Unlocked
                    } else {
                        LockState::Thin {
                            owner: me,
                            count: count - 1,
                        }
                    };
                    if header.transition(word, new).is_ok() {
                        return;
                    }
                }
                LockState::Fat { index } => {
                    self.table.get(index).release(me);
                    return;
                }
            }
        }
    }

    pub fn owner(&self, object: ObjectReference) -> Option<ThreadId> {
        match self.state(object) {
            LockState::Unlocked => None,
            LockState::Thin { owner, .. } => Some(owner),
            LockState::Fat { index } => self.table.get(index).owner(),
        }
    }

    pub fn is_owner(&self, mutator: &Mutator, object: ObjectReference) -> bool {
        self.owner(object) == Some(mutator.id())
    }

    pub fn state(&self, object: ObjectReference) -> LockState {
        HeaderWord::new(object.header()).state()
    }

    /// The fat lock of `object`, if it has been inflated.
    pub fn get_fat_lock(&self, object: ObjectReference) -> Option<Arc<FatLock>> {
        match self.state(object) {
            LockState::Fat { index } => Some(self.table.get(index)),
            _ => None,
        }
    }

    /// The fat lock of an object `me` owns, inflating it first if needed.
    fn owned_fat_lock(&self, me: ThreadId, object: ObjectReference, op: &str) -> Arc<FatLock> {
        match self.state(object) {
            LockState::Thin { owner, count } if owner == me => self.inflate_owned(object, me, count),
            LockState::Fat { index } => {
                let fat = self.table.get(index);
                assert_eq!(
                    fat.owner(),
                    Some(me),
                    "Thread {} calls {} on {}, which it does not own",
                    me,
                    op,
                    object
                );
                fat
            }
            _ => panic!(
                "Thread {} calls {} on {}, which it does not own",
                me, op, object
            ),
        }
    }

    /// Release `object` completely, block until notified, then take it back at the same depth.
    pub fn wait(&self, mutator: &Mutator, object: ObjectReference) {
        let me = mutator.id();
        let fat = self.owned_fat_lock(me, object, "wait");
        mutator.in_native(|| fat.wait(me));
    }

    pub fn notify(&self, mutator: &Mutator, object: ObjectReference) {
        self.notify_inner(mutator, object, false)
    }

    pub fn notify_all(&self, mutator: &Mutator, object: ObjectReference) {
        self.notify_inner(mutator, object, true)
    }

    fn notify_inner(&self, mutator: &Mutator, object: ObjectReference, all: bool) {
        let me = mutator.id();
        let op = if all { "notify_all" } else { "notify" };
        match self.state(object) {
            // Waiting inflates the lock, so a thin lock has no waiters.
            LockState::Thin { owner, .. } if owner == me => {}
            _ => {
                let fat = self.owned_fat_lock(me, object, op);
                if all {
                    fat.notify_all()
                } else {
                    fat.notify()
                }
            }
        }
    }

    /// Forget the fat lock of an object the collector reclaimed.
    pub(crate) fn retire(&self, object: ObjectReference) {
        self.table.retire(object)
    }

    /// The number of fat locks created so far.
    pub fn fat_lock_count(&self) -> usize {
        self.table.created()
    }

    /// The number of objects that currently have a fat lock.
    pub fn inflated_objects(&self) -> usize {
        self.table.len()
    }
}
