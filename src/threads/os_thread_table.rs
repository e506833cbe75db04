//! A process-wide map from OS thread handles to control blocks.
//!
//! The suspension signal handler uses this table to find the interrupted thread and the rendezvous
//! it belongs to. It is the only process-wide state besides the signal disposition. The table is
//! lock-free. Each thread only inserts and removes its own entry, so the handler, which runs on
//! that same thread, never sees a half-written entry.

use std::ptr::null_mut;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use super::ThreadControlBlock;
use crate::rendezvous::Rendezvous;
use crate::util::constants::MAX_THREADS_LIMIT;

const TABLE_SIZE: usize = 4 * MAX_THREADS_LIMIT;
const CLAIMED: usize = usize::MAX;

struct Entry {
    key: AtomicUsize,
    tcb: AtomicPtr<ThreadControlBlock>,
    rendezvous: AtomicPtr<Rendezvous>,
}

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY: Entry = Entry {
    key: AtomicUsize::new(0),
    tcb: AtomicPtr::new(null_mut()),
    rendezvous: AtomicPtr::new(null_mut()),
};

static TABLE: [Entry; TABLE_SIZE] = [EMPTY; TABLE_SIZE];

/// Map `key`, the handle of the current OS thread, to a control block.
///
/// The pointers must stay valid until [`remove`] is called for `key`.
pub(crate) fn insert(key: usize, tcb: *const ThreadControlBlock, rendezvous: *const Rendezvous) {
    debug_assert!(key != 0 && key != CLAIMED);
    debug_assert!(lookup(key).is_none(), "thread {:#x} inserted twice", key);
    for entry in TABLE.iter() {
        if entry
            .key
            .compare_exchange(0, CLAIMED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            entry.tcb.store(tcb as *mut _, Ordering::SeqCst);
            entry
                .rendezvous
                .store(rendezvous as *mut _, Ordering::SeqCst);
            entry.key.store(key, Ordering::SeqCst);
            return;
        }
    }
    panic!("More than {} threads attached to runtimes", TABLE_SIZE);
}

pub(crate) fn remove(key: usize) {
    for entry in TABLE.iter() {
        if entry.key.load(Ordering::SeqCst) == key {
            entry.key.store(CLAIMED, Ordering::SeqCst);
            entry.tcb.store(null_mut(), Ordering::SeqCst);
            entry.rendezvous.store(null_mut(), Ordering::SeqCst);
            entry.key.store(0, Ordering::SeqCst);
            return;
        }
    }
    debug_assert!(false, "thread {:#x} is not in the table", key);
}

/// Find the control block of the OS thread `key`. Async-signal-safe.
pub(crate) fn lookup(key: usize) -> Option<(*const ThreadControlBlock, *const Rendezvous)> {
    for entry in TABLE.iter() {
        if entry.key.load(Ordering::SeqCst) == key {
            let tcb = entry.tcb.load(Ordering::SeqCst);
            let rendezvous = entry.rendezvous.load(Ordering::SeqCst);
            if tcb.is_null() || rendezvous.is_null() {
                return None;
            }
            return Some((tcb, rendezvous));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::threads::ThreadId;

    #[test]
    fn insert_lookup_remove() {
        // Made-up keys that are not real thread handles.
        let tcb = ThreadControlBlock::new(ThreadId(3));
        let rendezvous = std::ptr::NonNull::<Rendezvous>::dangling().as_ptr();
        let key = 0x5eed_0001;
        assert!(lookup(key).is_none());
        insert(key, &tcb, rendezvous);
        let (found, rv) = lookup(key).unwrap();
        assert_eq!(unsafe { (*found).id() }, ThreadId(3));
        assert_eq!(rv, rendezvous as *const _);
        remove(key);
        assert!(lookup(key).is_none());
    }
}
