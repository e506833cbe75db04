//! Thread identity and the thread registry.
//!
//! Every mutator thread owns one slot of the registry. The slot holds the thread's control block,
//! and the pooled stack with the same index. A thread spawned by the runtime runs on that stack,
//! so its identity can be computed from any address on its stack.

pub mod mutator;
pub(crate) mod os_thread_table;
pub mod registry;
pub(crate) mod stack_pool;

use atomic::Atomic;
use bytemuck::NoUninit;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::util::Address;

pub use self::mutator::{JoinHandle, Mutator};
pub use self::registry::ThreadRegistry;

/// The identity of a mutator thread: the index of its registry slot.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct ThreadId(pub usize);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The lifecycle of a registry slot.
#[repr(u8)]
#[derive(Copy, Clone, PartialEq, Eq, Debug, NoUninit)]
pub enum SlotState {
    /// Nobody uses the slot.
    Free,
    /// The slot is handed to a thread that is being created, or is being reclaimed.
    Reserved,
    /// The thread is registered and in the ring.
    Running,
    /// A pooled thread has left the ring but its OS thread has not been joined yet. Its stack
    /// may still be in use.
    Exited,
}

pub(crate) const NO_THREAD: usize = usize::MAX;

/// The per-thread state shared between a mutator and the rendezvous coordinator.
pub struct ThreadControlBlock {
    id: ThreadId,
    pub(crate) state: Atomic<SlotState>,
    /// Runs on the pooled stack of its slot.
    pub(crate) pooled: AtomicBool,
    /// No [`JoinHandle`] will join this thread. The registry joins it once it exits.
    pub(crate) detached: AtomicBool,
    pub(crate) os_thread: AtomicUsize,
    pub(crate) stack_low: Atomic<Address>,
    pub(crate) stack_high: Atomic<Address>,
    /// Non-zero while the thread is in native code or has joined a rendezvous.
    pub(crate) last_sp: Atomic<Address>,
    /// The stack pointer of the thread when it was counted into the current rendezvous.
    pub(crate) joined_sp: Atomic<Address>,
    /// Set by the initiator of a rendezvous: the thread must join.
    pub(crate) do_yield: AtomicBool,
    /// The thread has been counted into the current rendezvous.
    pub(crate) joined_rv: AtomicBool,
    /// The thread is executing rendezvous logic and must not join recursively.
    pub(crate) in_rv: AtomicBool,
    // Ring links, as slot indices. Only changed with the registry lock held.
    pub(crate) next: AtomicUsize,
    pub(crate) prev: AtomicUsize,
}

impl ThreadControlBlock {
    pub(crate) fn new(id: ThreadId) -> Self {
        Self {
            id,
            state: Atomic::new(SlotState::Free),
            pooled: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            os_thread: AtomicUsize::new(0),
            stack_low: Atomic::new(Address::ZERO),
            stack_high: Atomic::new(Address::ZERO),
            last_sp: Atomic::new(Address::ZERO),
            joined_sp: Atomic::new(Address::ZERO),
            do_yield: AtomicBool::new(false),
            joined_rv: AtomicBool::new(false),
            in_rv: AtomicBool::new(false),
            next: AtomicUsize::new(NO_THREAD),
            prev: AtomicUsize::new(NO_THREAD),
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn state(&self) -> SlotState {
        self.state.load(Ordering::SeqCst)
    }

    /// The published stack pointer. Zero unless the thread is in native code or has joined.
    pub fn last_sp(&self) -> Address {
        self.last_sp.load(Ordering::SeqCst)
    }

    pub fn is_yield_requested(&self) -> bool {
        self.do_yield.load(Ordering::SeqCst)
    }

    pub fn has_joined(&self) -> bool {
        self.joined_rv.load(Ordering::SeqCst)
    }

    pub fn is_in_rendezvous(&self) -> bool {
        self.in_rv.load(Ordering::SeqCst)
    }

    /// Clear the per-thread flags before the slot is handed to a new thread.
    pub(crate) fn reset(&self) {
        self.last_sp.store(Address::ZERO, Ordering::SeqCst);
        self.joined_sp.store(Address::ZERO, Ordering::SeqCst);
        self.do_yield.store(false, Ordering::SeqCst);
        self.joined_rv.store(false, Ordering::SeqCst);
        self.in_rv.store(false, Ordering::SeqCst);
        self.detached.store(false, Ordering::SeqCst);
    }
}
