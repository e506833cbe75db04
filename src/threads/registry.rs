use std::sync::atomic::{AtomicUsize, Ordering};

use super::os_thread_table;
use super::stack_pool::StackPool;
use super::{SlotState, ThreadControlBlock, ThreadId, NO_THREAD};
use crate::util::locks::LockNormal;
use crate::util::os::{self, approximate_stack_pointer};
use crate::util::{Address, RuntimeError};

/// The set of live mutator threads.
///
/// Registered threads form a circular doubly linked ring threaded through their control blocks.
/// The ring is guarded by [`ThreadRegistry::lock`]. The initiator of a rendezvous holds that lock
/// for the whole round, so threads cannot come or go while the world is stopped.
pub struct ThreadRegistry {
    pub(crate) lock: LockNormal,
    slots: Box<[ThreadControlBlock]>,
    head: AtomicUsize,
    count: AtomicUsize,
    stacks: StackPool,
}

impl ThreadRegistry {
    pub fn new(max_threads: usize, stack_size: usize) -> Result<Self, RuntimeError> {
        let stacks =
            StackPool::new(max_threads, stack_size).map_err(RuntimeError::StackReservation)?;
        let slots = (0..max_threads)
            .map(|i| ThreadControlBlock::new(ThreadId(i)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Ok(ThreadRegistry {
            lock: LockNormal::new(),
            slots,
            head: AtomicUsize::new(NO_THREAD),
            count: AtomicUsize::new(0),
            stacks,
        })
    }

    pub fn max_threads(&self) -> usize {
        self.slots.len()
    }

    pub fn get(&self, id: ThreadId) -> &ThreadControlBlock {
        &self.slots[id.0]
    }

    /// The number of threads in the ring.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The usable range of the pooled stack of a slot.
    pub(crate) fn stack(&self, id: ThreadId) -> (Address, usize) {
        self.stacks.stack(id.0)
    }

    /// Hand out a free slot, if there is one.
    pub fn reserve_slot(&self) -> Option<ThreadId> {
        self.slots.iter().find_map(|slot| {
            slot.state
                .compare_exchange(
                    SlotState::Free,
                    SlotState::Reserved,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .ok()
                .map(|_| {
                    slot.reset();
                    slot.id()
                })
        })
    }

    /// Give back a reserved slot that was never registered.
    pub fn release_slot(&self, id: ThreadId) {
        let slot = self.get(id);
        let old = slot.state.swap(SlotState::Free, Ordering::SeqCst);
        assert_eq!(old, SlotState::Reserved, "Slot {} released while {:?}", id, old);
    }

    /// Insert a thread into the ring. The caller must hold the registry lock.
    pub fn register(&self, id: ThreadId) {
        assert!(
            self.lock.owner().is_some(),
            "Thread {} registered without the registry lock",
            id
        );
        let slot = self.get(id);
        assert_eq!(slot.state(), SlotState::Reserved, "Thread {} registered twice", id);
        let head = self.head.load(Ordering::SeqCst);
        if head == NO_THREAD {
            slot.next.store(id.0, Ordering::SeqCst);
            slot.prev.store(id.0, Ordering::SeqCst);
            self.head.store(id.0, Ordering::SeqCst);
        } else {
            // Insert before the head, that is, at the tail of the ring.
            let tail = self.slots[head].prev.load(Ordering::SeqCst);
            slot.next.store(head, Ordering::SeqCst);
            slot.prev.store(tail, Ordering::SeqCst);
            self.slots[tail].next.store(id.0, Ordering::SeqCst);
            self.slots[head].prev.store(id.0, Ordering::SeqCst);
        }
        slot.state.store(SlotState::Running, Ordering::SeqCst);
        self.count.fetch_add(1, Ordering::SeqCst);
        debug!("Registered thread {} ({} threads)", id, self.len());
    }

    /// Take a thread out of the ring. The caller must hold the registry lock.
    ///
    /// The slot of a pooled thread goes to [`SlotState::Exited`]: its stack is still in use until
    /// the OS thread is joined. The slot of an attached thread is left `Reserved` for the caller
    /// to free once it has released the registry lock.
    pub fn remove(&self, id: ThreadId) {
        assert!(
            self.lock.owner().is_some(),
            "Thread {} removed without the registry lock",
            id
        );
        let slot = self.get(id);
        assert_eq!(slot.state(), SlotState::Running, "Thread {} is not registered", id);
        let next = slot.next.load(Ordering::SeqCst);
        let prev = slot.prev.load(Ordering::SeqCst);
        if next == id.0 {
            debug_assert_eq!(self.head.load(Ordering::SeqCst), id.0);
            self.head.store(NO_THREAD, Ordering::SeqCst);
        } else {
            self.slots[prev].next.store(next, Ordering::SeqCst);
            self.slots[next].prev.store(prev, Ordering::SeqCst);
            if self.head.load(Ordering::SeqCst) == id.0 {
                self.head.store(next, Ordering::SeqCst);
            }
        }
        slot.next.store(NO_THREAD, Ordering::SeqCst);
        slot.prev.store(NO_THREAD, Ordering::SeqCst);
        let new_state = if slot.pooled.load(Ordering::SeqCst) {
            SlotState::Exited
        } else {
            SlotState::Reserved
        };
        slot.state.store(new_state, Ordering::SeqCst);
        self.count.fetch_sub(1, Ordering::SeqCst);
        debug!("Removed thread {} ({} threads)", id, self.len());
    }

    /// Visit every thread in the ring, starting from the oldest. The caller must hold the
    /// registry lock.
    pub fn for_each(&self, mut f: impl FnMut(&ThreadControlBlock)) {
        debug_assert!(self.lock.owner().is_some());
        let head = self.head.load(Ordering::SeqCst);
        if head == NO_THREAD {
            return;
        }
        let mut cur = head;
        loop {
            let slot = &self.slots[cur];
            f(slot);
            cur = slot.next.load(Ordering::SeqCst);
            if cur == head {
                break;
            }
        }
    }

    /// The threads in the ring. The caller must hold the registry lock.
    pub fn thread_ids(&self) -> Vec<ThreadId> {
        let mut ids = Vec::with_capacity(self.len());
        self.for_each(|t| ids.push(t.id()));
        ids
    }

    /// Find the running thread that executes this call.
    ///
    /// A thread spawned by the runtime is identified by its stack address alone. Attached threads
    /// run on their own stacks, and are looked up by their OS thread handle.
    pub fn current(&self) -> Option<ThreadId> {
        let sp = approximate_stack_pointer();
        if let Some(index) = self.stacks.index_of(sp) {
            let slot = &self.slots[index];
            if slot.state() == SlotState::Running && slot.pooled.load(Ordering::SeqCst) {
                return Some(ThreadId(index));
            }
            return None;
        }
        let (tcb, _) = os_thread_table::lookup(os::thread::key_of(os::thread::current()))?;
        let first = Address::from_ptr(self.slots.as_ptr());
        let tcb = Address::from_ptr(tcb);
        let size = std::mem::size_of::<ThreadControlBlock>();
        if tcb < first || tcb >= first + self.slots.len() * size {
            // Attached to another runtime.
            return None;
        }
        Some(ThreadId((tcb - first) / size))
    }

    /// Is `addr` on one of the pooled stacks?
    pub fn is_pooled_stack(&self, addr: Address) -> bool {
        self.stacks.contains(addr)
    }

    /// Join the OS threads of exited pooled threads that nobody else will join, and make their
    /// slots free. Returns the number of reclaimed slots.
    pub fn reclaim_exited(&self) -> usize {
        let mut reclaimed = 0;
        for slot in self.slots.iter() {
            if slot.state() != SlotState::Exited || !slot.detached.load(Ordering::SeqCst) {
                continue;
            }
            // Claim the slot so that no one else joins the same thread.
            if slot
                .state
                .compare_exchange(
                    SlotState::Exited,
                    SlotState::Reserved,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_err()
            {
                continue;
            }
            let thread = os::thread::from_key(slot.os_thread.load(Ordering::SeqCst));
            if let Err(e) = os::thread::join(thread) {
                warn!("Failed to join exited thread {}: {}", slot.id(), e);
            }
            slot.state.store(SlotState::Free, Ordering::SeqCst);
            reclaimed += 1;
        }
        if reclaimed > 0 {
            debug!("Reclaimed {} thread slots", reclaimed);
        }
        reclaimed
    }

    /// Make the slot of a joined pooled thread free.
    pub(crate) fn free_joined(&self, id: ThreadId) {
        let slot = self.get(id);
        let old = slot.state.swap(SlotState::Free, Ordering::SeqCst);
        assert_eq!(old, SlotState::Exited, "Thread {} joined while {:?}", id, old);
    }

    /// Tear down: join exited threads and decide what happens to the stack pool.
    pub(crate) fn shutdown(&mut self) {
        for slot in self.slots.iter() {
            if slot.state() == SlotState::Exited {
                slot.detached.store(true, Ordering::SeqCst);
            }
        }
        let sp = approximate_stack_pointer();
        if let Some(index) = self.stacks.index_of(sp) {
            // The last reference to the runtime was dropped by a pooled thread on its way out. We
            // cannot join ourselves or unmap the stack we are running on.
            self.slots[index].detached.store(false, Ordering::SeqCst);
            self.reclaim_exited();
            if let Err(e) = os::thread::detach(os::thread::current()) {
                warn!("Failed to detach thread {}: {}", index, e);
            }
            self.stacks.leak();
            return;
        }
        self.reclaim_exited();
    }
}
