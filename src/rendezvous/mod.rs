//! Stop-the-world rendezvous.
//!
//! A round goes through the phases of [`Phase`]:
//!
//! 1. The initiator takes the registry lock. It holds the lock until [`Rendezvous::finish_rv`].
//! 2. It raises `do_yield` on every registered thread. Then it counts as joined every thread that
//!    has published a stack pointer, because those threads are in native code and cannot touch
//!    the heap without passing through [`Rendezvous::join_after_uncooperative`].
//! 3. The remaining threads join at their next safepoint poll or native-code transition. With the
//!    uncooperative strategy they are also sent the suspension signal and join from the handler.
//! 4. Once the joined count equals the thread count the world is stopped. The initiator collects,
//!    then calls `finish_rv`, which clears every flag, releases the registry lock and wakes all
//!    waiting threads.
//!
//! A thread decides whether it must join by storing its stack pointer and then loading
//! `do_yield`. The initiator stores `do_yield` and then loads the stack pointer. Both sides use
//! sequentially consistent operations, so at least one of them sees the other's store. A thread
//! is counted exactly once per round because counting it requires winning the `joined_rv` CAS.

pub mod preemption;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::threads::{ThreadControlBlock, ThreadId, ThreadRegistry};
use crate::util::os::{approximate_stack_pointer, signal};
use crate::util::Address;
use crate::vm::ThreadSnapshot;

pub use self::preemption::{PollingPreemption, Preemption};
#[cfg(target_os = "linux")]
pub use self::preemption::SignalPreemption;

/// The phase of the current rendezvous round.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Phase {
    /// No round is active.
    Idle,
    /// The initiator holds the registry lock and is raising `do_yield`.
    Initiating,
    /// Waiting for the remaining threads to join.
    AwaitingJoins,
    /// Every thread has joined. The initiator may inspect the stopped threads.
    AllJoined,
    /// The initiator is clearing the round.
    Finishing,
}

struct RoundState {
    phase: Phase,
    initiator: Option<ThreadId>,
}

/// How long the initiator sleeps between checks of the joined count. Threads that join from the
/// signal handler cannot notify a condition variable, so the initiator polls.
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(1);
/// How long a thread stopped by the signal handler sleeps between checks of `do_yield`.
const SIGNAL_WAIT_NANOS: libc::c_long = 100_000;

pub struct Rendezvous {
    preemption: Box<dyn Preemption>,
    round: Mutex<RoundState>,
    /// Signalled when a thread joins.
    cond_initiator: Condvar,
    /// Broadcast when the round ends.
    cond_end_of_rv: Condvar,
    nb_joined: AtomicUsize,
    /// The number of threads in the current round.
    expected: AtomicUsize,
    rounds: AtomicUsize,
}

impl Rendezvous {
    pub fn new(preemption: Box<dyn Preemption>) -> Self {
        Self {
            preemption,
            round: Mutex::new(RoundState {
                phase: Phase::Idle,
                initiator: None,
            }),
            cond_initiator: Condvar::new(),
            cond_end_of_rv: Condvar::new(),
            nb_joined: AtomicUsize::new(0),
            expected: AtomicUsize::new(0),
            rounds: AtomicUsize::new(0),
        }
    }

    pub fn preemption(&self) -> &dyn Preemption {
        &*self.preemption
    }

    pub fn phase(&self) -> Phase {
        self.round.lock().unwrap().phase
    }

    /// The number of threads that joined the current round so far.
    pub fn joined(&self) -> usize {
        self.nb_joined.load(Ordering::SeqCst)
    }

    /// The number of completed rounds.
    pub fn rounds(&self) -> usize {
        self.rounds.load(Ordering::SeqCst)
    }

    /// Bring every registered thread to a safe point. On return the caller holds the registry
    /// lock and every other thread is either parked or in native code.
    pub fn synchronize(&self, registry: &ThreadRegistry, me: ThreadId) {
        let tcb = registry.get(me);
        assert!(
            !tcb.is_in_rendezvous(),
            "Thread {} starts a rendezvous from inside a rendezvous",
            me
        );
        tcb.in_rv.store(true, Ordering::SeqCst);
        registry.lock.lock(me);

        {
            let mut round = self.round.lock().unwrap();
            assert_eq!(
                round.phase,
                Phase::Idle,
                "Thread {} starts a rendezvous while another one is active",
                me
            );
            round.phase = Phase::Initiating;
            round.initiator = Some(me);
        }

        let total = registry.len();
        assert!(
            total > 0 && tcb.state() == crate::threads::SlotState::Running,
            "Thread {} is not registered",
            me
        );
        debug_assert_eq!(self.nb_joined.load(Ordering::SeqCst), 0);
        self.expected.store(total, Ordering::SeqCst);
        debug!("Rendezvous initiated by {} for {} threads", me, total);

        registry.for_each(|t| t.do_yield.store(true, Ordering::SeqCst));
        tcb.joined_sp
            .store(approximate_stack_pointer(), Ordering::SeqCst);
        tcb.joined_rv.store(true, Ordering::SeqCst);

        let mut pending = Vec::with_capacity(total);
        {
            let mut round = self.round.lock().unwrap();
            round.phase = Phase::AwaitingJoins;
            let mut joined = 1;
            registry.for_each(|t| {
                if t.id() == me {
                    return;
                }
                let sp = t.last_sp.load(Ordering::SeqCst);
                if !sp.is_zero() && Self::try_count(t, sp) {
                    trace!("Thread {} counted in native code at {}", t.id(), sp);
                    joined += 1;
                } else if !t.has_joined() {
                    pending.push(t.id());
                }
            });
            self.nb_joined.fetch_add(joined, Ordering::SeqCst);
        }

        for id in pending {
            let t = registry.get(id);
            if !t.has_joined() {
                self.preemption.request_suspend(t);
            }
        }

        self.wait_rv(total);
    }

    fn wait_rv(&self, total: usize) {
        let mut round = self.round.lock().unwrap();
        loop {
            let joined = self.nb_joined.load(Ordering::SeqCst);
            assert!(
                joined <= total,
                "{} threads joined a rendezvous of {} threads",
                joined,
                total
            );
            if joined == total {
                break;
            }
            round = self
                .cond_initiator
                .wait_timeout(round, JOIN_POLL_INTERVAL)
                .unwrap()
                .0;
        }
        round.phase = Phase::AllJoined;
        debug!("All {} threads joined", total);
    }

    /// Claim the right to count `t` into this round.
    fn try_count(t: &ThreadControlBlock, sp: Address) -> bool {
        if t.joined_rv
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            t.joined_sp.store(sp, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    /// Count the current thread in if nobody has, then park until the round ends.
    ///
    /// The caller has published `sp`. If `do_yield` is clear by now, the round that asked this
    /// thread to yield is over (the signal handler may have served it), and a later round will
    /// count the thread through `sp`.
    fn join_and_wait(&self, t: &ThreadControlBlock, sp: Address) {
        debug_assert_eq!(t.last_sp(), sp);
        if !t.do_yield.load(Ordering::SeqCst) {
            return;
        }
        // Count before taking the round mutex. A thread that has been counted ignores the
        // suspension signal, so it is never stopped while it holds the mutex.
        let counted = Self::try_count(t, sp);
        let round = self.round.lock().unwrap();
        if counted {
            let joined = self.nb_joined.fetch_add(1, Ordering::SeqCst) + 1;
            let expected = self.expected.load(Ordering::SeqCst);
            assert!(
                joined <= expected,
                "Thread {} joins as {} of {} threads",
                t.id(),
                joined,
                expected
            );
            trace!("Thread {} joined ({}/{})", t.id(), joined, expected);
            self.cond_initiator.notify_one();
        }
        drop(self.wait_end_of_rv(t, round));
    }

    fn wait_end_of_rv<'a>(
        &self,
        t: &ThreadControlBlock,
        mut round: MutexGuard<'a, RoundState>,
    ) -> MutexGuard<'a, RoundState> {
        while t.do_yield.load(Ordering::SeqCst) {
            round = self.cond_end_of_rv.wait(round).unwrap();
        }
        round
    }

    /// The cooperative join: called from a safepoint poll that found `do_yield` set.
    pub fn join(&self, t: &ThreadControlBlock) {
        if t.is_in_rendezvous() {
            return;
        }
        assert!(
            t.last_sp().is_zero(),
            "Thread {} joins a rendezvous with a published stack pointer",
            t.id()
        );
        self.join_before_uncooperative(t);
        self.join_after_uncooperative(t);
    }

    /// Called before a thread enters native code. Publishes the stack pointer so that a round
    /// can proceed without this thread. If a round is already in progress the thread joins it
    /// first and waits for it to finish.
    pub fn join_before_uncooperative(&self, t: &ThreadControlBlock) {
        if t.is_in_rendezvous() {
            return;
        }
        assert!(
            t.last_sp().is_zero(),
            "Thread {} enters native code twice",
            t.id()
        );
        let sp = approximate_stack_pointer();
        t.last_sp.store(sp, Ordering::SeqCst);
        if t.do_yield.load(Ordering::SeqCst) {
            self.join_and_wait(t, sp);
        }
    }

    /// Called when a thread returns from native code. If a round is in progress the thread joins
    /// it and waits for it to finish before it clears its stack pointer.
    pub fn join_after_uncooperative(&self, t: &ThreadControlBlock) {
        if t.is_in_rendezvous() {
            return;
        }
        let sp = t.last_sp();
        assert!(
            !sp.is_zero(),
            "Thread {} leaves native code it never entered",
            t.id()
        );
        loop {
            t.last_sp.store(Address::ZERO, Ordering::SeqCst);
            if !t.do_yield.load(Ordering::SeqCst) {
                break;
            }
            // A round started. It may already have counted us through the stack pointer we are
            // withdrawing, so put it back until the round is over.
            t.last_sp.store(sp, Ordering::SeqCst);
            self.join_and_wait(t, sp);
        }
    }

    /// The join performed by the suspension signal handler on the interrupted thread.
    ///
    /// Async-signal-safe: atomics and `nanosleep` only. Does nothing if the thread is running
    /// rendezvous logic, or if no round asks it to yield. A thread with a published stack pointer
    /// is left alone as well: it is counted through that pointer or counts itself, and it may hold
    /// the round mutex.
    pub(crate) fn join_from_signal(&self, t: &ThreadControlBlock, sp: Address) {
        if t.in_rv.load(Ordering::SeqCst)
            || !t.do_yield.load(Ordering::SeqCst)
            || !t.last_sp().is_zero()
        {
            return;
        }
        if !Self::try_count(t, sp) {
            return;
        }
        let saved_sp = t.last_sp.swap(sp, Ordering::SeqCst);
        self.nb_joined.fetch_add(1, Ordering::SeqCst);
        while t.do_yield.load(Ordering::SeqCst) {
            signal::short_sleep(SIGNAL_WAIT_NANOS);
        }
        t.last_sp.store(saved_sp, Ordering::SeqCst);
    }

    /// Describe every stopped thread. Only valid between `synchronize` and `finish_rv`.
    pub fn thread_snapshots(&self, registry: &ThreadRegistry) -> Vec<ThreadSnapshot> {
        debug_assert_eq!(self.phase(), Phase::AllJoined);
        let mut snapshots = Vec::with_capacity(registry.len());
        registry.for_each(|t| {
            debug_assert!(t.has_joined());
            snapshots.push(ThreadSnapshot {
                id: t.id(),
                stack_pointer: t.joined_sp.load(Ordering::SeqCst),
                stack_low: t.stack_low.load(Ordering::SeqCst),
                stack_high: t.stack_high.load(Ordering::SeqCst),
            });
        });
        snapshots
    }

    /// End the round started by `me`: clear all flags, reset the count, release the registry
    /// lock and wake every parked thread.
    pub fn finish_rv(&self, registry: &ThreadRegistry, me: ThreadId) {
        let mut round = self.round.lock().unwrap();
        assert_eq!(
            round.initiator,
            Some(me),
            "Thread {} finishes a rendezvous it did not initiate",
            me
        );
        let expected = self.expected.load(Ordering::SeqCst);
        let joined = self.nb_joined.load(Ordering::SeqCst);
        assert_eq!(
            joined, expected,
            "Rendezvous finished with {} of {} threads joined",
            joined, expected
        );
        round.phase = Phase::Finishing;
        registry.for_each(|t| {
            t.do_yield.store(false, Ordering::SeqCst);
            t.joined_rv.store(false, Ordering::SeqCst);
            t.joined_sp.store(Address::ZERO, Ordering::SeqCst);
        });
        self.nb_joined.store(0, Ordering::SeqCst);
        self.expected.store(0, Ordering::SeqCst);
        round.initiator = None;
        round.phase = Phase::Idle;
        self.rounds.fetch_add(1, Ordering::SeqCst);
        registry.lock.unlock(me);
        self.cond_end_of_rv.notify_all();
        drop(round);
        registry.get(me).in_rv.store(false, Ordering::SeqCst);
        debug!("Rendezvous finished by {}", me);
    }
}
