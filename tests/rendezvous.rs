use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use rvgc::util::test_util::{panic_after, runtime_with, serial_test, with_cleanup};
use rvgc::util::Address;
use rvgc::vm::{NoRoots, RootProvider, RootVisitor, ThreadSnapshot};
use rvgc::{JoinHandle, Mutator, ThreadId, TypeDescriptor};

static GARBAGE: TypeDescriptor = TypeDescriptor {
    name: "Garbage",
    trace: TypeDescriptor::trace_nothing,
    finalize: None,
};

/// Records which threads were stopped in each collection.
#[derive(Default)]
struct RecordingRoots {
    scanned: Mutex<Vec<ThreadSnapshot>>,
}

impl RootProvider for RecordingRoots {
    fn scan_thread_roots(&self, thread: &ThreadSnapshot, _visitor: &mut dyn RootVisitor) {
        self.scanned.lock().unwrap().push(thread.clone());
    }

    fn scan_global_roots(&self, _visitor: &mut dyn RootVisitor) {}
}

/// Start a thread that calls `body` until `stop` is set, and wait until it is registered.
fn start(
    main: &Mutator,
    stop: &Arc<AtomicBool>,
    body: fn(&Mutator),
) -> (JoinHandle<()>, ThreadId) {
    let (ready_tx, ready_rx) = mpsc::channel();
    let stop = stop.clone();
    let handle = main.spawn(move |m| {
        ready_tx.send(m.id()).unwrap();
        while !stop.load(Ordering::SeqCst) {
            body(m);
        }
    });
    let id = main.in_native(|| ready_rx.recv().unwrap());
    (handle, id)
}

fn assert_round_flags_cleared(main: &Mutator) {
    let runtime = main.runtime();
    for id in runtime.thread_ids(main) {
        let tcb = runtime.registry().get(id);
        assert!(!tcb.is_yield_requested(), "thread {} still asked to yield", id);
        assert!(!tcb.has_joined(), "thread {} still counted", id);
        assert!(!tcb.is_in_rendezvous());
    }
    assert_eq!(runtime.rendezvous().joined(), 0);
}

#[test]
fn cooperative_round_stops_polling_and_native_threads() {
    panic_after(30_000, || {
        let roots = Arc::new(RecordingRoots::default());
        let runtime = runtime_with("max_threads=16", roots.clone());
        let main = runtime.attach_current_thread();
        let stop = Arc::new(AtomicBool::new(false));

        let mut threads = vec![];
        for _ in 0..3 {
            threads.push(start(&main, &stop, |m| m.safepoint()));
        }
        for _ in 0..3 {
            threads.push(start(&main, &stop, |m| {
                m.in_native(|| std::thread::sleep(std::time::Duration::from_millis(1)))
            }));
        }

        assert!(runtime.collect(&main));
        assert_eq!(runtime.rendezvous().rounds(), 1);

        let scanned: HashSet<ThreadId> = roots
            .scanned
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.id)
            .collect();
        assert!(scanned.contains(&main.id()));
        for (_, id) in &threads {
            assert!(scanned.contains(id), "thread {} was not stopped", id);
        }
        for snapshot in roots.scanned.lock().unwrap().iter() {
            assert!(!snapshot.stack_pointer.is_zero());
        }
        assert_round_flags_cleared(&main);

        stop.store(true, Ordering::SeqCst);
        for (handle, _) in threads {
            handle.join(&main).unwrap();
        }
    });
}

#[test]
fn repeated_collections_under_allocation() {
    panic_after(60_000, || {
        let runtime = runtime_with(
            "max_threads=16 min_heap_size=65536 max_heap_size=16777216",
            Arc::new(NoRoots),
        );
        let main = runtime.attach_current_thread();
        let stop = Arc::new(AtomicBool::new(false));
        let allocated = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..4 {
            let stop = stop.clone();
            let allocated = allocated.clone();
            handles.push(main.spawn(move |m| {
                while !stop.load(Ordering::SeqCst) {
                    let object = m.runtime().alloc(m, &GARBAGE, 64);
                    object.set_field(0, m.id().0);
                    assert_eq!(object.get_field(0), m.id().0);
                    allocated.fetch_add(1, Ordering::Relaxed);
                }
            }));
        }

        for _ in 0..20 {
            main.runtime().alloc(&main, &GARBAGE, 16);
            assert!(runtime.collect(&main));
        }
        stop.store(true, Ordering::SeqCst);
        for handle in handles {
            handle.join(&main).unwrap();
        }

        assert!(allocated.load(Ordering::Relaxed) > 0);
        assert!(runtime.stats().collections >= 20);
        assert_round_flags_cleared(&main);
    });
}

#[test]
fn concurrent_initiators_take_turns() {
    panic_after(60_000, || {
        let runtime = runtime_with("max_threads=16", Arc::new(NoRoots));
        let main = runtime.attach_current_thread();
        let mut handles = vec![];
        for _ in 0..4 {
            handles.push(main.spawn(|m| {
                for _ in 0..10 {
                    assert!(m.runtime().collect(m));
                }
            }));
        }
        for handle in handles {
            handle.join(&main).unwrap();
        }
        // A thread that waited for the collector lock while another collected does not collect
        // again.
        let rounds = runtime.rendezvous().rounds();
        assert!((10..=40).contains(&rounds), "{} rounds", rounds);
        assert_eq!(runtime.stats().collections, rounds);
    });
}

#[cfg(target_os = "linux")]
#[test]
fn uncooperative_round_stops_spinning_threads() {
    use rvgc::rendezvous::SignalPreemption;

    serial_test(|| {
        panic_after(30_000, || {
            let roots = Arc::new(RecordingRoots::default());
            let runtime = runtime_with("max_threads=8 rendezvous=uncooperative", roots.clone());
            let main = runtime.attach_current_thread();
            let stop = Arc::new(AtomicBool::new(false));
            let handled_before = SignalPreemption::signals_handled();

            // These threads never poll.
            let mut threads = vec![];
            for _ in 0..3 {
                threads.push(start(&main, &stop, |_| std::hint::spin_loop()));
            }

            for _ in 0..3 {
                assert!(runtime.collect(&main));
            }
            assert_eq!(runtime.rendezvous().rounds(), 3);
            assert!(SignalPreemption::signals_handled() > handled_before);

            let scanned = roots.scanned.lock().unwrap().clone();
            for (_, id) in &threads {
                assert_eq!(scanned.iter().filter(|s| s.id == *id).count(), 3);
            }
            for snapshot in &scanned {
                let sp: Address = snapshot.stack_pointer;
                if !snapshot.stack_low.is_zero() {
                    assert!(snapshot.stack_low <= sp && sp < snapshot.stack_high);
                }
            }
            assert_round_flags_cleared(&main);

            stop.store(true, Ordering::SeqCst);
            for (handle, _) in threads {
                handle.join(&main).unwrap();
            }
        })
    });
}

#[cfg(target_os = "linux")]
#[test]
fn uncooperative_rounds_with_root_table_churn() {
    use rvgc::vm::RootTable;

    serial_test(|| {
        panic_after(60_000, || {
            let roots = Arc::new(RootTable::new());
            let runtime = runtime_with("max_threads=8 rendezvous=uncooperative", roots.clone());
            let main = runtime.attach_current_thread();
            let stop = Arc::new(AtomicBool::new(false));
            let churned = Arc::new(AtomicUsize::new(0));

            let mut handles = vec![];
            for _ in 0..2 {
                let (roots, stop, churned) = (roots.clone(), stop.clone(), churned.clone());
                handles.push(main.spawn(move |m| {
                    while !stop.load(Ordering::SeqCst) {
                        let object = m.runtime().alloc(m, &GARBAGE, 16);
                        let handle = roots.add(m, object);
                        assert_eq!(roots.get(m, handle), Some(object));
                        assert_eq!(roots.remove(m, handle), Some(object));
                        churned.fetch_add(1, Ordering::Relaxed);
                    }
                }));
            }

            with_cleanup(
                AssertUnwindSafe(|| {
                    for _ in 0..200 {
                        assert!(runtime.collect(&main));
                    }
                }),
                || stop.store(true, Ordering::SeqCst),
            );
            for handle in handles {
                handle.join(&main).unwrap();
            }
            assert!(churned.load(Ordering::Relaxed) > 0);
            assert!(roots.is_empty(&main));
            assert_round_flags_cleared(&main);
        })
    });
}

#[test]
fn native_thread_returning_mid_round_waits() {
    panic_after(30_000, || {
        let runtime = runtime_with("max_threads=4", Arc::new(NoRoots));
        let main = runtime.attach_current_thread();
        let (go_tx, go_rx) = mpsc::channel::<()>();
        let (ready_tx, ready_rx) = mpsc::channel();
        let seen_rounds = Arc::new(AtomicUsize::new(usize::MAX));
        let seen = seen_rounds.clone();

        let handle = main.spawn(move |m| {
            m.in_native(|| {
                ready_tx.send(()).unwrap();
                go_rx.recv().unwrap();
            });
            // Leaving native code never overlaps a round.
            seen.store(m.runtime().rendezvous().rounds(), Ordering::SeqCst);
        });
        main.in_native(|| ready_rx.recv().unwrap());

        go_tx.send(()).unwrap();
        assert!(runtime.collect(&main));
        handle.join(&main).unwrap();

        assert!(seen_rounds.load(Ordering::SeqCst) <= 1);
        assert_eq!(runtime.rendezvous().rounds(), 1);
    });
}
