use criterion::Criterion;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rvgc::util::test_util::runtime_with;
use rvgc::vm::NoRoots;

const POLLING_THREADS: usize = 4;

pub fn bench(c: &mut Criterion) {
    let runtime = runtime_with("max_threads=16", Arc::new(NoRoots));
    let mutator = runtime.attach_current_thread();

    c.bench_function("safepoint_poll", |b| b.iter(|| mutator.safepoint()));
    c.bench_function("native_transition", |b| b.iter(|| mutator.in_native(|| ())));

    let stop = Arc::new(AtomicBool::new(false));
    let handles: Vec<_> = (0..POLLING_THREADS)
        .map(|_| {
            let stop = stop.clone();
            mutator.spawn(move |m| {
                while !stop.load(Ordering::Relaxed) {
                    m.safepoint();
                }
            })
        })
        .collect();
    c.bench_function("empty_collection_4_pollers", |b| {
        b.iter(|| runtime.collect(&mutator))
    });
    stop.store(true, Ordering::Relaxed);
    for handle in handles {
        let _ = handle.join(&mutator);
    }
}
