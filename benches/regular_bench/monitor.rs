use criterion::Criterion;
use std::sync::Arc;

use rvgc::util::test_util::runtime_with;
use rvgc::vm::RootTable;
use rvgc::TypeDescriptor;

static CELL: TypeDescriptor = TypeDescriptor {
    name: "Cell",
    trace: TypeDescriptor::trace_nothing,
    finalize: None,
};

pub fn bench(c: &mut Criterion) {
    let roots = Arc::new(RootTable::new());
    let runtime = runtime_with("", roots.clone());
    let mutator = runtime.attach_current_thread();
    let thin = runtime.alloc(&mutator, &CELL, 8);
    roots.add(&mutator, thin);
    let fat = runtime.alloc(&mutator, &CELL, 8);
    roots.add(&mutator, fat);
    // Inflate by overflowing the recursion count.
    let depth = runtime.options().thin_lock_max_recursion + 1;
    for _ in 0..depth {
        runtime.acquire(&mutator, fat);
    }
    for _ in 0..depth {
        runtime.release(&mutator, fat);
    }

    let monitor = runtime.monitor();
    c.bench_function("thin_lock_acquire_release", |b| {
        b.iter(|| {
            monitor.acquire(&mutator, thin);
            monitor.release(&mutator, thin);
        })
    });
    c.bench_function("fat_lock_acquire_release", |b| {
        b.iter(|| {
            monitor.acquire(&mutator, fat);
            monitor.release(&mutator, fat);
        })
    });
}
