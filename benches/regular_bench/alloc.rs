use criterion::Criterion;
use std::hint::black_box;
use std::sync::Arc;

use rvgc::util::test_util::runtime_with;
use rvgc::vm::NoRoots;
use rvgc::TypeDescriptor;

static LEAF: TypeDescriptor = TypeDescriptor {
    name: "Leaf",
    trace: TypeDescriptor::trace_nothing,
    finalize: None,
};

pub fn bench(c: &mut Criterion) {
    // Unrooted objects, so the budget keeps triggering collections of an empty heap.
    let runtime = runtime_with("min_heap_size=1048576", Arc::new(NoRoots));
    let mutator = runtime.attach_current_thread();
    c.bench_function("alloc_small", |b| {
        b.iter(|| {
            let object = runtime.alloc(&mutator, &LEAF, 16);
            black_box(object);
        })
    });
}
