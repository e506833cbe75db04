use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rvgc::util::test_util::runtime_with;
use rvgc::vm::{ObjectTracer, RootTable, OBJECT_HEADER_WORDS};
use rvgc::{Mutator, ObjectReference, OomAction, Runtime, RuntimeBuilder, TypeDescriptor};

/// A node whose first payload word is a reference. The rest is data.
fn trace_first_field(object: ObjectReference, tracer: &mut dyn ObjectTracer) {
    if let Some(next) = object.get_reference(0) {
        tracer.trace_object(next);
    }
}

static NODE: TypeDescriptor = TypeDescriptor {
    name: "Node",
    trace: trace_first_field,
    finalize: None,
};

static BLOB: TypeDescriptor = TypeDescriptor {
    name: "Blob",
    trace: TypeDescriptor::trace_nothing,
    finalize: None,
};

fn setup(options: &str) -> (Arc<Runtime>, Mutator, Arc<RootTable>) {
    let roots = Arc::new(RootTable::new());
    let runtime = runtime_with(options, roots.clone());
    let main = runtime.attach_current_thread();
    (runtime, main, roots)
}

fn count_objects(main: &Mutator) -> usize {
    let mut count = 0;
    main.runtime().apply_func(main, |_| count += 1);
    count
}

#[test]
fn unreachable_cycle_is_reclaimed() {
    let (runtime, main, roots) = setup("auto_collect=false");
    let a = runtime.alloc(&main, &NODE, 16);
    let b = runtime.alloc(&main, &NODE, 16);
    let c = runtime.alloc(&main, &NODE, 16);
    a.set_reference(0, Some(b));
    b.set_reference(0, Some(c));
    c.set_reference(0, Some(a));
    a.set_field(1, 0xdead);
    roots.add(&main, a);

    assert!(runtime.collect(&main));
    assert_eq!(count_objects(&main), 3);
    assert_eq!(runtime.stats().last_freed_objects, 0);

    a.set_reference(0, None);
    assert!(runtime.collect(&main));
    let stats = runtime.stats();
    assert_eq!(stats.last_freed_objects, 2);
    assert_eq!(stats.collections, 2);
    assert_eq!(count_objects(&main), 1);
    assert_eq!(a.get_field(1), 0xdead);

    // A freed chunk of the same size is reused before the heap grows.
    let d = runtime.alloc(&main, &NODE, 16);
    assert!(d == b || d == c);
    assert_eq!(d.get_field(0), 0);
    assert_eq!(d.get_field(1), 0);
}

#[test]
fn everything_dies_without_roots() {
    let (runtime, main, _roots) = setup("auto_collect=false");
    for i in 0..100 {
        let object = runtime.alloc(&main, &BLOB, 8 * (i % 7 + 1));
        object.set_field(0, i);
    }
    assert_eq!(count_objects(&main), 100);
    assert!(runtime.collect(&main));
    assert_eq!(runtime.stats().last_freed_objects, 100);
    assert_eq!(runtime.stats().live_bytes, 0);
    assert_eq!(count_objects(&main), 0);
}

static FINALIZED: AtomicUsize = AtomicUsize::new(0);

fn count_finalization(object: ObjectReference) {
    assert_eq!(object.get_field(0), 42);
    FINALIZED.fetch_add(1, Ordering::SeqCst);
}

static FINALIZABLE: TypeDescriptor = TypeDescriptor {
    name: "Finalizable",
    trace: TypeDescriptor::trace_nothing,
    finalize: Some(count_finalization),
};

#[test]
fn finalizers_run_once() {
    let (runtime, main, roots) = setup("auto_collect=false");
    let kept = runtime.alloc(&main, &FINALIZABLE, 8);
    kept.set_field(0, 42);
    roots.add(&main, kept);
    for _ in 0..10 {
        runtime.alloc(&main, &FINALIZABLE, 8).set_field(0, 42);
    }

    assert!(runtime.collect(&main));
    assert_eq!(runtime.stats().finalizers_run, 10);
    assert!(runtime.collect(&main));
    assert_eq!(runtime.stats().finalizers_run, 10);

    roots.clear(&main);
    assert!(runtime.collect(&main));
    assert_eq!(runtime.stats().finalizers_run, 11);
    assert_eq!(FINALIZED.load(Ordering::SeqCst), 11);
}

#[test]
fn no_collection_during_apply_func() {
    let (runtime, main, _roots) = setup("auto_collect=false");
    for _ in 0..5 {
        runtime.alloc(&main, &BLOB, 8);
    }
    let mut visited = 0;
    runtime.apply_func(&main, |object| {
        assert_eq!(object.type_descriptor().name, "Blob");
        assert!(!runtime.collect(&main));
        visited += 1;
    });
    assert_eq!(visited, 5);
    assert_eq!(runtime.stats().collections, 0);
    assert!(runtime.collect(&main));
    assert_eq!(runtime.stats().last_freed_objects, 5);
}

#[test]
fn exhausting_the_budget_collects_at_the_next_allocation() {
    let (runtime, main, _roots) = setup("min_heap_size=8192");
    // One object takes the whole initial budget.
    let header = OBJECT_HEADER_WORDS * std::mem::size_of::<usize>();
    let big = runtime.alloc(&main, &BLOB, 8192 - header);
    big.set_field(0, 7);
    assert_eq!(runtime.stats().collections, 0);
    assert_eq!(big.get_field(0), 7);

    let small = runtime.alloc(&main, &BLOB, 8);
    let stats = runtime.stats();
    assert_eq!(stats.collections, 1);
    assert_eq!(stats.last_freed_objects, 1);
    assert_eq!(count_objects(&main), 1);
    assert_eq!(small.get_field(0), 0);
}

#[test]
fn root_table_handles() {
    let (runtime, main, roots) = setup("auto_collect=false");
    let objects: Vec<ObjectReference> = (0..4).map(|_| runtime.alloc(&main, &BLOB, 8)).collect();
    let a = roots.add(&main, objects[0]);
    let b = roots.add(&main, objects[1]);
    assert_eq!(roots.len(&main), 2);
    assert_eq!(roots.remove(&main, a), Some(objects[0]));
    assert_eq!(roots.get(&main, a), None);
    // The freed slot is reused.
    let c = roots.add(&main, objects[2]);
    assert_eq!(c, a);
    roots.set(&main, b, objects[3]);
    assert!(!main.is_in_native());

    assert!(runtime.collect(&main));
    assert_eq!(runtime.stats().last_freed_objects, 2);
    let mut live = vec![];
    runtime.apply_func(&main, |object| live.push(object));
    live.sort();
    let mut expected = vec![objects[2], objects[3]];
    expected.sort();
    assert_eq!(live, expected);

    roots.clear(&main);
    assert!(roots.is_empty(&main));
    assert_eq!(roots.get(&main, b), None);
}

#[test]
fn budget_triggers_collection() {
    let (runtime, main, _roots) = setup("min_heap_size=8192 max_heap_size=1048576");
    for _ in 0..1000 {
        runtime.alloc(&main, &BLOB, 64);
    }
    assert!(runtime.stats().collections > 0);

    runtime.disable_collection();
    let before = runtime.stats().collections;
    for _ in 0..1000 {
        runtime.alloc(&main, &BLOB, 64);
    }
    assert_eq!(runtime.stats().collections, before);
}

#[test]
fn full_heap_collects_before_failing() {
    // Collection is only triggered by a full heap.
    let (runtime, main, _roots) = setup("auto_collect=false min_heap_size=8192 max_heap_size=65536");
    for _ in 0..1000 {
        runtime.alloc(&main, &BLOB, 1024);
    }
    assert!(runtime.stats().collections > 0);
}

#[test]
#[should_panic(expected = "Out of memory")]
fn out_of_memory_panics() {
    let (runtime, main, roots) = setup("min_heap_size=8192 max_heap_size=65536");
    loop {
        let object = runtime.alloc(&main, &BLOB, 1024);
        roots.add(&main, object);
    }
}

fn runtime_with_oom_handler(
    roots: Arc<RootTable>,
    handler: impl Fn(&Mutator, usize) -> OomAction + Send + Sync + 'static,
) -> Arc<Runtime> {
    let mut builder = RuntimeBuilder::new_no_env_vars();
    assert!(builder.set_options_bulk_by_str("min_heap_size=8192 max_heap_size=65536"));
    builder.set_root_provider(roots).set_oom_handler(handler);
    builder.build().unwrap()
}

#[test]
fn oom_handler_can_give_up() {
    let roots = Arc::new(RootTable::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let runtime = runtime_with_oom_handler(roots.clone(), move |_, bytes| {
        assert!(bytes >= 1024);
        counter.fetch_add(1, Ordering::SeqCst);
        OomAction::Fail
    });
    let main = runtime.attach_current_thread();

    let result = catch_unwind(AssertUnwindSafe(|| loop {
        let object = runtime.alloc(&main, &BLOB, 1024);
        roots.add(&main, object);
    }));
    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn oom_handler_can_release_memory() {
    let roots = Arc::new(RootTable::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let (counter, table) = (calls.clone(), roots.clone());
    let runtime = runtime_with_oom_handler(roots.clone(), move |mutator, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        table.clear(mutator);
        OomAction::Retry
    });
    let main = runtime.attach_current_thread();

    for _ in 0..500 {
        let object = runtime.alloc(&main, &BLOB, 1024);
        roots.add(&main, object);
    }
    assert!(calls.load(Ordering::SeqCst) >= 1);
}

fn ignore(_object: ObjectReference) {}

static REALLOCATED: TypeDescriptor = TypeDescriptor {
    name: "Reallocated",
    trace: TypeDescriptor::trace_nothing,
    finalize: Some(ignore),
};

#[test]
fn realloc_shrinks_in_place_and_grows_by_copy() {
    let (runtime, main, roots) = setup("auto_collect=false");
    let object = runtime.alloc(&main, &REALLOCATED, 32);
    for i in 0..4 {
        object.set_field(i, i + 1);
    }

    let shrunk = runtime.realloc(&main, object, 16);
    assert_eq!(shrunk, object);
    assert_eq!(shrunk.payload_len(), 2);
    // Growing back within the chunk reads zeros past the old length.
    let regrown = runtime.realloc(&main, shrunk, 32);
    assert_eq!(regrown, object);
    assert_eq!(
        (0..4).map(|i| regrown.get_field(i)).collect::<Vec<_>>(),
        vec![1, 2, 0, 0]
    );

    let grown = runtime.realloc(&main, regrown, 256);
    assert_ne!(grown, object);
    assert_eq!(grown.payload_len(), 32);
    assert_eq!(grown.get_field(0), 1);
    assert_eq!(grown.get_field(1), 2);
    assert!((2..32).all(|i| grown.get_field(i) == 0));
    roots.add(&main, grown);

    // The old copy dies without running its finalizer.
    assert!(runtime.collect(&main));
    let stats = runtime.stats();
    assert_eq!(stats.last_freed_objects, 1);
    assert_eq!(stats.finalizers_run, 0);
    assert_eq!(count_objects(&main), 1);
}

#[test]
#[should_panic(expected = "reallocating a locked object")]
fn realloc_of_locked_object_panics() {
    let (runtime, main, _roots) = setup("auto_collect=false");
    let object = runtime.alloc(&main, &BLOB, 8);
    runtime.acquire(&main, object);
    runtime.realloc(&main, object, 64);
}

#[test]
fn dead_inflated_lock_is_retired() {
    let (runtime, main, _roots) = setup("auto_collect=false thin_lock_max_recursion=1");
    let object = runtime.alloc(&main, &BLOB, 8);
    runtime.acquire(&main, object);
    runtime.acquire(&main, object);
    runtime.release(&main, object);
    runtime.release(&main, object);
    assert_eq!(runtime.monitor().inflated_objects(), 1);

    assert!(runtime.collect(&main));
    assert_eq!(runtime.monitor().inflated_objects(), 0);
    assert_eq!(runtime.monitor().fat_lock_count(), 1);
}

#[test]
fn locked_objects_keep_their_lock_across_collections() {
    let (runtime, main, roots) = setup("auto_collect=false");
    let object = runtime.alloc(&main, &BLOB, 8);
    roots.add(&main, object);
    runtime.acquire(&main, object);
    for _ in 0..3 {
        assert!(runtime.collect(&main));
        assert_eq!(runtime.owner(object), Some(main.id()));
    }
    runtime.release(&main, object);
    assert_eq!(runtime.owner(object), None);
}
