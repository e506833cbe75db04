use std::panic;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::runtime::{Runtime, RuntimeBuilder};
use crate::vm::RootProvider;

// https://github.com/rust-lang/rfcs/issues/2798#issuecomment-552949300
/// Run `f` on a separate thread and fail if it does not finish within `millis`. Tests that can
/// deadlock in a rendezvous use this so that a lost join fails the test instead of hanging it.
pub fn panic_after<T, F>(millis: u64, f: F) -> T
where
    T: Send + 'static,
    F: FnOnce() -> T,
    F: Send + 'static,
{
    let (done_tx, done_rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let val = f();
        done_tx.send(()).expect("Unable to send completion signal");
        val
    });

    match done_rx.recv_timeout(Duration::from_millis(millis)) {
        Ok(_) => handle.join().expect("Thread panicked"),
        Err(e) => panic!("Thread took too long: {}", e),
    }
}

lazy_static! {
    // A global lock to make tests serial.
    static ref SERIAL_TEST_LOCK: Mutex<()> = Mutex::default();
}

/// Force some tests to be executed serially. Tests that send the suspension signal, or that
/// count process-wide resources, use this.
pub fn serial_test<F>(f: F)
where
    F: FnOnce(),
{
    // If one test fails, the lock will become poisoned. We would want to continue for other tests anyway.
    let _guard = SERIAL_TEST_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    f();
}

/// Always execute a cleanup closure no matter the test panics or not.
pub fn with_cleanup<T, C>(test: T, cleanup: C)
where
    T: FnOnce() + panic::UnwindSafe,
    C: FnOnce(),
{
    let res = panic::catch_unwind(test);
    cleanup();
    if let Err(e) = res {
        panic::resume_unwind(e);
    }
}

/// Build a runtime for a test. `options` is a whitespace-separated list of `name=value` pairs
/// applied over the defaults. Environment variables are ignored.
pub fn runtime_with(options: &str, roots: Arc<dyn RootProvider>) -> Arc<Runtime> {
    let mut builder = RuntimeBuilder::new_no_env_vars();
    assert!(
        builder.set_options_bulk_by_str(options),
        "Invalid test options {:?}",
        options
    );
    builder.set_root_provider(roots);
    builder.build().unwrap()
}
