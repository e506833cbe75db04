use std::ffi::c_void;
use std::io::{Error, Result};
use std::mem::MaybeUninit;

use crate::util::Address;

/// The OS handle of a thread.
pub type OsThread = libc::pthread_t;

type ThreadMain = Box<dyn FnOnce() + Send + 'static>;

/// pthread functions report errors in their return value rather than in `errno`.
fn check(ret: libc::c_int) -> Result<()> {
    if ret == 0 {
        Ok(())
    } else {
        Err(Error::from_raw_os_error(ret))
    }
}

pub fn current() -> OsThread {
    unsafe { libc::pthread_self() }
}

/// A non-zero integer key for a thread handle.
pub fn key_of(thread: OsThread) -> usize {
    thread as usize
}

pub fn from_key(key: usize) -> OsThread {
    key as OsThread
}

extern "C" fn thread_start(arg: *mut c_void) -> *mut c_void {
    let main = unsafe { Box::from_raw(arg as *mut ThreadMain) };
    main();
    std::ptr::null_mut()
}

/// Start a thread that runs `main` on the stack `[stack, stack + size)`.
///
/// `main` must not unwind.
pub fn spawn_on_stack(stack: Address, size: usize, main: ThreadMain) -> Result<OsThread> {
    let mut attr = MaybeUninit::<libc::pthread_attr_t>::uninit();
    check(unsafe { libc::pthread_attr_init(attr.as_mut_ptr()) })?;
    let mut attr = unsafe { attr.assume_init() };

    let result = check(unsafe { libc::pthread_attr_setstack(&mut attr, stack.to_mut_ptr(), size) })
        .and_then(|_| {
            let payload = Box::into_raw(Box::new(main));
            let mut thread = MaybeUninit::<OsThread>::uninit();
            let ret = unsafe {
                libc::pthread_create(
                    thread.as_mut_ptr(),
                    &attr,
                    thread_start,
                    payload as *mut c_void,
                )
            };
            if ret != 0 {
                // The thread never started, so the payload is still ours.
                drop(unsafe { Box::from_raw(payload) });
                return Err(Error::from_raw_os_error(ret));
            }
            Ok(unsafe { thread.assume_init() })
        });

    unsafe { libc::pthread_attr_destroy(&mut attr) };
    result
}

/// Wait for a thread to terminate and release its OS resources.
pub fn join(thread: OsThread) -> Result<()> {
    check(unsafe { libc::pthread_join(thread, std::ptr::null_mut()) })
}

/// Let the OS release a thread's resources when it terminates. Nobody will join it.
pub fn detach(thread: OsThread) -> Result<()> {
    check(unsafe { libc::pthread_detach(thread) })
}

pub fn kill(thread: OsThread, signal: libc::c_int) -> Result<()> {
    check(unsafe { libc::pthread_kill(thread, signal) })
}

/// The stack range `[low, high)` of the calling thread, if the platform reports it.
pub fn current_stack_bounds() -> Option<(Address, Address)> {
    cfg_if::cfg_if! {
        if #[cfg(target_os = "linux")] {
            let mut attr = MaybeUninit::<libc::pthread_attr_t>::uninit();
            check(unsafe { libc::pthread_getattr_np(current(), attr.as_mut_ptr()) }).ok()?;
            let mut attr = unsafe { attr.assume_init() };
            let mut low: *mut c_void = std::ptr::null_mut();
            let mut size: libc::size_t = 0;
            let result = check(unsafe { libc::pthread_attr_getstack(&attr, &mut low, &mut size) });
            unsafe { libc::pthread_attr_destroy(&mut attr) };
            result.ok()?;
            let low = Address::from_ptr(low);
            Some((low, low + size))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::os::{approximate_stack_pointer, memory};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn runs_on_given_stack() {
        let size = 256 * 1024;
        let stack = memory::mmap_anonymous(size).unwrap();
        let observed = Arc::new(AtomicUsize::new(0));
        let observed_in_thread = observed.clone();
        let thread = spawn_on_stack(
            stack,
            size,
            Box::new(move || {
                observed_in_thread.store(approximate_stack_pointer().as_usize(), Ordering::SeqCst);
            }),
        )
        .unwrap();
        join(thread).unwrap();
        let sp = observed.load(Ordering::SeqCst);
        assert!(sp > stack.as_usize() && sp < stack.as_usize() + size);
        memory::munmap(stack, size).unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn stack_bounds_contain_stack_pointer() {
        let (low, high) = current_stack_bounds().unwrap();
        let sp = approximate_stack_pointer();
        assert!(low < sp && sp < high);
    }

    #[test]
    fn current_thread_key_is_stable() {
        assert_eq!(key_of(current()), key_of(current()));
        assert_eq!(key_of(from_key(key_of(current()))), key_of(current()));
    }
}
