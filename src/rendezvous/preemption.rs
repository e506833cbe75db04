//! Forcing threads to join a rendezvous.
//!
//! A [`Preemption`] backend is asked to stop every thread that has neither joined nor published
//! a stack pointer when a round starts. [`PollingPreemption`] does nothing and relies on safepoint
//! polls. [`SignalPreemption`] sends the suspension signal, whose handler joins the round on the
//! interrupted thread.

use crate::threads::ThreadControlBlock;
use crate::util::options::RendezvousKind;
use crate::util::RuntimeError;

pub trait Preemption: Send + Sync {
    /// The strategy this backend implements.
    fn kind(&self) -> RendezvousKind;

    /// Ask `thread` to join the current round as soon as possible.
    fn request_suspend(&self, thread: &ThreadControlBlock);
}

/// Threads join at their next safepoint poll or native-code transition.
pub struct PollingPreemption;

impl Preemption for PollingPreemption {
    fn kind(&self) -> RendezvousKind {
        RendezvousKind::Cooperative
    }

    fn request_suspend(&self, _thread: &ThreadControlBlock) {}
}

/// Create the backend for `kind`. Platforms without signal support fall back to polling.
pub fn create(kind: RendezvousKind) -> Result<Box<dyn Preemption>, RuntimeError> {
    match kind {
        RendezvousKind::Cooperative => Ok(Box::new(PollingPreemption)),
        RendezvousKind::Uncooperative => {
            cfg_if::cfg_if! {
                if #[cfg(target_os = "linux")] {
                    Ok(Box::new(SignalPreemption::new()?))
                } else {
                    warn!("Uncooperative rendezvous is not supported on this platform. Falling back to polling.");
                    Ok(Box::new(PollingPreemption))
                }
            }
        }
    }
}

#[cfg(target_os = "linux")]
pub use self::signal_backend::SignalPreemption;

#[cfg(target_os = "linux")]
mod signal_backend {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::Preemption;
    use crate::threads::{os_thread_table, ThreadControlBlock};
    use crate::util::options::RendezvousKind;
    use crate::util::os::{self, approximate_stack_pointer, signal};
    use crate::util::RuntimeError;

    lazy_static! {
        // The handler is installed once per process and never removed.
        static ref HANDLER_INSTALLED: Result<(), i32> =
            signal::install_handler(signal::suspend_signal(), handle_suspend_signal)
                .map_err(|e| e.raw_os_error().unwrap_or(libc::EINVAL));
    }

    /// The number of times the handler ran, process-wide.
    static SIGNALS_HANDLED: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn handle_suspend_signal(
        _signal: libc::c_int,
        _info: *mut libc::siginfo_t,
        _context: *mut libc::c_void,
    ) {
        let saved_errno = signal::errno();
        SIGNALS_HANDLED.fetch_add(1, Ordering::SeqCst);
        if let Some((tcb, rendezvous)) =
            os_thread_table::lookup(os::thread::key_of(os::thread::current()))
        {
            let sp = approximate_stack_pointer();
            unsafe { (*rendezvous).join_from_signal(&*tcb, sp) };
        }
        signal::set_errno(saved_errno);
    }

    /// Stop threads with the suspension signal.
    pub struct SignalPreemption {
        sent: AtomicUsize,
    }

    impl SignalPreemption {
        pub fn new() -> Result<Self, RuntimeError> {
            match *HANDLER_INSTALLED {
                Ok(()) => Ok(SignalPreemption {
                    sent: AtomicUsize::new(0),
                }),
                Err(errno) => Err(RuntimeError::SignalInstallation(
                    std::io::Error::from_raw_os_error(errno),
                )),
            }
        }

        /// The number of signals sent by this backend.
        pub fn signals_sent(&self) -> usize {
            self.sent.load(Ordering::SeqCst)
        }

        /// The number of times the handler ran in this process.
        pub fn signals_handled() -> usize {
            SIGNALS_HANDLED.load(Ordering::SeqCst)
        }
    }

    impl Preemption for SignalPreemption {
        fn kind(&self) -> RendezvousKind {
            RendezvousKind::Uncooperative
        }

        fn request_suspend(&self, thread: &ThreadControlBlock) {
            let target = os::thread::from_key(thread.os_thread.load(Ordering::SeqCst));
            match os::thread::kill(target, signal::suspend_signal()) {
                Ok(()) => {
                    self.sent.fetch_add(1, Ordering::SeqCst);
                    trace!("Sent the suspension signal to thread {}", thread.id());
                }
                // The thread still has to poll. It will join at its next safepoint.
                Err(e) => warn!(
                    "Failed to signal thread {}: {}. Waiting for it to poll.",
                    thread.id(),
                    e
                ),
            }
        }
    }
}
