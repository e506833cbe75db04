//! The suspension signal. Only async-signal-safe calls are made from the handler side of this
//! module: `nanosleep` and `errno` access.

use std::io::{Error, Result};

pub type SignalHandler = extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void);

/// The signal reserved for forced thread suspension. Application code must not use it.
#[cfg(target_os = "linux")]
pub fn suspend_signal() -> libc::c_int {
    libc::SIGRTMIN() + 2
}

/// Install `handler` for `signal`. The handler runs with `SA_SIGINFO` and interrupted system
/// calls are restarted.
pub fn install_handler(signal: libc::c_int, handler: SignalHandler) -> Result<()> {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handler as usize;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(signal, &action, std::ptr::null_mut()) != 0 {
            return Err(Error::last_os_error());
        }
    }
    Ok(())
}

/// Sleep for a short while. Safe to call from a signal handler.
pub fn short_sleep(nanos: libc::c_long) {
    let request = libc::timespec {
        tv_sec: 0,
        tv_nsec: nanos,
    };
    unsafe {
        libc::nanosleep(&request, std::ptr::null_mut());
    }
}

#[cfg(target_os = "linux")]
pub fn errno() -> libc::c_int {
    unsafe { *libc::__errno_location() }
}

#[cfg(target_os = "linux")]
pub fn set_errno(value: libc::c_int) {
    unsafe { *libc::__errno_location() = value }
}

#[cfg(test)]
#[cfg(target_os = "linux")]
mod tests {
    use super::*;

    #[test]
    fn signal_is_real_time() {
        let signal = suspend_signal();
        assert!(signal > libc::SIGRTMIN());
        assert!(signal <= libc::SIGRTMAX());
    }

    #[test]
    fn errno_round_trip() {
        let saved = errno();
        set_errno(libc::EINTR);
        assert_eq!(errno(), libc::EINTR);
        set_errno(saved);
    }
}
