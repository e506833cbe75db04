//! Thin wrappers over the POSIX calls we depend on: anonymous mappings for the heap and the stack
//! pool, threads created on a caller-provided stack, and the suspension signal.

pub mod memory;
pub mod signal;
pub mod thread;

use crate::util::Address;

/// Get an address on the current stack that is close to the stack pointer.
#[inline(never)]
pub fn approximate_stack_pointer() -> Address {
    let marker = 0usize;
    Address::from_ref(std::hint::black_box(&marker))
}
