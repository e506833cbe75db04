/// An abstraction of addresses.
pub mod address;
/// Constants used throughout the crate.
pub mod constants;
/// Setup errors.
pub mod error;
/// Lock primitives with explicit owners.
pub mod locks;
/// Logger initialization
pub mod logger;
/// Runtime options.
pub mod options;
/// Wrappers for OS calls.
pub mod os;
/// Helpers for tests.
#[doc(hidden)]
pub mod test_util;

pub use self::address::Address;
pub use self::error::RuntimeError;
