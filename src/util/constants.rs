/// log2 of the number of bytes in a kilobyte
pub const LOG_BYTES_IN_KBYTE: u8 = 10;
/// The number of bytes in a kilobyte
pub const BYTES_IN_KBYTE: usize = 1 << LOG_BYTES_IN_KBYTE;

/// log2 of the number of bytes in a megabyte
pub const LOG_BYTES_IN_MBYTE: u8 = 20;
/// The number of bytes in a megabyte
pub const BYTES_IN_MBYTE: usize = 1 << LOG_BYTES_IN_MBYTE;

#[cfg(target_pointer_width = "32")]
pub const LOG_BYTES_IN_WORD: u8 = 2;
#[cfg(target_pointer_width = "64")]
pub const LOG_BYTES_IN_WORD: u8 = 3;
/// The number of bytes in a machine word
pub const BYTES_IN_WORD: usize = 1 << LOG_BYTES_IN_WORD;

/// log2 of the number of bytes in a page
pub const LOG_BYTES_IN_PAGE: u8 = 12;
/// The number of bytes in a page
pub const BYTES_IN_PAGE: usize = 1 << LOG_BYTES_IN_PAGE;

/// Upper bound of `max_threads`. The process-wide signal table is sized by it.
pub const MAX_THREADS_LIMIT: usize = 1024;

/// Smallest stack we hand to a pooled thread.
pub const MIN_THREAD_STACK_SIZE: usize = 64 * BYTES_IN_KBYTE;

/// The widest thin-lock recursion count that fits in the header.
pub const MAX_THIN_LOCK_RECURSION: usize = 255;
