//! The bit layout of the object header word. All header manipulation goes through this module.
//!
//! ```text
//!  63                         17 16        9  8   7        0
//! +-----------------------------+-----------+---+----------+
//! | owner thread id + 1         | recursion | 0 | GC bits  |   thin (owner 0 means unlocked)
//! +-----------------------------+-----------+---+----------+
//! | fat lock index                          | 1 | GC bits  |   fat
//! +-----------------------------------------+---+----------+
//! ```
//!
//! The GC bits belong to the collector and are preserved by every lock transition. Once the fat
//! bit is set it is never cleared.

use static_assertions::const_assert;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::threads::ThreadId;
use crate::util::constants::{MAX_THIN_LOCK_RECURSION, MAX_THREADS_LIMIT};

const GC_BITS_MASK: usize = 0xff;
const FAT_BIT: usize = 1 << 8;
const COUNT_SHIFT: usize = 9;
const COUNT_MASK: usize = 0xff << COUNT_SHIFT;
const OWNER_SHIFT: usize = 17;
const INDEX_SHIFT: usize = 9;

/// The GC bit that mirrors the chunk mark parity.
pub(crate) const MARK_BIT: u8 = 1;

const_assert!(MAX_THIN_LOCK_RECURSION <= COUNT_MASK >> COUNT_SHIFT);
const_assert!(OWNER_SHIFT + 11 <= usize::BITS as usize);
const_assert!(MAX_THREADS_LIMIT < 1 << 11);

/// The lock state encoded in a header word.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum LockState {
    Unlocked,
    Thin { owner: ThreadId, count: usize },
    Fat { index: usize },
}

impl LockState {
    pub fn decode(word: usize) -> LockState {
        if word & FAT_BIT != 0 {
            return LockState::Fat {
                index: word >> INDEX_SHIFT,
            };
        }
        match word >> OWNER_SHIFT {
            0 => LockState::Unlocked,
            owner => LockState::Thin {
                owner: ThreadId(owner - 1),
                count: (word & COUNT_MASK) >> COUNT_SHIFT,
            },
        }
    }

    /// Encode this state, keeping the GC bits of `word`.
    pub fn encode(self, word: usize) -> usize {
        let gc_bits = word & GC_BITS_MASK;
        match self {
            LockState::Unlocked => gc_bits,
            LockState::Thin { owner, count } => {
                debug_assert!(count > 0 && count <= MAX_THIN_LOCK_RECURSION);
                gc_bits | ((owner.0 + 1) << OWNER_SHIFT) | (count << COUNT_SHIFT)
            }
            LockState::Fat { index } => gc_bits | FAT_BIT | (index << INDEX_SHIFT),
        }
    }
}

/// An object's header word.
#[derive(Copy, Clone)]
pub struct HeaderWord<'a>(&'a AtomicUsize);

impl<'a> HeaderWord<'a> {
    pub fn new(word: &'a AtomicUsize) -> Self {
        HeaderWord(word)
    }

    pub fn load(self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    pub fn state(self) -> LockState {
        LockState::decode(self.load())
    }

    /// Move from the state encoded in `old` to `new`. Fails with the current word if the header
    /// changed since `old` was read.
    pub fn transition(self, old: usize, new: LockState) -> Result<(), usize> {
        self.0
            .compare_exchange(old, new.encode(old), Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
    }

    pub fn gc_bits(self) -> u8 {
        (self.load() & GC_BITS_MASK) as u8
    }

    /// Set or clear GC bits without touching the lock state.
    pub fn set_gc_bit(self, bit: u8, value: bool) {
        let bit = bit as usize;
        let mut old = self.load();
        loop {
            let new = if value { old | bit } else { old & !bit };
            if new == old {
                return;
            }
            match self
                .0
                .compare_exchange_weak(old, new, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return,
                Err(current) => old = current,
            }
        }
    }

    /// The header word of a fresh object.
    pub fn initial(mark: bool) -> usize {
        if mark {
            MARK_BIT as usize
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_unlocked() {
        assert_eq!(LockState::decode(0), LockState::Unlocked);
        assert_eq!(LockState::decode(0x7f), LockState::Unlocked);
    }

    #[test]
    fn thin_keeps_gc_bits() {
        let word = 0xa5;
        let thin = LockState::Thin {
            owner: ThreadId(0),
            count: 1,
        };
        let encoded = thin.encode(word);
        assert_eq!(encoded & GC_BITS_MASK, 0xa5);
        assert_eq!(LockState::decode(encoded), thin);
        assert_eq!(LockState::Unlocked.encode(encoded), 0xa5);
    }

    #[test]
    fn widest_fields() {
        let thin = LockState::Thin {
            owner: ThreadId(MAX_THREADS_LIMIT - 1),
            count: MAX_THIN_LOCK_RECURSION,
        };
        assert_eq!(LockState::decode(thin.encode(0xff)), thin);
        let fat = LockState::Fat { index: 1 << 40 };
        assert_eq!(LockState::decode(fat.encode(0xff)), fat);
    }

    #[test]
    fn transition_fails_on_change() {
        let word = AtomicUsize::new(HeaderWord::initial(true));
        let header = HeaderWord::new(&word);
        let old = header.load();
        let thin = LockState::Thin {
            owner: ThreadId(2),
            count: 1,
        };
        assert!(header.transition(old, thin).is_ok());
        assert_eq!(header.state(), thin);
        assert_eq!(header.gc_bits(), MARK_BIT);
        let current = header.transition(old, LockState::Fat { index: 0 }).unwrap_err();
        assert_eq!(LockState::decode(current), thin);
    }

    #[test]
    fn gc_bits_do_not_disturb_lock() {
        let word = AtomicUsize::new(0);
        let header = HeaderWord::new(&word);
        header
            .transition(0, LockState::Fat { index: 7 })
            .unwrap();
        header.set_gc_bit(MARK_BIT, true);
        assert_eq!(header.state(), LockState::Fat { index: 7 });
        assert_eq!(header.gc_bits(), MARK_BIT);
        header.set_gc_bit(MARK_BIT, false);
        assert_eq!(header.gc_bits(), 0);
        assert_eq!(header.state(), LockState::Fat { index: 7 });
    }
}
