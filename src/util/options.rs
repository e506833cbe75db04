use strum_macros::{Display, EnumString};

use crate::util::constants::*;

/// How a rendezvous brings the other threads to a safe point.
#[derive(Copy, Clone, Debug, PartialEq, Eq, EnumString, Display)]
#[strum(ascii_case_insensitive)]
pub enum RendezvousKind {
    /// Threads join at their next safepoint poll or native-code transition.
    Cooperative,
    /// Threads that are not already parked in native code are forced to join by a signal.
    Uncooperative,
}

fn always_valid<T>(_: &T) -> bool {
    true
}

const DEFAULT_MIN_HEAP_SIZE: usize = 4 * BYTES_IN_MBYTE;
const DEFAULT_MAX_HEAP_SIZE: usize = 64 * BYTES_IN_MBYTE;
const DEFAULT_THREAD_STACK_SIZE: usize = BYTES_IN_MBYTE;

/// The prefix of environment variables that set options, e.g. `RVGC_MAX_HEAP_SIZE=67108864`.
pub const ENV_VAR_PREFIX: &str = "RVGC_";

macro_rules! options {
    ($($(#[$outer:meta])* $name:ident: $type:ty [$validator:expr] = $default:expr),* $(,)?) => [
        #[derive(Clone, Debug)]
        pub struct Options {
            $($(#[$outer])* pub $name: $type),*
        }
        impl Options {
            /// Set an option by its name. The value is parsed into the option's type and
            /// validated. Returns false and keeps the old value if either step fails.
            pub fn set_from_str(&mut self, s: &str, val: &str) -> bool {
                match s {
                    // Parse the given value from str (by env vars or by calling set_option()) to the right type
                    $(stringify!($name) => if let Ok(val) = val.parse::<$type>() {
                        // Validate
                        let validate_fn = $validator;
                        let is_valid = validate_fn(&val);
                        if is_valid {
                            // Only set value if valid.
                            self.$name = val;
                        } else {
                            warn!("Unable to set {}={:?}. Invalid value. Keeping {:?}.", s, val, self.$name);
                        }
                        is_valid
                    } else {
                        warn!("Unable to set {}={:?}. Can't parse value. Keeping {:?}.", s, val, self.$name);
                        false
                    },)*
                    _ => {
                        warn!("Unknown option {}={:?}. Ignored.", s, val);
                        false
                    }
                }
            }

            fn is_option_name(s: &str) -> bool {
                matches!(s, $(stringify!($name))|*)
            }
        }
        impl Default for Options {
            fn default() -> Self {
                Options {
                    $($name: $default),*
                }
            }
        }
    ]
}

options! {
    /// How threads are brought to a safe point for collection.
    rendezvous:              RendezvousKind [always_valid] = RendezvousKind::Cooperative,
    /// Collect automatically when the allocation budget runs out.
    auto_collect:            bool           [always_valid] = true,
    /// The allocation budget after a collection is never below this many bytes.
    min_heap_size:           usize          [|v: &usize| *v > 0] = DEFAULT_MIN_HEAP_SIZE,
    /// Size of the heap region in bytes. Allocation never goes beyond it.
    max_heap_size:           usize          [|v: &usize| *v > 0] = DEFAULT_MAX_HEAP_SIZE,
    /// Number of thread slots, and of pooled stacks.
    max_threads:             usize          [|v: &usize| (1..=MAX_THREADS_LIMIT).contains(v)] = 64,
    /// Size of each pooled stack. Must be a power of two so that a stack address maps to a slot
    /// with a shift.
    thread_stack_size:       usize          [|v: &usize| v.is_power_of_two() && *v >= MIN_THREAD_STACK_SIZE] = DEFAULT_THREAD_STACK_SIZE,
    /// Recursion depth at which a thin lock is inflated to a fat lock.
    thin_lock_max_recursion: usize          [|v: &usize| (1..=MAX_THIN_LOCK_RECURSION).contains(v)] = MAX_THIN_LOCK_RECURSION,
}

impl Options {
    /// Read options from environment variables that start with [`ENV_VAR_PREFIX`].
    /// Variables that do not name an option are ignored.
    pub fn read_env_var_settings(&mut self) {
        for (key, val) in std::env::vars() {
            // strip the prefix, and get the lower case string
            if let Some(rest_of_key) = key.strip_prefix(ENV_VAR_PREFIX) {
                let lowercase: &str = &rest_of_key.to_lowercase();
                if Self::is_option_name(lowercase) {
                    self.set_from_str(lowercase, &val);
                }
            }
        }
    }

    /// Set options from a whitespace-separated list of `name=value` pairs. Returns true only if
    /// every pair was applied.
    pub fn set_bulk_from_str(&mut self, options: &str) -> bool {
        let mut all_applied = true;
        for opt in options.split_ascii_whitespace() {
            match opt.split_once('=') {
                Some((name, value)) => all_applied &= self.set_from_str(name, value),
                None => {
                    warn!("Malformed option {:?}. Expected name=value.", opt);
                    all_applied = false;
                }
            }
        }
        all_applied
    }

    /// Checks that involve more than one option.
    pub(crate) fn check_consistency(&self) -> Result<(), String> {
        if self.min_heap_size > self.max_heap_size {
            return Err(format!(
                "min_heap_size ({}) is larger than max_heap_size ({})",
                self.min_heap_size, self.max_heap_size
            ));
        }
        Ok(())
    }
}
