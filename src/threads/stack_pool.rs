use crate::util::constants::BYTES_IN_PAGE;
use crate::util::os::memory;
use crate::util::Address;

/// A contiguous range of equally sized thread stacks.
///
/// The range is aligned to the stack size, which is a power of two, so the stack holding any
/// address in the range is found with a subtraction and a shift. The lowest page of each stack
/// is a guard page.
pub(crate) struct StackPool {
    mapping: Address,
    mapping_size: usize,
    base: Address,
    stack_size: usize,
    log_stack_size: usize,
    stacks: usize,
    leaked: bool,
}

impl StackPool {
    pub fn new(stacks: usize, stack_size: usize) -> std::io::Result<Self> {
        debug_assert!(stack_size.is_power_of_two());
        debug_assert!(stack_size > BYTES_IN_PAGE);
        // One extra stack so that we can align the start.
        let mapping_size = (stacks + 1) * stack_size;
        let mapping = memory::mmap_anonymous(mapping_size)?;
        let base = mapping.align_up(stack_size);
        let pool = StackPool {
            mapping,
            mapping_size,
            base,
            stack_size,
            log_stack_size: stack_size.trailing_zeros() as usize,
            stacks,
            leaked: false,
        };
        for i in 0..stacks {
            memory::mprotect(pool.base + i * stack_size, BYTES_IN_PAGE)?;
        }
        debug!(
            "Reserved {} stacks of {} bytes at {}",
            stacks, stack_size, pool.base
        );
        Ok(pool)
    }

    /// The usable part of stack `index`: its lowest address and its size. The guard page is
    /// excluded.
    pub fn stack(&self, index: usize) -> (Address, usize) {
        assert!(index < self.stacks);
        (
            self.base + index * self.stack_size + BYTES_IN_PAGE,
            self.stack_size - BYTES_IN_PAGE,
        )
    }

    /// The index of the stack that holds `addr`, if any.
    pub fn index_of(&self, addr: Address) -> Option<usize> {
        if addr < self.base || addr >= self.base + self.stacks * self.stack_size {
            return None;
        }
        Some((addr - self.base) >> self.log_stack_size)
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.index_of(addr).is_some()
    }

    /// Keep the stacks mapped forever. Used when the pool is dropped by a thread that still runs
    /// on one of its stacks.
    pub fn leak(&mut self) {
        self.leaked = true;
    }
}

impl Drop for StackPool {
    fn drop(&mut self) {
        if self.leaked {
            return;
        }
        if let Err(e) = memory::munmap(self.mapping, self.mapping_size) {
            warn!("Failed to unmap thread stacks at {}: {}", self.mapping, e);
        }
    }
}
