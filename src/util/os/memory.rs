use crate::util::Address;
use std::io::Result;

/// Map `size` bytes of zeroed, readable and writable anonymous memory anywhere in the address
/// space.
pub fn mmap_anonymous(size: usize) -> Result<Address> {
    let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            flags,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(Address::from_ptr(ptr))
    }
}

pub fn munmap(start: Address, size: usize) -> Result<()> {
    wrap_libc_call(&|| unsafe { libc::munmap(start.to_mut_ptr(), size) }, 0)
}

/// Make a range inaccessible. Used for stack guard pages.
pub fn mprotect(start: Address, size: usize) -> Result<()> {
    wrap_libc_call(
        &|| unsafe { libc::mprotect(start.to_mut_ptr(), size, libc::PROT_NONE) },
        0,
    )
}

pub fn wrap_libc_call<T: PartialEq>(f: &dyn Fn() -> T, expect: T) -> Result<()> {
    let ret = f();
    if ret == expect {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::constants::BYTES_IN_PAGE;
    use std::sync::atomic::Ordering;

    #[test]
    fn map_zeroed_and_unmap() {
        let size = 4 * BYTES_IN_PAGE;
        let start = mmap_anonymous(size).unwrap();
        assert!(start.is_aligned_to(BYTES_IN_PAGE));
        unsafe {
            assert_eq!(start.load_word(Ordering::SeqCst), 0);
            (start + (size - 8)).store_word(1, Ordering::SeqCst);
        }
        munmap(start, size).unwrap();
    }

    #[test]
    fn protect_guard_page() {
        let size = 2 * BYTES_IN_PAGE;
        let start = mmap_anonymous(size).unwrap();
        mprotect(start, BYTES_IN_PAGE).unwrap();
        // The page above the guard stays writable.
        unsafe { (start + BYTES_IN_PAGE).store_word(3, Ordering::SeqCst) };
        munmap(start, size).unwrap();
    }
}
