//! Guard-paged fiber stacks
//!
//! One anonymous private mapping per stack. The lowest page is remapped
//! PROT_NONE so that overflow faults instead of corrupting a neighbor.

use weft_core::error::{MemoryError, SchedResult};

/// A fiber stack: `size` usable bytes above a single guard page.
///
/// Layout, low address to high:
///
/// ```text
/// [ guard page (PROT_NONE) | usable stack, grows downward ]
/// base                     base+page                      top
/// ```
pub struct GuardedStack {
    base: *mut u8,
    total: usize,
    size: usize,
}

impl GuardedStack {
    /// Map a new stack with `size` usable bytes.
    pub fn alloc(size: usize) -> SchedResult<GuardedStack> {
        let page = page_size();
        if size < page {
            return Err(MemoryError::StackTooSmall.into());
        }
        let total = size + page;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(MemoryError::AllocationFailed.into());
        }

        // Forbid the lowest page; overflow now delivers SIGSEGV
        if unsafe { libc::mprotect(base, page, libc::PROT_NONE) } != 0 {
            unsafe { libc::munmap(base, total) };
            return Err(MemoryError::ProtectionFailed.into());
        }

        Ok(GuardedStack {
            base: base as *mut u8,
            total,
            size,
        })
    }

    /// Highest address of the mapping; the initial stack pointer.
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.total) }
    }

    /// Usable bytes (excludes the guard page).
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// First byte of the guard page.
    #[inline]
    pub fn guard_base(&self) -> *const u8 {
        self.base
    }
}

impl Drop for GuardedStack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.total);
        }
    }
}

/// System page size.
#[inline]
pub fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_touch() {
        let stack = GuardedStack::alloc(128 * 1024).unwrap();
        assert_eq!(stack.size(), 128 * 1024);
        // The usable region is writable end to end
        unsafe {
            let lowest_usable = stack.guard_base().add(page_size()) as *mut u8;
            *lowest_usable = 0xAB;
            *stack.top().sub(1) = 0xCD;
            assert_eq!(*lowest_usable, 0xAB);
        }
    }

    #[test]
    fn test_too_small_rejected() {
        assert!(GuardedStack::alloc(16).is_err());
    }

    #[test]
    fn test_guard_below_usable() {
        let stack = GuardedStack::alloc(64 * 1024).unwrap();
        assert!((stack.guard_base() as usize) < (stack.top() as usize));
        assert_eq!(stack.top() as usize - stack.guard_base() as usize, 64 * 1024 + page_size());
    }
}
