//! mmap-backed fiber stacks
//!
//! Each stack is a private anonymous mapping with a PROT_NONE guard page at
//! the low end, so running off the stack faults instead of silently
//! corrupting a neighbouring allocation.

use weft_core::error::{EngineError, EngineResult, SysError};

/// Guard page size (one page)
const GUARD_SIZE: usize = 4096;

/// A fiber's stack mapping. Unmapped on drop.
pub struct FiberStack {
    base: *mut u8,
    total: usize,
}

unsafe impl Send for FiberStack {}
unsafe impl Sync for FiberStack {}

impl FiberStack {
    /// Map a stack of (at least) `size` usable bytes plus a guard page.
    pub fn alloc(size: usize) -> EngineResult<Self> {
        let size = round_up_to_page(size);
        let total = size + GUARD_SIZE;

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
            return Err(EngineError::StackAlloc(SysError::last()));
        }
        let base = base as *mut u8;

        // Guard page at the low end; the stack grows down toward it.
        let rt = unsafe { libc::mprotect(base as *mut libc::c_void, GUARD_SIZE, libc::PROT_NONE) };
        if rt != 0 {
            let err = SysError::last();
            unsafe { libc::munmap(base as *mut libc::c_void, total) };
            return Err(EngineError::StackProtect(err));
        }

        Ok(FiberStack { base, total })
    }

    /// High end of the mapping; initial stack pointer for a fresh fiber.
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.total) }
    }

    /// Usable bytes between the guard page and the top.
    #[inline]
    pub fn size(&self) -> usize {
        self.total - GUARD_SIZE
    }
}

impl Drop for FiberStack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.total);
        }
    }
}

fn round_up_to_page(size: usize) -> usize {
    (size + 4095) & !4095
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_size() {
        let stack = FiberStack::alloc(64 * 1024).unwrap();
        assert_eq!(stack.size(), 64 * 1024);
        assert!(!stack.top().is_null());
    }

    #[test]
    fn test_size_rounded_to_page() {
        let stack = FiberStack::alloc(1000).unwrap();
        assert_eq!(stack.size(), 4096);
    }

    #[test]
    fn test_stack_is_writable_below_top() {
        let stack = FiberStack::alloc(16 * 1024).unwrap();
        unsafe {
            let p = stack.top().sub(8);
            p.write(0xAB);
            assert_eq!(p.read(), 0xAB);
        }
    }
}
