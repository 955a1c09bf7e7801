//! Architecture-specific context switching
//!
//! Each backend exposes the same minimal interface:
//!
//! - `Context` - the callee-saved register window of a suspended fiber
//! - `init_context(ctx, stack_top, entry, arg)` - prepare a fresh fiber so
//!   the first switch into it calls `entry(arg)` on its own stack
//! - `switch_context(save, load)` - store the current window into `save`,
//!   load `load`, and continue there
//!
//! A switch saves only the callee-saved window, not the full register file;
//! everything else is dead across the call boundary by the ABI.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub use x86_64::{init_context, switch_context, Context};
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub use aarch64::{init_context, switch_context, Context};
    } else {
        compile_error!("unsupported architecture");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    thread_local! {
        static MAIN_CTX: Cell<*mut Context> = const { Cell::new(std::ptr::null_mut()) };
        static HITS: Cell<u32> = const { Cell::new(0) };
    }

    extern "C" fn bounce(arg: usize) {
        HITS.with(|c| c.set(c.get() + 1));
        let back = MAIN_CTX.with(|c| c.get());
        let own = arg as *mut Context;
        unsafe { switch_context(own, back) };
        // resumed once more
        HITS.with(|c| c.set(c.get() + 1));
        unsafe { switch_context(own, back) };
        unreachable!();
    }

    #[test]
    fn test_switch_round_trip() {
        let mut stack = vec![0u8; 64 * 1024];
        let top = unsafe { stack.as_mut_ptr().add(stack.len()) };

        let mut fiber_ctx = Context::new();
        let mut main_ctx = Context::new();
        let fiber_ptr: *mut Context = &mut fiber_ctx;
        let main_ptr: *mut Context = &mut main_ctx;
        MAIN_CTX.with(|c| c.set(main_ptr));

        unsafe {
            init_context(fiber_ptr, top, bounce as usize, fiber_ptr as usize);
            switch_context(main_ptr, fiber_ptr);
        }
        assert_eq!(HITS.with(|c| c.get()), 1);

        unsafe { switch_context(main_ptr, fiber_ptr) };
        assert_eq!(HITS.with(|c| c.get()), 2);
    }
}
