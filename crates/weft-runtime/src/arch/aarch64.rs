//! aarch64 context switching
//!
//! Saves the AAPCS64 callee-saved window: sp, resume pc, x19-x28, fp (x29),
//! lr (x30) and the low halves of v8-v15 (d8-d15).

use std::arch::naked_asm;

/// Callee-saved register window of a suspended fiber
///
/// Field order is load-bearing: the assembly below addresses the struct by
/// fixed offsets.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Context {
    pub sp: u64,       // 0x00
    pub pc: u64,       // 0x08
    pub x: [u64; 10],  // 0x10: x19-x28
    pub fp: u64,       // 0x60: x29
    pub lr: u64,       // 0x68: x30
    pub d: [u64; 8],   // 0x70: d8-d15
}

const _: () = assert!(std::mem::size_of::<Context>() == 0xB0);

impl Context {
    pub const fn new() -> Self {
        Context { sp: 0, pc: 0, x: [0; 10], fp: 0, lr: 0, d: [0; 8] }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// Prepare a fresh context so the first switch into it runs `entry(arg)`
/// on the given stack.
///
/// # Safety
///
/// `ctx` must be valid for writes. `stack_top` must be the high end of a
/// mapped stack region. `entry` must be an `extern "C" fn(usize)` that never
/// returns (it must switch away instead).
pub unsafe fn init_context(ctx: *mut Context, stack_top: *mut u8, entry: usize, arg: usize) {
    // AAPCS64 requires sp to stay 16-aligned.
    let sp = (stack_top as usize) & !0xF;

    let ctx = &mut *ctx;
    *ctx = Context::new();
    ctx.sp = sp as u64;
    ctx.pc = entry_trampoline as usize as u64;
    ctx.x[0] = entry as u64; // x19
    ctx.x[1] = arg as u64;   // x20
}

/// First instruction pointer of every fiber: moves the entry argument into
/// place and calls the entry function. The entry function must never return.
#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!(
        "mov x0, x20",
        "blr x19",
        "brk #1",
    );
}

/// Store the current window into `save`, load `load`, continue there.
///
/// Returns (into the saved window) when something later switches back.
///
/// # Safety
///
/// Both pointers must be valid; `load` must hold a window produced by
/// `init_context` or a previous save.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_save: *mut Context, _load: *const Context) {
    naked_asm!(
        // Save callee-saved registers into save (x0)
        "mov x10, sp",
        "adr x11, 2f",
        "stp x10, x11, [x0, #0x00]",
        "stp x19, x20, [x0, #0x10]",
        "stp x21, x22, [x0, #0x20]",
        "stp x23, x24, [x0, #0x30]",
        "stp x25, x26, [x0, #0x40]",
        "stp x27, x28, [x0, #0x50]",
        "stp x29, x30, [x0, #0x60]",
        "stp d8,  d9,  [x0, #0x70]",
        "stp d10, d11, [x0, #0x80]",
        "stp d12, d13, [x0, #0x90]",
        "stp d14, d15, [x0, #0xA0]",
        // Load the target window from load (x1)
        "ldp x10, x11, [x1, #0x00]",
        "ldp x19, x20, [x1, #0x10]",
        "ldp x21, x22, [x1, #0x20]",
        "ldp x23, x24, [x1, #0x30]",
        "ldp x25, x26, [x1, #0x40]",
        "ldp x27, x28, [x1, #0x50]",
        "ldp x29, x30, [x1, #0x60]",
        "ldp d8,  d9,  [x1, #0x70]",
        "ldp d10, d11, [x1, #0x80]",
        "ldp d12, d13, [x1, #0x90]",
        "ldp d14, d15, [x1, #0xA0]",
        "mov sp, x10",
        "br x11",
        // Resume point for the saved window
        "2:",
        "ret",
    );
}
