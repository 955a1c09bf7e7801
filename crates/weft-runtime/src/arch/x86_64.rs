//! x86_64 context switching
//!
//! Saves the System V callee-saved window (rsp, rip, rbx, rbp, r12-r15).

use std::arch::naked_asm;

/// Callee-saved register window of a suspended fiber
///
/// Field order is load-bearing: the assembly below addresses the struct by
/// fixed offsets.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Context {
    pub rsp: u64, // 0x00
    pub rip: u64, // 0x08
    pub rbx: u64, // 0x10
    pub rbp: u64, // 0x18
    pub r12: u64, // 0x20
    pub r13: u64, // 0x28
    pub r14: u64, // 0x30
    pub r15: u64, // 0x38
}

const _: () = assert!(std::mem::size_of::<Context>() == 0x40);

impl Context {
    pub const fn new() -> Self {
        Context { rsp: 0, rip: 0, rbx: 0, rbp: 0, r12: 0, r13: 0, r14: 0, r15: 0 }
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
    // 16-align so the trampoline's `call` leaves the entry function with the
    // ABI-required rsp % 16 == 8.
    let sp = (stack_top as usize) & !0xF;

    let ctx = &mut *ctx;
    ctx.rsp = sp as u64;
    ctx.rip = entry_trampoline as usize as u64;
    ctx.rbx = 0;
    ctx.rbp = 0;
    ctx.r12 = entry as u64;
    ctx.r13 = arg as u64;
    ctx.r14 = 0;
    ctx.r15 = 0;
}

/// First instruction pointer of every fiber: moves the entry argument into
/// place and calls the entry function. The entry function must never return.
#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        "ud2",
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
        // Save callee-saved registers into save (rdi)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 2f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load the target window from load (rsi)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "jmp rax",
        // Resume point for the saved window
        "2:",
        "ret",
    );
}
