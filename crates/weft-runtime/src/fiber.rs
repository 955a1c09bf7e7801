//! The fiber primitive
//!
//! A fiber is a cooperatively scheduled task with its own stack and saved
//! register window. Switching costs a handful of nanoseconds: one
//! callee-saved window store plus one load.
//!
//! Lifecycle: INIT -> EXEC -> (HOLD <-> EXEC)* -> TERM, or EXCEPT if the
//! entry closure panics. `reset` takes a TERM/EXCEPT/INIT fiber back to INIT
//! with a new closure, reusing the stack.
//!
//! The switch protocol: `resume` stores the caller's window on its own stack
//! frame and publishes it as this thread's dispatch window; `yield_to_hold`/
//! `yield_to_ready` switch back to that window. Resuming nests, which is how
//! a caller-participating scheduler runs its dispatch loop inside a fiber of
//! its own.

use crate::arch::{self, Context};
use crate::config;
use crate::stack::FiberStack;
use crate::tls;
use std::cell::UnsafeCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use weft_core::constants::MIN_STACK_SIZE;
use weft_core::error::EngineResult;
use weft_core::{wdebug, werror};

/// Boxed task body
pub type TaskFn = Box<dyn FnOnce() + Send + 'static>;

/// Fiber lifecycle states
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    /// Created or reset, not yet run
    Init = 0,
    /// Runnable, waiting to be picked up
    Ready = 1,
    /// Currently executing on some thread
    Exec = 2,
    /// Suspended, waiting to be rescheduled by an event or timer
    Hold = 3,
    /// Entry closure returned
    Term = 4,
    /// Entry closure panicked
    Except = 5,
}

impl FiberState {
    /// TERM or EXCEPT
    #[inline]
    pub const fn is_finished(&self) -> bool {
        matches!(self, FiberState::Term | FiberState::Except)
    }

    /// States a fiber may be resumed from
    #[inline]
    pub const fn is_resumable(&self) -> bool {
        matches!(self, FiberState::Init | FiberState::Ready | FiberState::Hold)
    }
}

impl From<u8> for FiberState {
    fn from(v: u8) -> Self {
        match v {
            0 => FiberState::Init,
            1 => FiberState::Ready,
            2 => FiberState::Exec,
            3 => FiberState::Hold,
            4 => FiberState::Term,
            _ => FiberState::Except,
        }
    }
}

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);
static FIBER_COUNT: AtomicUsize = AtomicUsize::new(0);

/// A cooperatively scheduled, stack-switched task
pub struct Fiber {
    id: u64,
    state: AtomicU8,
    /// Set while a worker is between switching in and having the context
    /// fully stored back. A fiber must not be resumed while this holds.
    busy: AtomicBool,
    stack: FiberStack,
    ctx: UnsafeCell<Context>,
    entry: UnsafeCell<Option<TaskFn>>,
}

// The UnsafeCell fields are only touched by the single thread that holds the
// fiber in EXEC, which the state machine plus `busy` flag guarantee.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a fiber with the configured default stack size.
    pub fn new<F>(cb: F) -> EngineResult<Arc<Fiber>>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_stack_size(cb, 0)
    }

    /// Create a fiber with an explicit stack size (0 = configured default).
    /// Explicit sizes are floored at the same minimum the config enforces.
    pub fn with_stack_size<F>(cb: F, stack_size: usize) -> EngineResult<Arc<Fiber>>
    where
        F: FnOnce() + Send + 'static,
    {
        let stack_size = if stack_size == 0 {
            config::stack_size()
        } else {
            stack_size.max(MIN_STACK_SIZE)
        };
        let stack = FiberStack::alloc(stack_size)?;

        let fiber = Arc::new(Fiber {
            id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(FiberState::Init as u8),
            busy: AtomicBool::new(false),
            stack,
            ctx: UnsafeCell::new(Context::new()),
            entry: UnsafeCell::new(Some(Box::new(cb))),
        });
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);

        unsafe {
            arch::init_context(
                fiber.ctx.get(),
                fiber.stack.top(),
                fiber_main as usize,
                Arc::as_ptr(&fiber) as usize,
            );
        }
        wdebug!("fiber {} created, stack {} bytes", fiber.id, fiber.stack.size());
        Ok(fiber)
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        FiberState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[inline]
    pub(crate) fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Replace the entry closure and rewind to INIT, reusing the stack.
    ///
    /// Only legal on a fiber that has not started or has finished.
    pub fn reset<F>(self: &Arc<Self>, cb: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let state = self.state();
        assert!(
            matches!(state, FiberState::Init | FiberState::Term | FiberState::Except),
            "reset on fiber {} in state {:?}",
            self.id,
            state
        );
        unsafe {
            *self.entry.get() = Some(Box::new(cb));
            arch::init_context(
                self.ctx.get(),
                self.stack.top(),
                fiber_main as usize,
                Arc::as_ptr(self) as usize,
            );
        }
        self.set_state(FiberState::Init);
    }

    /// Switch the calling thread into this fiber.
    ///
    /// Returns when the fiber yields, finishes or panics. The fiber must be
    /// INIT, READY or HOLD; resuming an EXEC or finished fiber is a bug and
    /// aborts.
    pub fn resume(self: &Arc<Self>) {
        let state = self.state();
        assert!(
            state.is_resumable(),
            "resume on fiber {} in state {:?}",
            self.id,
            state
        );
        // A racing switch-out on another worker may still be storing the
        // window; wait for it to land.
        while self.busy.load(Ordering::Acquire) {
            std::hint::spin_loop();
        }
        self.busy.store(true, Ordering::Relaxed);
        self.set_state(FiberState::Exec);

        let prev_fiber = tls::set_current_fiber(Some(self.clone()));
        let mut here = Context::new();
        let prev_dispatch = tls::set_dispatch_ctx(&mut here);

        unsafe {
            arch::switch_context(&mut here, self.ctx.get());
        }

        // The fiber switched back; its window is stored.
        tls::set_dispatch_ctx(prev_dispatch);
        tls::set_current_fiber(prev_fiber);
        self.busy.store(false, Ordering::Release);
    }

    /// Suspend the current fiber as HOLD. Something must hold a handle and
    /// reschedule it, or it never runs again.
    pub fn yield_to_hold() {
        Self::yield_with(FiberState::Hold)
    }

    /// Suspend the current fiber as READY; the dispatcher re-queues it.
    pub fn yield_to_ready() {
        Self::yield_with(FiberState::Ready)
    }

    fn yield_with(state: FiberState) {
        let cur = tls::current_fiber().expect("yield outside a fiber");
        let dispatch = tls::dispatch_ctx();
        assert!(!dispatch.is_null(), "yield with no dispatch window");
        cur.set_state(state);
        unsafe {
            arch::switch_context(cur.ctx.get(), dispatch);
        }
        // resumed
    }

    /// The fiber currently executing on the calling thread
    #[inline]
    pub fn current() -> Option<Arc<Fiber>> {
        tls::current_fiber()
    }

    /// Id of the current fiber, 0 when not inside one
    #[inline]
    pub fn current_id() -> u64 {
        tls::current_fiber().map(|f| f.id).unwrap_or(0)
    }

    /// Number of live fibers in the process
    #[inline]
    pub fn total_count() -> usize {
        FIBER_COUNT.load(Ordering::Relaxed)
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        FIBER_COUNT.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(
            self.state() != FiberState::Exec,
            "dropping fiber {} while executing",
            self.id
        );
        wdebug!("fiber {} dropped in state {:?}", self.id, self.state());
    }
}

/// Entry point every fiber starts in, reached through the arch trampoline.
extern "C" fn fiber_main(arg: usize) {
    let fiber = unsafe { &*(arg as *const Fiber) };
    let cb = unsafe { (*fiber.entry.get()).take() };

    let outcome = panic::catch_unwind(AssertUnwindSafe(move || {
        if let Some(cb) = cb {
            cb();
        }
    }));
    match outcome {
        Ok(()) => fiber.set_state(FiberState::Term),
        Err(payload) => {
            fiber.set_state(FiberState::Except);
            werror!("fiber {} panicked: {}", fiber.id, panic_message(&payload));
        }
    }

    let dispatch = tls::dispatch_ctx();
    unsafe {
        arch::switch_context(fiber.ctx.get(), dispatch);
    }
    unreachable!("finished fiber resumed");
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic payload>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_lifecycle_and_yield() {
        let steps = Arc::new(AtomicU32::new(0));
        let s = steps.clone();
        let fiber = Fiber::new(move || {
            s.fetch_add(1, Ordering::SeqCst);
            Fiber::yield_to_hold();
            s.fetch_add(1, Ordering::SeqCst);
            Fiber::yield_to_hold();
            s.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        assert_eq!(fiber.state(), FiberState::Init);

        fiber.resume();
        assert_eq!(steps.load(Ordering::SeqCst), 1);
        assert_eq!(fiber.state(), FiberState::Hold);

        fiber.resume();
        assert_eq!(steps.load(Ordering::SeqCst), 2);
        assert_eq!(fiber.state(), FiberState::Hold);

        // K yields complete in exactly K+1 resumes
        fiber.resume();
        assert_eq!(steps.load(Ordering::SeqCst), 3);
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn test_total_count_returns_to_baseline() {
        // other tests create fibers concurrently; retry until we observe a
        // quiet window
        for _ in 0..100 {
            let before = Fiber::total_count();
            let observed = {
                let f = Fiber::new(|| {}).unwrap();
                let mid = Fiber::total_count();
                f.resume();
                mid
            };
            if observed == before + 1 && Fiber::total_count() == before {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        panic!("fiber count never settled");
    }

    #[test]
    fn test_current_inside_and_outside() {
        assert!(Fiber::current().is_none());
        assert_eq!(Fiber::current_id(), 0);

        let fiber = Fiber::new(|| {
            let me = Fiber::current().unwrap();
            assert_eq!(me.state(), FiberState::Exec);
            assert_eq!(Fiber::current_id(), me.id());
        })
        .unwrap();
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
        assert!(Fiber::current().is_none());
    }

    #[test]
    fn test_yield_to_ready_state() {
        let fiber = Fiber::new(|| {
            Fiber::yield_to_ready();
        })
        .unwrap();
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Ready);
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn test_reset_reuses_fiber() {
        let hits = Arc::new(AtomicU32::new(0));

        let h = hits.clone();
        let fiber = Fiber::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        let id = fiber.id();
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);

        let h = hits.clone();
        fiber.reset(move || {
            h.fetch_add(10, Ordering::SeqCst);
        });
        assert_eq!(fiber.state(), FiberState::Init);
        assert_eq!(fiber.id(), id);
        fiber.resume();
        assert_eq!(hits.load(Ordering::SeqCst), 11);
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn test_tiny_explicit_stack_clamped_to_minimum() {
        let fiber = Fiber::with_stack_size(
            || {
                // needs more room than the single page a raw size of 1 would map
                let mut scratch = [0u8; 8 * 1024];
                for (i, byte) in scratch.iter_mut().enumerate() {
                    *byte = i as u8;
                }
                assert_eq!(scratch[511], 255);
            },
            1,
        )
        .unwrap();
        assert!(fiber.stack.size() >= MIN_STACK_SIZE);
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn test_panic_becomes_except() {
        weft_core::log::set_level(weft_core::log::LogLevel::Off);
        let fiber = Fiber::new(|| {
            panic!("boom");
        })
        .unwrap();
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Except);
        // the worker thread survives and can run other fibers
        let ok = Fiber::new(|| {}).unwrap();
        ok.resume();
        assert_eq!(ok.state(), FiberState::Term);
    }

    #[test]
    fn test_resume_finished_fiber_panics() {
        let fiber = Fiber::new(|| {}).unwrap();
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| fiber.resume()));
        assert!(result.is_err());
    }

    #[test]
    fn test_nested_resume() {
        let inner_ran = Arc::new(AtomicU32::new(0));
        let i = inner_ran.clone();
        let outer = Fiber::new(move || {
            let i2 = i.clone();
            let inner = Fiber::new(move || {
                i2.fetch_add(1, Ordering::SeqCst);
                Fiber::yield_to_hold();
                i2.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
            inner.resume();
            assert_eq!(inner.state(), FiberState::Hold);
            // current() points back at the outer fiber between resumes
            assert!(Fiber::current().is_some());
            inner.resume();
            assert_eq!(inner.state(), FiberState::Term);
        })
        .unwrap();
        outer.resume();
        assert_eq!(outer.state(), FiberState::Term);
        assert_eq!(inner_ran.load(Ordering::SeqCst), 2);
    }
}
