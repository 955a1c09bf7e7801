//! Thread-local runtime context
//!
//! Each OS thread tracks: the fiber it is currently executing, the register
//! window to switch back to on yield, weak handles to the scheduler/reactor
//! driving it, its cached OS thread id, and whether blocking-style I/O on
//! this thread should take the cooperative path.
//!
//! Outside a scheduler worker all of these answer "nothing here" rather than
//! asserting.

use crate::arch::Context;
use crate::fiber::Fiber;
use crate::reactor::IoManager;
use crate::scheduler::Scheduler;
use std::cell::{Cell, RefCell};
use std::sync::{Arc, Weak};

thread_local! {
    /// Fiber currently executing on this thread
    static CURRENT_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// Register window to switch back to when the current fiber yields
    static DISPATCH_CTX: Cell<*mut Context> = const { Cell::new(std::ptr::null_mut()) };

    /// Scheduler driving this thread
    static CURRENT_SCHED: RefCell<Option<Weak<Scheduler>>> = const { RefCell::new(None) };

    /// Reactor driving this thread
    static CURRENT_REACTOR: RefCell<Option<Weak<IoManager>>> = const { RefCell::new(None) };

    /// Cached gettid() result (0 = not yet read)
    static THREAD_ID: Cell<u64> = const { Cell::new(0) };

    /// Whether blocking-style I/O takes the cooperative path on this thread
    static COOP_IO: Cell<bool> = const { Cell::new(false) };
}

/// Swap the current fiber, returning the previous one
pub(crate) fn set_current_fiber(fiber: Option<Arc<Fiber>>) -> Option<Arc<Fiber>> {
    CURRENT_FIBER.with(|cell| std::mem::replace(&mut *cell.borrow_mut(), fiber))
}

/// The fiber currently executing on this thread
#[inline]
pub fn current_fiber() -> Option<Arc<Fiber>> {
    CURRENT_FIBER.with(|cell| cell.borrow().clone())
}

/// Whether this thread is currently inside a fiber
#[inline]
pub fn is_in_fiber() -> bool {
    CURRENT_FIBER.with(|cell| cell.borrow().is_some())
}

/// Swap the dispatch window pointer, returning the previous one
pub(crate) fn set_dispatch_ctx(ctx: *mut Context) -> *mut Context {
    DISPATCH_CTX.with(|cell| cell.replace(ctx))
}

/// The register window a yielding fiber switches back to
#[inline]
pub(crate) fn dispatch_ctx() -> *mut Context {
    DISPATCH_CTX.with(|cell| cell.get())
}

pub(crate) fn set_scheduler(sched: Weak<Scheduler>) {
    CURRENT_SCHED.with(|cell| *cell.borrow_mut() = Some(sched));
}

/// The scheduler driving this thread, if any
pub fn current_scheduler() -> Option<Arc<Scheduler>> {
    CURRENT_SCHED.with(|cell| cell.borrow().as_ref().and_then(|w| w.upgrade()))
}

pub(crate) fn set_reactor(reactor: Weak<IoManager>) {
    CURRENT_REACTOR.with(|cell| *cell.borrow_mut() = Some(reactor));
}

/// The reactor driving this thread, if any
pub fn current_reactor() -> Option<Arc<IoManager>> {
    CURRENT_REACTOR.with(|cell| cell.borrow().as_ref().and_then(|w| w.upgrade()))
}

/// OS thread id of the calling thread (cached)
#[inline]
pub fn thread_id() -> u64 {
    THREAD_ID.with(|cell| {
        let id = cell.get();
        if id != 0 {
            return id;
        }
        let id = unsafe { libc::syscall(libc::SYS_gettid) as u64 };
        cell.set(id);
        id
    })
}

/// Route blocking-style I/O on this thread through the cooperative path.
/// Flipped on when a thread enters a scheduler's dispatch loop.
pub fn enable_coop_io(enabled: bool) {
    COOP_IO.with(|cell| cell.set(enabled));
}

/// Whether blocking-style I/O takes the cooperative path on this thread
#[inline]
pub fn coop_io_enabled() -> bool {
    COOP_IO.with(|cell| cell.get())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_thread_has_nothing() {
        std::thread::spawn(|| {
            assert!(current_fiber().is_none());
            assert!(!is_in_fiber());
            assert!(current_scheduler().is_none());
            assert!(current_reactor().is_none());
            assert!(!coop_io_enabled());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_thread_id_stable_and_distinct() {
        let a = thread_id();
        assert_eq!(a, thread_id());
        let b = std::thread::spawn(thread_id).join().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_coop_io_flag() {
        std::thread::spawn(|| {
            enable_coop_io(true);
            assert!(coop_io_enabled());
            enable_coop_io(false);
            assert!(!coop_io_enabled());
        })
        .join()
        .unwrap();
    }
}
