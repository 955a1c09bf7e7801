//! The epoll reactor
//!
//! `IoManager` couples a [`Scheduler`] with an epoll instance and a
//! [`TimerManager`]. Its idle routine - installed through
//! [`SchedulerHooks`] - is the event loop: workers with nothing to run block
//! in `epoll_wait`, and fd readiness or an expired timer turns back into a
//! scheduled fiber or callback.
//!
//! A self-pipe registered edge-triggered with the epoll set carries one-byte
//! wake-ups ("tickles") so a newly queued task or a newly front-inserted
//! timer can cut a long wait short.
//!
//! Arming is edge-triggered and one-shot per direction: when an event fires,
//! the remaining armed set is re-registered (MOD) or the fd dropped from the
//! set (DEL), and exactly one waiter per fired direction is handed to the
//! scheduler. EPOLLERR/EPOLLHUP count as both directions, masked by what is
//! armed, which is how half-closed peers wake their readers.

use crate::fiber::{Fiber, FiberState};
use crate::scheduler::{Scheduler, SchedulerHooks, TaskFn};
use crate::timer::{Timer, TimerFn, TimerManager, NO_DEADLINE};
use crate::tls;
use std::any::Any;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use weft_core::constants::MAX_EPOLL_TIMEOUT_MS;
use weft_core::error::{EngineError, EngineResult, SysError};
use weft_core::{wdebug, werror, winfo};

/// One I/O direction on an fd
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoEvent {
    /// Readable (EPOLLIN)
    Read = 0x1,
    /// Writable (EPOLLOUT)
    Write = 0x4,
}

/// Bitmask over [`IoEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EventSet(u32);

impl EventSet {
    const NONE: EventSet = EventSet(0);

    #[inline]
    fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    fn contains(self, ev: IoEvent) -> bool {
        self.0 & ev as u32 != 0
    }

    #[inline]
    fn insert(&mut self, ev: IoEvent) {
        self.0 |= ev as u32;
    }

    #[inline]
    fn remove(&mut self, ev: IoEvent) {
        self.0 &= !(ev as u32);
    }

    #[inline]
    fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// What to run when an armed event fires: exactly one of fiber or callback,
/// handed to the owning scheduler.
struct EventWaiter {
    sched: Weak<Scheduler>,
    fiber: Option<Arc<Fiber>>,
    cb: Option<TaskFn>,
}

impl EventWaiter {
    const fn empty() -> Self {
        EventWaiter { sched: Weak::new(), fiber: None, cb: None }
    }

    fn is_vacant(&self) -> bool {
        self.fiber.is_none() && self.cb.is_none()
    }

    fn clear(&mut self) {
        self.sched = Weak::new();
        self.fiber = None;
        self.cb = None;
    }
}

struct FdEventsInner {
    armed: EventSet,
    read: EventWaiter,
    write: EventWaiter,
}

/// Per-fd event record. Slots are allocated once and live as long as the
/// reactor; epoll carries a raw pointer to them in `data.ptr`.
struct FdEvents {
    fd: RawFd,
    inner: Mutex<FdEventsInner>,
}

impl FdEvents {
    fn new(fd: RawFd) -> Self {
        FdEvents {
            fd,
            inner: Mutex::new(FdEventsInner {
                armed: EventSet::NONE,
                read: EventWaiter::empty(),
                write: EventWaiter::empty(),
            }),
        }
    }

    /// Consume the waiter for `ev` and hand it to its scheduler.
    /// Caller holds the record lock and owns the pending-count decrement.
    fn trigger(inner: &mut FdEventsInner, ev: IoEvent) {
        debug_assert!(inner.armed.contains(ev));
        inner.armed.remove(ev);
        let waiter = match ev {
            IoEvent::Read => &mut inner.read,
            IoEvent::Write => &mut inner.write,
        };
        let sched = waiter.sched.upgrade();
        let fiber = waiter.fiber.take();
        let cb = waiter.cb.take();
        waiter.sched = Weak::new();
        match (sched, fiber, cb) {
            (Some(s), _, Some(cb)) => s.schedule_batch(vec![cb]),
            (Some(s), Some(f), None) => s.schedule_fiber(f, None),
            _ => werror!("event fired with no live scheduler; waiter dropped"),
        }
    }
}

/// Scheduler + timer set + epoll event loop
pub struct IoManager {
    sched: Arc<Scheduler>,
    timers: TimerManager,
    epfd: RawFd,
    tickle_fds: [RawFd; 2],
    pending: AtomicUsize,
    contexts: RwLock<Vec<Arc<FdEvents>>>,
    self_weak: Weak<IoManager>,
}

impl IoManager {
    /// Create the reactor and start its scheduler.
    ///
    /// With `use_caller` the constructing thread participates; `stop()` must
    /// then be called from this same thread.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<IoManager> {
        // Size hint is ignored by modern kernels; kept for its original value.
        let epfd = unsafe { libc::epoll_create(5000) };
        assert!(epfd >= 0, "epoll_create failed: {}", SysError::last());

        let mut pipe_fds = [0 as libc::c_int; 2];
        let rt = unsafe { libc::pipe(pipe_fds.as_mut_ptr()) };
        assert_eq!(rt, 0, "pipe failed: {}", SysError::last());
        let rt = unsafe { libc::fcntl(pipe_fds[0], libc::F_SETFL, libc::O_NONBLOCK) };
        assert_eq!(rt, 0, "fcntl(tickle pipe) failed: {}", SysError::last());

        // The tickle pipe rides in the epoll set with a null data pointer.
        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: 0,
        };
        let rt = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, pipe_fds[0], &mut ev) };
        assert_eq!(rt, 0, "epoll_ctl(tickle pipe) failed: {}", SysError::last());

        let sched = Scheduler::new(threads, use_caller, name);

        let iom = Arc::new_cyclic(|weak: &Weak<IoManager>| {
            let timers = TimerManager::new();
            {
                let w = weak.clone();
                timers.set_front_waker(move || {
                    if let Some(m) = w.upgrade() {
                        m.tickle();
                    }
                });
            }
            let hooks: Weak<dyn SchedulerHooks> = weak.clone();
            sched.install_hooks(hooks);

            IoManager {
                sched: sched.clone(),
                timers,
                epfd,
                tickle_fds: [pipe_fds[0], pipe_fds[1]],
                pending: AtomicUsize::new(0),
                contexts: RwLock::new(Vec::new()),
                self_weak: weak.clone(),
            }
        });

        iom.resize_contexts(32);
        if use_caller {
            tls::set_reactor(iom.self_weak.clone());
        }
        iom.sched.start();
        iom
    }

    /// Reactor driving the calling thread, if any
    pub fn current() -> Option<Arc<IoManager>> {
        tls::current_reactor()
    }

    /// The scheduler this reactor drives
    #[inline]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.sched
    }

    /// Number of armed (fd, direction) pairs
    #[inline]
    pub fn pending_event_count(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Enqueue a callback on the scheduler.
    pub fn schedule<F>(&self, cb: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.sched.schedule(cb);
    }

    /// Enqueue a fiber on the scheduler.
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>, thread: Option<u64>) {
        self.sched.schedule_fiber(fiber, thread);
    }

    /// Shut down the scheduler; returns once the reactor is quiescent.
    pub fn stop(&self) {
        self.sched.stop();
    }

    // ── timers ──

    /// One-shot or recurring timer; the callback is scheduled as a task.
    pub fn add_timer<F>(&self, delay_ms: u64, cb: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.timers.add_timer(delay_ms, Arc::new(cb), recurring)
    }

    /// Timer whose callback runs only if `witness` still upgrades at fire
    /// time.
    pub fn add_conditional_timer<F>(
        &self,
        delay_ms: u64,
        cb: F,
        witness: Weak<dyn Any + Send + Sync>,
        recurring: bool,
    ) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.timers.add_conditional_timer(delay_ms, Arc::new(cb), witness, recurring)
    }

    /// Milliseconds until the next timer deadline
    pub fn next_timer_delay(&self) -> u64 {
        self.timers.next_timer_delay()
    }

    // ── events ──

    fn context_for(&self, fd: RawFd) -> Arc<FdEvents> {
        {
            let v = self.contexts.read().unwrap();
            if (fd as usize) < v.len() {
                return v[fd as usize].clone();
            }
        }
        self.resize_contexts((fd as usize) * 3 / 2 + 1);
        let v = self.contexts.read().unwrap();
        v[fd as usize].clone()
    }

    fn resize_contexts(&self, size: usize) {
        let mut v = self.contexts.write().unwrap();
        for fd in v.len()..size {
            v.push(Arc::new(FdEvents::new(fd as RawFd)));
        }
    }

    /// Arm `ev` on `fd`. Without a callback, the current fiber (which must be
    /// executing) is the waiter and will be rescheduled when the event fires.
    ///
    /// Arming a direction twice is a bug and aborts.
    pub fn add_event(&self, fd: RawFd, ev: IoEvent, cb: Option<TaskFn>) -> EngineResult<()> {
        let ctx = self.context_for(fd);
        let mut inner = ctx.inner.lock().unwrap();
        assert!(
            !inner.armed.contains(ev),
            "event {:?} already armed on fd {}",
            ev,
            fd
        );

        let op = if inner.armed.is_empty() { libc::EPOLL_CTL_ADD } else { libc::EPOLL_CTL_MOD };
        let bits = libc::EPOLLET as u32 | inner.armed.bits() | ev as u32;
        let mut epevent = libc::epoll_event { events: bits, u64: Arc::as_ptr(&ctx) as u64 };
        let rt = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut epevent) };
        if rt != 0 {
            let err = SysError::last();
            werror!("epoll_ctl({}, {}, {}, {:#x}) failed: {}", self.epfd, op, fd, bits, err);
            return Err(EngineError::Sys(err));
        }

        self.pending.fetch_add(1, Ordering::SeqCst);
        inner.armed.insert(ev);

        let waiter = match ev {
            IoEvent::Read => &mut inner.read,
            IoEvent::Write => &mut inner.write,
        };
        assert!(waiter.is_vacant());
        waiter.sched = match tls::current_scheduler() {
            Some(s) => Arc::downgrade(&s),
            None => Arc::downgrade(&self.sched),
        };
        match cb {
            Some(cb) => waiter.cb = Some(cb),
            None => {
                let fiber = Fiber::current().expect("add_event without callback outside a fiber");
                assert_eq!(fiber.state(), FiberState::Exec);
                waiter.fiber = Some(fiber);
            }
        }
        Ok(())
    }

    /// Disarm `ev` on `fd`, discarding the waiter without running it.
    pub fn del_event(&self, fd: RawFd, ev: IoEvent) -> bool {
        let Some(ctx) = self.existing_context(fd) else { return false };
        let mut inner = ctx.inner.lock().unwrap();
        if !inner.armed.contains(ev) {
            return false;
        }

        let mut left = inner.armed;
        left.remove(ev);
        if !self.rearm(fd, Arc::as_ptr(&ctx) as u64, left) {
            return false;
        }

        self.pending.fetch_sub(1, Ordering::SeqCst);
        inner.armed = left;
        match ev {
            IoEvent::Read => inner.read.clear(),
            IoEvent::Write => inner.write.clear(),
        }
        true
    }

    /// Disarm `ev` on `fd` and fire its waiter as if the event happened.
    /// This is how a timed-out wait gets unblocked.
    pub fn cancel_event(&self, fd: RawFd, ev: IoEvent) -> bool {
        let Some(ctx) = self.existing_context(fd) else { return false };
        let mut inner = ctx.inner.lock().unwrap();
        if !inner.armed.contains(ev) {
            return false;
        }

        let mut left = inner.armed;
        left.remove(ev);
        if !self.rearm(fd, Arc::as_ptr(&ctx) as u64, left) {
            return false;
        }

        FdEvents::trigger(&mut inner, ev);
        self.pending.fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// Drop `fd` from the epoll set, firing every armed waiter.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let Some(ctx) = self.existing_context(fd) else { return false };
        let mut inner = ctx.inner.lock().unwrap();
        if inner.armed.is_empty() {
            return false;
        }

        let mut epevent = libc::epoll_event { events: 0, u64: Arc::as_ptr(&ctx) as u64 };
        let rt = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut epevent) };
        if rt != 0 {
            werror!("epoll_ctl(DEL, {}) failed: {}", fd, SysError::last());
            return false;
        }

        if inner.armed.contains(IoEvent::Read) {
            FdEvents::trigger(&mut inner, IoEvent::Read);
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        if inner.armed.contains(IoEvent::Write) {
            FdEvents::trigger(&mut inner, IoEvent::Write);
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        debug_assert!(inner.armed.is_empty());
        true
    }

    fn existing_context(&self, fd: RawFd) -> Option<Arc<FdEvents>> {
        if fd < 0 {
            return None;
        }
        let v = self.contexts.read().unwrap();
        v.get(fd as usize).cloned()
    }

    /// Re-register the remaining mask (MOD), or drop the fd (DEL) when none.
    /// `data` is the context pointer epoll carries for this fd.
    fn rearm(&self, fd: RawFd, data: u64, left: EventSet) -> bool {
        let op = if left.is_empty() { libc::EPOLL_CTL_DEL } else { libc::EPOLL_CTL_MOD };
        let bits = libc::EPOLLET as u32 | left.bits();
        let mut epevent = libc::epoll_event { events: bits, u64: data };
        let rt = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut epevent) };
        if rt != 0 {
            werror!("epoll_ctl({}, {}, {}, {:#x}) failed: {}", self.epfd, op, fd, bits, SysError::last());
            return false;
        }
        true
    }

    /// Wake one idle worker out of `epoll_wait`. Skipped when every worker
    /// is busy; the byte would only be drained late.
    fn tickle(&self) {
        if !self.sched.has_idle_threads() {
            return;
        }
        let rt = unsafe { libc::write(self.tickle_fds[1], b"T".as_ptr() as *const libc::c_void, 1) };
        debug_assert_eq!(rt, 1);
    }

    fn stopping_with(&self, next_timeout: u64) -> bool {
        next_timeout == NO_DEADLINE
            && self.pending.load(Ordering::SeqCst) == 0
            && self.sched.base_stopping()
    }

    /// The event loop, run inside each worker's idle fiber.
    fn idle_loop(&self) {
        const MAX_EVENTS: usize = 64;
        let mut events =
            vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        loop {
            let next_timeout = self.timers.next_timer_delay();
            if self.stopping_with(next_timeout) {
                winfo!("{}: idle loop exiting", self.sched.name());
                break;
            }

            let timeout_ms = next_timeout.min(MAX_EPOLL_TIMEOUT_MS) as libc::c_int;
            let n = loop {
                let rt = unsafe {
                    libc::epoll_wait(self.epfd, events.as_mut_ptr(), MAX_EVENTS as libc::c_int, timeout_ms)
                };
                if rt < 0 && SysError::last().errno() == libc::EINTR {
                    continue;
                }
                break rt.max(0) as usize;
            };

            // Expired timers first: their callbacks land in the queue ahead
            // of anything scheduled later in this pass.
            let mut cbs: Vec<TimerFn> = Vec::new();
            self.timers.collect_expired(&mut cbs);
            if !cbs.is_empty() {
                let tasks = cbs
                    .into_iter()
                    .map(|cb| Box::new(move || cb()) as TaskFn)
                    .collect();
                self.sched.schedule_batch(tasks);
            }

            for slot in events.iter().take(n) {
                let fired = *slot;
                if fired.u64 == 0 {
                    // Tickle pipe: drain every pending byte.
                    let mut buf = [0u8; 256];
                    loop {
                        let rt = unsafe {
                            libc::read(self.tickle_fds[0], buf.as_mut_ptr() as *mut libc::c_void, buf.len())
                        };
                        if rt <= 0 {
                            break;
                        }
                    }
                    continue;
                }

                let ctx = unsafe { &*(fired.u64 as *const FdEvents) };
                let mut inner = ctx.inner.lock().unwrap();

                let mut observed = fired.events;
                if observed & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                    // Errors and hangups count as both directions, limited to
                    // what is actually armed.
                    observed |= (libc::EPOLLIN | libc::EPOLLOUT) as u32 & inner.armed.bits();
                }

                let mut real = EventSet::NONE;
                if observed & libc::EPOLLIN as u32 != 0 {
                    real.insert(IoEvent::Read);
                }
                if observed & libc::EPOLLOUT as u32 != 0 {
                    real.insert(IoEvent::Write);
                }
                if inner.armed.bits() & real.bits() == 0 {
                    continue;
                }

                let left = EventSet(inner.armed.bits() & !real.bits());
                if !self.rearm(ctx.fd, fired.u64, left) {
                    continue;
                }

                if real.contains(IoEvent::Read) && inner.armed.contains(IoEvent::Read) {
                    FdEvents::trigger(&mut inner, IoEvent::Read);
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                }
                if real.contains(IoEvent::Write) && inner.armed.contains(IoEvent::Write) {
                    FdEvents::trigger(&mut inner, IoEvent::Write);
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                }
            }

            // Hand control back to the dispatch loop so freshly queued tasks
            // run; it resumes us when the queue is empty again.
            Fiber::yield_to_hold();
        }
    }
}

impl SchedulerHooks for IoManager {
    fn tickle(&self) {
        IoManager::tickle(self)
    }

    fn run_idle(&self) {
        self.idle_loop()
    }

    fn extra_stopping(&self) -> bool {
        self.pending.load(Ordering::SeqCst) == 0 && !self.timers.has_timer()
    }

    fn on_thread_start(&self) {
        tls::set_reactor(self.self_weak.clone());
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        self.sched.stop();
        unsafe {
            libc::close(self.epfd);
            libc::close(self.tickle_fds[0]);
            libc::close(self.tickle_fds[1]);
        }
        wdebug!("{}: reactor dropped", self.sched.name());
    }
}
