//! Fiber scheduler
//!
//! A pool of worker threads draining one FIFO queue of tasks. A task is
//! either a fiber handle or a bare callback (lazily wrapped in a reusable
//! per-worker fiber), optionally pinned to a specific OS thread.
//!
//! With `use_caller` the constructing thread is one of the workers: it gets a
//! dedicated root fiber wrapping the dispatch loop, entered one final time
//! from `stop()` so the caller drains the queue before returning to its own
//! call site.
//!
//! The scheduler itself knows nothing about I/O. A wrapping runtime installs
//! `SchedulerHooks` to supply the idle behavior (an event loop), the wake-up
//! signal, and extra stop conditions.

use crate::fiber::{Fiber, FiberState};
use crate::tls;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::thread::JoinHandle;
use weft_core::{wdebug, winfo};

pub use crate::fiber::TaskFn;

/// Extension points for a wrapping runtime (the reactor installs these).
pub trait SchedulerHooks: Send + Sync {
    /// Wake one idle worker.
    fn tickle(&self);

    /// Body of the idle fiber. Must yield HOLD whenever there is nothing to
    /// do, and return only when the scheduler should shut down.
    fn run_idle(&self);

    /// Extra conditions AND-ed into the stop predicate.
    fn extra_stopping(&self) -> bool {
        true
    }

    /// Called once per worker thread as it enters the dispatch loop.
    fn on_thread_start(&self) {}
}

enum TaskKind {
    Fiber(Arc<Fiber>),
    Call(TaskFn),
}

struct Task {
    kind: TaskKind,
    /// OS thread id the task is pinned to; None = any worker
    target: Option<u64>,
}

/// Worker thread pool plus FIFO task queue
pub struct Scheduler {
    name: String,
    queue: Mutex<VecDeque<Task>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    thread_ids: Mutex<Vec<u64>>,
    ids_ready: Condvar,
    /// Worker threads to spawn (excludes the caller when it participates)
    thread_count: usize,
    active_count: AtomicUsize,
    idle_count: AtomicUsize,
    /// True until start(); set again by stop()
    stopping: AtomicBool,
    auto_stop: AtomicBool,
    use_caller: bool,
    root_thread: Option<u64>,
    root_fiber: Mutex<Option<Arc<Fiber>>>,
    hooks: RwLock<Option<Weak<dyn SchedulerHooks>>>,
    self_weak: Weak<Scheduler>,
}

impl Scheduler {
    /// Create a scheduler with `threads` workers.
    ///
    /// With `use_caller` the constructing thread counts as one of them and
    /// `stop()` must later be called from this same thread.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<Scheduler> {
        assert!(threads > 0, "scheduler needs at least one thread");

        let sched = Arc::new_cyclic(|weak: &Weak<Scheduler>| {
            let (thread_count, root_thread) = if use_caller {
                assert!(
                    tls::current_scheduler().is_none(),
                    "constructing a caller-participating scheduler inside another scheduler"
                );
                tls::set_scheduler(weak.clone());
                (threads - 1, Some(tls::thread_id()))
            } else {
                (threads, None)
            };

            Scheduler {
                name: name.to_string(),
                queue: Mutex::new(VecDeque::new()),
                handles: Mutex::new(Vec::new()),
                thread_ids: Mutex::new(root_thread.into_iter().collect()),
                ids_ready: Condvar::new(),
                thread_count,
                active_count: AtomicUsize::new(0),
                idle_count: AtomicUsize::new(0),
                stopping: AtomicBool::new(true),
                auto_stop: AtomicBool::new(false),
                use_caller,
                root_thread,
                root_fiber: Mutex::new(None),
                hooks: RwLock::new(None),
                self_weak: weak.clone(),
            }
        });

        if use_caller {
            let weak = sched.self_weak.clone();
            let root = Fiber::new(move || {
                if let Some(s) = weak.upgrade() {
                    s.run();
                }
            })
            .expect("root fiber allocation failed");
            *sched.root_fiber.lock().unwrap() = Some(root);
        }

        sched
    }

    /// Install the wrapping runtime's hooks. Call before `start()`.
    pub fn install_hooks(&self, hooks: Weak<dyn SchedulerHooks>) {
        *self.hooks.write().unwrap() = Some(hooks);
    }

    fn hooks(&self) -> Option<Arc<dyn SchedulerHooks>> {
        self.hooks.read().unwrap().as_ref().and_then(|w| w.upgrade())
    }

    /// Scheduler driving the calling thread, if any
    pub fn current() -> Option<Arc<Scheduler>> {
        tls::current_scheduler()
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// OS thread ids of all workers (including a participating caller)
    pub fn thread_ids(&self) -> Vec<u64> {
        self.thread_ids.lock().unwrap().clone()
    }

    #[inline]
    pub fn idle_threads(&self) -> usize {
        self.idle_count.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn active_threads(&self) -> usize {
        self.active_count.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn has_idle_threads(&self) -> bool {
        self.idle_threads() > 0
    }

    /// Spawn the worker threads. Returns once every worker has registered.
    pub fn start(&self) {
        {
            let handles = self.handles.lock().unwrap();
            if !self.stopping.swap(false, Ordering::SeqCst) {
                return; // already running
            }
            assert!(handles.is_empty());
        }
        self.auto_stop.store(false, Ordering::SeqCst);

        let mut handles = self.handles.lock().unwrap();
        for i in 0..self.thread_count {
            let sched = self.self_weak.upgrade().expect("scheduler vanished during start");
            let handle = std::thread::Builder::new()
                .name(format!("{}-{}", self.name, i))
                .spawn(move || sched.run())
                .expect("failed to spawn scheduler worker");
            handles.push(handle);
        }
        drop(handles);

        // Wait until every worker published its thread id, so pinning by id
        // works as soon as start() returns.
        let expected = self.thread_count + usize::from(self.use_caller);
        let mut ids = self.thread_ids.lock().unwrap();
        while ids.len() < expected {
            ids = self.ids_ready.wait(ids).unwrap();
        }
    }

    /// Enqueue a callback on any worker.
    pub fn schedule<F>(&self, cb: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.push_task(Task { kind: TaskKind::Call(Box::new(cb)), target: None });
    }

    /// Enqueue a callback pinned to the worker with the given OS thread id.
    pub fn schedule_to<F>(&self, cb: F, thread: u64)
    where
        F: FnOnce() + Send + 'static,
    {
        self.push_task(Task { kind: TaskKind::Call(Box::new(cb)), target: Some(thread) });
    }

    /// Enqueue a fiber, optionally pinned to an OS thread id.
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>, thread: Option<u64>) {
        self.push_task(Task { kind: TaskKind::Fiber(fiber), target: thread });
    }

    /// Enqueue a batch of callbacks: one lock acquisition, one tickle.
    pub fn schedule_batch(&self, cbs: Vec<TaskFn>) {
        if cbs.is_empty() {
            return;
        }
        let need_tickle = {
            let mut q = self.queue.lock().unwrap();
            let was_empty = q.is_empty();
            q.extend(cbs.into_iter().map(|cb| Task { kind: TaskKind::Call(cb), target: None }));
            was_empty
        };
        if need_tickle {
            self.tickle();
        }
    }

    fn push_task(&self, task: Task) {
        let need_tickle = {
            let mut q = self.queue.lock().unwrap();
            let was_empty = q.is_empty();
            q.push_back(task);
            was_empty
        };
        if need_tickle {
            self.tickle();
        }
    }

    fn tickle(&self) {
        match self.hooks() {
            Some(h) => h.tickle(),
            None => wdebug!("{}: tickle", self.name),
        }
    }

    /// The stop predicate: auto-stop requested, queue drained, no worker
    /// mid-task, and whatever extra conditions the hooks add.
    pub fn stopping(&self) -> bool {
        let extra = match self.hooks() {
            Some(h) => h.extra_stopping(),
            None => true,
        };
        self.base_stopping() && extra
    }

    pub(crate) fn base_stopping(&self) -> bool {
        self.auto_stop.load(Ordering::SeqCst)
            && self.stopping.load(Ordering::SeqCst)
            && self.queue.lock().unwrap().is_empty()
            && self.active_count.load(Ordering::SeqCst) == 0
    }

    /// Shut down: drain the queue, then join every worker.
    ///
    /// For a caller-participating scheduler this must run on the thread that
    /// constructed it; the caller's root fiber drains alongside the workers.
    pub fn stop(&self) {
        self.auto_stop.store(true, Ordering::SeqCst);

        // Caller-only scheduler that never ran anything
        {
            let root = self.root_fiber.lock().unwrap();
            if let Some(root) = root.as_ref() {
                if self.thread_count == 0
                    && matches!(root.state(), FiberState::Init | FiberState::Term)
                {
                    winfo!("{}: stopped", self.name);
                    self.stopping.store(true, Ordering::SeqCst);
                    if self.stopping() {
                        return;
                    }
                }
            }
        }

        let on_own_worker = Self::current()
            .zip(self.self_weak.upgrade())
            .map_or(false, |(a, b)| Arc::ptr_eq(&a, &b));
        if self.use_caller {
            assert!(
                on_own_worker && Some(tls::thread_id()) == self.root_thread,
                "{}: stop() must run on the thread that constructed this scheduler",
                self.name
            );
        } else {
            // joining a worker into itself deadlocks
            assert!(
                !on_own_worker,
                "{}: stop() called from one of this scheduler's own workers",
                self.name
            );
        }

        self.stopping.store(true, Ordering::SeqCst);
        for _ in 0..self.thread_count {
            self.tickle();
        }
        if self.use_caller {
            self.tickle();
        }

        if self.use_caller && !self.stopping() {
            let root = self.root_fiber.lock().unwrap().clone();
            if let Some(root) = root {
                root.resume();
            }
        }

        let handles: Vec<_> = self.handles.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// The dispatch loop. Runs on every worker thread, and inside the root
    /// fiber on a participating caller.
    fn run(self: &Arc<Self>) {
        tls::set_scheduler(Arc::downgrade(self));
        tls::enable_coop_io(true);
        let my_tid = tls::thread_id();
        {
            let mut ids = self.thread_ids.lock().unwrap();
            if !ids.contains(&my_tid) {
                ids.push(my_tid);
                self.ids_ready.notify_all();
            }
        }
        if let Some(h) = self.hooks() {
            h.on_thread_start();
        }
        wdebug!("{}: dispatch loop on thread {}", self.name, my_tid);

        let idle_fiber = {
            let sched = self.clone();
            Fiber::new(move || sched.idle_body()).expect("idle fiber allocation failed")
        };
        let mut cb_fiber: Option<Arc<Fiber>> = None;

        loop {
            let mut task: Option<Task> = None;
            let mut tickle_me = false;
            {
                let mut q = self.queue.lock().unwrap();
                let mut idx = 0;
                while idx < q.len() {
                    let t = &q[idx];
                    // Pinned to another thread: leave it, nudge the right one.
                    if t.target.is_some() && t.target != Some(my_tid) {
                        tickle_me = true;
                        idx += 1;
                        continue;
                    }
                    // A fiber another worker is still switching out of
                    // stays queued until its context store lands.
                    if let TaskKind::Fiber(f) = &t.kind {
                        if f.state() == FiberState::Exec || f.is_busy() {
                            idx += 1;
                            continue;
                        }
                    }
                    task = q.remove(idx);
                    self.active_count.fetch_add(1, Ordering::SeqCst);
                    break;
                }
                tickle_me = tickle_me || !q.is_empty();
            }
            if tickle_me {
                self.tickle();
            }

            match task {
                Some(Task { kind: TaskKind::Fiber(fiber), .. }) => {
                    // Picked, but finished in the meantime: drop it.
                    if fiber.state().is_finished() {
                        self.active_count.fetch_sub(1, Ordering::SeqCst);
                        continue;
                    }
                    fiber.resume();
                    self.active_count.fetch_sub(1, Ordering::SeqCst);
                    match fiber.state() {
                        FiberState::Ready => self.schedule_fiber(fiber, None),
                        FiberState::Term | FiberState::Except => {}
                        _ => fiber.set_state(FiberState::Hold),
                    }
                }
                Some(Task { kind: TaskKind::Call(cb), .. }) => {
                    let fiber = match cb_fiber.take() {
                        Some(f) => {
                            f.reset(cb);
                            f
                        }
                        None => Fiber::new(cb).expect("callback fiber allocation failed"),
                    };
                    fiber.resume();
                    self.active_count.fetch_sub(1, Ordering::SeqCst);
                    match fiber.state() {
                        FiberState::Ready => self.schedule_fiber(fiber, None),
                        FiberState::Term | FiberState::Except => cb_fiber = Some(fiber),
                        _ => fiber.set_state(FiberState::Hold),
                    }
                }
                None => {
                    if idle_fiber.state() == FiberState::Term {
                        wdebug!("{}: worker {} exiting", self.name, my_tid);
                        break;
                    }
                    self.idle_count.fetch_add(1, Ordering::SeqCst);
                    idle_fiber.resume();
                    self.idle_count.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }
    }

    fn idle_body(&self) {
        match self.hooks() {
            Some(h) => h.run_idle(),
            None => {
                while !self.stopping() {
                    Fiber::yield_to_hold();
                }
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        debug_assert!(
            self.stopping.load(Ordering::SeqCst),
            "{}: dropped while running",
            self.name
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[test]
    fn test_schedule_before_start_runs_all() {
        let sched = Scheduler::new(2, false, "t-prestart");
        let hits = Arc::new(AtomicU32::new(0));
        for _ in 0..10 {
            let h = hits.clone();
            sched.schedule(move || {
                h.fetch_add(1, Ordering::SeqCst);
            });
        }
        sched.start();
        sched.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 10);
        assert!(sched.queue.lock().unwrap().is_empty());
        assert!(sched.handles.lock().unwrap().is_empty());
    }

    #[test]
    fn test_schedule_after_start() {
        let sched = Scheduler::new(2, false, "t-live");
        sched.start();
        let hits = Arc::new(AtomicU32::new(0));
        for _ in 0..100 {
            let h = hits.clone();
            sched.schedule(move || {
                h.fetch_add(1, Ordering::SeqCst);
            });
        }
        sched.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_use_caller_drains_in_stop() {
        let sched = Scheduler::new(1, true, "t-caller");
        let hits = Arc::new(AtomicU32::new(0));
        sched.start();
        for _ in 0..5 {
            let h = hits.clone();
            sched.schedule(move || {
                h.fetch_add(1, Ordering::SeqCst);
            });
        }
        // thread_count is 0; everything runs on this thread inside stop()
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        sched.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_fiber_yield_ready_requeued() {
        let sched = Scheduler::new(1, false, "t-ready");
        sched.start();
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        let fiber = Fiber::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
            Fiber::yield_to_ready();
            h.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        sched.schedule_fiber(fiber, None);
        sched.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_thread_pinning() {
        let sched = Scheduler::new(2, false, "t-pin");
        sched.start();
        let ids = sched.thread_ids();
        assert_eq!(ids.len(), 2);
        let target = ids[1];

        let observed = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..20 {
            let o = observed.clone();
            sched.schedule_to(
                move || {
                    o.lock().unwrap().push(tls::thread_id());
                },
                target,
            );
        }
        sched.stop();

        let observed = observed.lock().unwrap();
        assert_eq!(observed.len(), 20);
        assert!(observed.iter().all(|&tid| tid == target));
    }

    #[test]
    fn test_scheduler_current_inside_worker() {
        let sched = Scheduler::new(1, false, "t-current");
        sched.start();
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        sched.schedule(move || {
            *s.lock().unwrap() = Scheduler::current().map(|c| c.name().to_string());
        });
        sched.stop();
        assert_eq!(seen.lock().unwrap().as_deref(), Some("t-current"));
        assert!(Scheduler::current().is_none());
    }

    #[test]
    fn test_stop_waits_for_running_task() {
        let sched = Scheduler::new(2, false, "t-drain");
        sched.start();
        let done = Arc::new(AtomicBool::new(false));
        let d = done.clone();
        sched.schedule(move || {
            std::thread::sleep(Duration::from_millis(150));
            d.store(true, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(20));
        sched.stop();
        // stop() returns only after the queue is empty and workers joined
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn test_panicking_task_does_not_kill_worker() {
        weft_core::log::set_level(weft_core::log::LogLevel::Off);
        let sched = Scheduler::new(1, false, "t-panic");
        sched.start();
        sched.schedule(|| panic!("task failure"));
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        sched.schedule(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        sched.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
