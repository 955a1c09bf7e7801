//! Deadline-ordered timers
//!
//! Timers live in a set keyed by (absolute deadline in ms, insertion
//! sequence), so ties on deadline resolve in insertion order and no two
//! distinct timers ever compare equal. Cancellation removes the entry and
//! nulls the callback, making a racing trigger a no-op.
//!
//! A conditional timer carries a weak witness; the callback only runs if the
//! witness still upgrades at fire time. This is the "cancel on free" idiom
//! the I/O timeout path relies on.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

/// Shared timer callback (recurring timers fire it repeatedly)
pub type TimerFn = Arc<dyn Fn() + Send + Sync + 'static>;

/// Sentinel for "no deadline pending"
pub const NO_DEADLINE: u64 = u64::MAX;

/// A monotonic reading jumping backwards by at least this much is treated as
/// a clock rollover and drains every pending timer once.
const ROLLOVER_WINDOW_MS: u64 = 60 * 60 * 1000;

/// Monotonic milliseconds (CLOCK_MONOTONIC)
pub fn now_ms() -> u64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1000 + ts.tv_nsec as u64 / 1_000_000
}

struct TimerSet {
    map: BTreeMap<(u64, u64), Arc<Timer>>,
    /// Last monotonic reading observed by a drain, for rollover detection
    previous_ms: u64,
}

struct TimerShared {
    set: RwLock<TimerSet>,
    seq: AtomicU64,
    /// Suppresses duplicate front-insertion wakeups until the next delay query
    tickled: AtomicBool,
    /// Invoked (outside the set lock) when an insert becomes the new front
    front_waker: RwLock<Option<Box<dyn Fn() + Send + Sync>>>,
}

/// One pending timer. Obtained from [`TimerManager::add_timer`]; cancel,
/// refresh and reset go through this handle.
pub struct Timer {
    deadline_ms: AtomicU64,
    period_ms: AtomicU64,
    recurring: bool,
    seq: u64,
    cb: Mutex<Option<TimerFn>>,
    shared: Weak<TimerShared>,
}

impl Timer {
    #[inline]
    fn key(&self) -> (u64, u64) {
        (self.deadline_ms.load(Ordering::Relaxed), self.seq)
    }

    /// Absolute deadline in monotonic ms
    #[inline]
    pub fn deadline_ms(&self) -> u64 {
        self.deadline_ms.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn recurring(&self) -> bool {
        self.recurring
    }

    /// Remove the timer. After this returns the callback will not fire.
    pub fn cancel(&self) -> bool {
        let Some(shared) = self.shared.upgrade() else { return false };
        let mut set = shared.set.write().unwrap();
        let mut cb = self.cb.lock().unwrap();
        if cb.is_none() {
            return false;
        }
        *cb = None;
        set.map.remove(&self.key());
        true
    }

    /// Push the deadline out to now + period. Only legal while still pending.
    pub fn refresh(self: &Arc<Self>) -> bool {
        let Some(shared) = self.shared.upgrade() else { return false };
        let mut set = shared.set.write().unwrap();
        if self.cb.lock().unwrap().is_none() {
            return false;
        }
        if set.map.remove(&self.key()).is_none() {
            return false;
        }
        self.deadline_ms
            .store(now_ms() + self.period_ms.load(Ordering::Relaxed), Ordering::Relaxed);
        set.map.insert(self.key(), self.clone());
        true
    }

    /// Change the period. The new deadline is `now + ms` when `from_now`,
    /// otherwise the original start plus the new period.
    pub fn reset(self: &Arc<Self>, ms: u64, from_now: bool) -> bool {
        if ms == self.period_ms.load(Ordering::Relaxed) && !from_now {
            return true;
        }
        let Some(shared) = self.shared.upgrade() else { return false };
        let at_front;
        {
            let mut set = shared.set.write().unwrap();
            if self.cb.lock().unwrap().is_none() {
                return false;
            }
            if set.map.remove(&self.key()).is_none() {
                return false;
            }
            let old_deadline = self.deadline_ms.load(Ordering::Relaxed);
            let old_period = self.period_ms.load(Ordering::Relaxed);
            let start = if from_now { now_ms() } else { old_deadline.saturating_sub(old_period) };
            self.period_ms.store(ms, Ordering::Relaxed);
            self.deadline_ms.store(start + ms, Ordering::Relaxed);
            set.map.insert(self.key(), self.clone());
            at_front = set.map.keys().next() == Some(&self.key());
        }
        if at_front {
            shared.note_front();
        }
        true
    }
}

impl TimerShared {
    /// Fire the front waker once per delay query, outside the set lock.
    fn note_front(&self) {
        if self.tickled.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(waker) = self.front_waker.read().unwrap().as_ref() {
            waker();
        }
    }
}

/// The deadline-ordered timer set
pub struct TimerManager {
    shared: Arc<TimerShared>,
}

impl TimerManager {
    pub fn new() -> Self {
        TimerManager {
            shared: Arc::new(TimerShared {
                set: RwLock::new(TimerSet { map: BTreeMap::new(), previous_ms: now_ms() }),
                seq: AtomicU64::new(0),
                tickled: AtomicBool::new(false),
                front_waker: RwLock::new(None),
            }),
        }
    }

    /// Install the callback invoked when an insert becomes the new front.
    /// The reactor uses this to cut a long epoll wait short.
    pub fn set_front_waker<F>(&self, waker: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.shared.front_waker.write().unwrap() = Some(Box::new(waker));
    }

    /// Insert a timer firing `delay_ms` from now; recurring timers re-arm
    /// themselves on every drain.
    pub fn add_timer(&self, delay_ms: u64, cb: TimerFn, recurring: bool) -> Arc<Timer> {
        let timer = Arc::new(Timer {
            deadline_ms: AtomicU64::new(now_ms() + delay_ms),
            period_ms: AtomicU64::new(delay_ms),
            recurring,
            seq: self.shared.seq.fetch_add(1, Ordering::Relaxed),
            cb: Mutex::new(Some(cb)),
            shared: Arc::downgrade(&self.shared),
        });
        let at_front;
        {
            let mut set = self.shared.set.write().unwrap();
            set.map.insert(timer.key(), timer.clone());
            at_front = set.map.keys().next() == Some(&timer.key());
        }
        if at_front {
            self.shared.note_front();
        }
        timer
    }

    /// Like [`add_timer`](Self::add_timer), but the callback only runs if
    /// `witness` still upgrades at fire time.
    pub fn add_conditional_timer(
        &self,
        delay_ms: u64,
        cb: TimerFn,
        witness: Weak<dyn Any + Send + Sync>,
        recurring: bool,
    ) -> Arc<Timer> {
        let guarded: TimerFn = Arc::new(move || {
            if witness.upgrade().is_some() {
                cb();
            }
        });
        self.add_timer(delay_ms, guarded, recurring)
    }

    /// Milliseconds until the next deadline; [`NO_DEADLINE`] when the set is
    /// empty; 0 for a past-due timer.
    pub fn next_timer_delay(&self) -> u64 {
        self.shared.tickled.store(false, Ordering::SeqCst);
        let set = self.shared.set.read().unwrap();
        match set.map.keys().next() {
            None => NO_DEADLINE,
            Some(&(deadline, _)) => deadline.saturating_sub(now_ms()),
        }
    }

    /// Whether any timer is pending
    pub fn has_timer(&self) -> bool {
        !self.shared.set.read().unwrap().map.is_empty()
    }

    /// Append every expired callback to `out`, re-arming recurring timers at
    /// deadline + period.
    pub fn collect_expired(&self, out: &mut Vec<TimerFn>) {
        self.collect_expired_at(now_ms(), out)
    }

    fn collect_expired_at(&self, now: u64, out: &mut Vec<TimerFn>) {
        // The previous reading is stored on every drain, even with nothing
        // pending, so rollover detection always compares adjacent calls.
        let mut set = self.shared.set.write().unwrap();
        let rollover = now < set.previous_ms && set.previous_ms - now >= ROLLOVER_WINDOW_MS;
        set.previous_ms = now;
        if set.map.is_empty() {
            return;
        }

        let mut recurred = Vec::new();
        loop {
            let Some((&key, _)) = set.map.iter().next() else { break };
            if !rollover && key.0 > now {
                break;
            }
            let timer = set.map.remove(&key).unwrap();
            let mut cb = timer.cb.lock().unwrap();
            let Some(f) = cb.as_ref() else { continue }; // lost a cancel race
            out.push(f.clone());
            if timer.recurring {
                timer.deadline_ms.store(
                    key.0 + timer.period_ms.load(Ordering::Relaxed),
                    Ordering::Relaxed,
                );
                drop(cb);
                recurred.push(timer);
            } else {
                *cb = None;
            }
        }
        for timer in recurred {
            let key = timer.key();
            set.map.insert(key, timer);
        }
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}
