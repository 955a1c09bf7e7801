//! Cooperative sleeping
//!
//! Inside a fiber on a reactor thread, sleeping installs a one-shot timer
//! that reschedules the fiber and yields; the worker thread keeps running
//! other fibers in the meantime. Anywhere else it is a plain thread sleep.

use std::time::Duration;
use weft_runtime::{tls, Fiber, IoManager};

/// Sleep for `dur` without blocking the worker thread.
pub fn sleep(dur: Duration) {
    let iom = if tls::coop_io_enabled() { IoManager::current() } else { None };
    let (Some(iom), Some(fiber)) = (iom, Fiber::current()) else {
        std::thread::sleep(dur);
        return;
    };

    let sched = iom.scheduler().clone();
    iom.add_timer(
        dur.as_millis() as u64,
        move || {
            sched.schedule_fiber(fiber.clone(), None);
        },
        false,
    );
    Fiber::yield_to_hold();
}

/// Sleep for `ms` milliseconds.
#[inline]
pub fn sleep_ms(ms: u64) {
    sleep(Duration::from_millis(ms))
}

/// Sleep for `us` microseconds (millisecond resolution on the reactor).
#[inline]
pub fn sleep_us(us: u64) {
    sleep(Duration::from_micros(us))
}
