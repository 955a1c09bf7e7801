//! # weft - cooperative fiber runtime
//!
//! Lightweight stack-switched tasks ("fibers") multiplexed onto a pool of
//! OS threads, with blocking-style I/O and sleeps transparently converted
//! into non-blocking, event-driven operations.
//!
//! ## Quick Start
//!
//! ```ignore
//! use weft::{IoManager, io};
//!
//! fn main() {
//!     let iom = IoManager::new(2, false, "app");
//!     iom.schedule(|| {
//!         let fd = io::socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
//!         io::connect(fd, &"93.184.216.34:80".parse().unwrap()).unwrap();
//!         io::write(fd, b"GET / HTTP/1.0\r\n\r\n").unwrap();
//!         let mut buf = [0u8; 4096];
//!         let n = io::read(fd, &mut buf).unwrap();
//!         println!("{}", String::from_utf8_lossy(&buf[..n]));
//!         io::close(fd).unwrap();
//!     });
//!     iom.stop();
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     Application code                    │
//! │        io::read / io::connect / sleep / schedule        │
//! └─────────────────────────────────────────────────────────┘
//!                             │
//!                             ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                        IoManager                        │
//! │     epoll set · timer set · self-pipe wake-ups          │
//! └─────────────────────────────────────────────────────────┘
//!                             │
//!           ┌─────────────────┼─────────────────┐
//!           ▼                 ▼                 ▼
//!     ┌───────────┐     ┌───────────┐     ┌───────────┐
//!     │  Worker   │     │  Worker   │     │  Worker   │
//!     │  thread   │     │  thread   │     │  thread   │
//!     └───────────┘     └───────────┘     └───────────┘
//!           │                 │                 │
//!           └────────── fibers (1 MiB mmap stacks) ─────────
//! ```

// Core support
pub use weft_core::error::{EngineError, EngineResult, SysError};
pub use weft_core::log::{self as log, LogLevel};
pub use weft_core::{wdebug, werror, winfo, wtrace, wwarn};

// The engine
pub use weft_runtime::{
    now_ms, Fiber, FiberState, IoEvent, IoManager, RuntimeConfig, Scheduler, Timer, TimerManager,
};

// Blocking-style I/O, namespaced the way callers read best: `io::read(..)`
pub use weft_io as io;
pub use weft_io::{sleep, sleep_ms, sleep_us, IoError, IoResult};

/// Fiber currently executing on this thread, if any
#[inline]
pub fn current_fiber() -> Option<std::sync::Arc<Fiber>> {
    Fiber::current()
}

/// Yield the current fiber back to its scheduler, keeping it runnable.
#[inline]
pub fn yield_now() {
    if Fiber::current().is_some() {
        Fiber::yield_to_ready();
    } else {
        std::thread::yield_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{mpsc, Arc};
    use std::time::{Duration, Instant};

    #[test]
    fn test_facade_round_trip() {
        let iom = IoManager::new(2, false, "smoke");
        let hits = Arc::new(AtomicU32::new(0));

        for _ in 0..4 {
            let h = hits.clone();
            iom.schedule(move || {
                sleep_ms(50);
                yield_now();
                h.fetch_add(1, Ordering::SeqCst);
            });
        }

        let deadline = Instant::now() + Duration::from_secs(3);
        while hits.load(Ordering::SeqCst) < 4 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 4);
        iom.stop();
    }

    #[test]
    fn test_echo_pair_through_facade() {
        let iom = IoManager::new(2, false, "pair");
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) },
            0
        );
        let (a, b) = (fds[0], fds[1]);

        let (tx, rx) = mpsc::channel();
        iom.schedule(move || {
            io::FdRegistry::instance().get(a, true);
            let mut buf = [0u8; 4];
            let n = io::read(a, &mut buf).unwrap();
            io::write(a, &buf[..n]).unwrap();
        });
        iom.schedule(move || {
            io::FdRegistry::instance().get(b, true);
            io::write(b, b"ping").unwrap();
            let mut buf = [0u8; 4];
            let mut got = 0;
            while got < 4 {
                got += io::read(b, &mut buf[got..]).unwrap();
            }
            tx.send(buf.to_vec()).unwrap();
        });

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), b"ping");
        iom.stop();
        io::FdRegistry::instance().del(a);
        io::FdRegistry::instance().del(b);
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }
}
