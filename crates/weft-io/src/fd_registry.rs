//! Process-wide fd bookkeeping
//!
//! One record per managed file descriptor: whether it is a socket (probed
//! once with fstat), whether the kernel-side O_NONBLOCK flag is ours or the
//! user's, and the configured send/recv timeouts. Sockets are forced
//! kernel-non-blocking on first sight - the cooperative wrappers depend on
//! every real syscall returning EAGAIN instead of blocking the worker.
//!
//! Records are created lazily on first lookup (or eagerly by `socket()` /
//! `accept()`) and dropped on `close()`.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use weft_core::constants::NO_TIMEOUT;

/// Which configured timeout applies to an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Receive-side (SO_RCVTIMEO)
    Recv,
    /// Send-side (SO_SNDTIMEO)
    Send,
}

/// Per-fd state consulted by the cooperative wrappers
pub struct FdRecord {
    fd: RawFd,
    initialized: AtomicBool,
    is_socket: AtomicBool,
    closed: AtomicBool,
    /// O_NONBLOCK is set on the real fd because the runtime needs it
    sys_nonblock: AtomicBool,
    /// The caller asked for non-blocking behavior themselves
    user_nonblock: AtomicBool,
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdRecord {
    fn new(fd: RawFd) -> Arc<FdRecord> {
        let record = Arc::new(FdRecord {
            fd,
            initialized: AtomicBool::new(false),
            is_socket: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            sys_nonblock: AtomicBool::new(false),
            user_nonblock: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(NO_TIMEOUT),
            send_timeout_ms: AtomicU64::new(NO_TIMEOUT),
        });
        record.probe();
        record
    }

    /// fstat the fd once; force sockets kernel-non-blocking.
    fn probe(&self) {
        if self.initialized.load(Ordering::Acquire) {
            return;
        }
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(self.fd, &mut st) } == -1 {
            self.is_socket.store(false, Ordering::Release);
        } else {
            self.initialized.store(true, Ordering::Release);
            let is_sock = st.st_mode & libc::S_IFMT == libc::S_IFSOCK;
            self.is_socket.store(is_sock, Ordering::Release);
        }

        if self.is_socket.load(Ordering::Acquire) {
            let flags = unsafe { libc::fcntl(self.fd, libc::F_GETFL, 0) };
            if flags & libc::O_NONBLOCK == 0 {
                unsafe { libc::fcntl(self.fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
            }
            self.sys_nonblock.store(true, Ordering::Release);
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn is_socket(&self) -> bool {
        self.is_socket.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    #[inline]
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Acquire)
    }

    #[inline]
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire)
    }

    pub fn set_user_nonblock(&self, on: bool) {
        self.user_nonblock.store(on, Ordering::Release);
    }

    /// Configured timeout in ms; `NO_TIMEOUT` when unset
    pub fn timeout(&self, kind: TimeoutKind) -> u64 {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.load(Ordering::Acquire),
            TimeoutKind::Send => self.send_timeout_ms.load(Ordering::Acquire),
        }
    }

    pub fn set_timeout(&self, kind: TimeoutKind, ms: u64) {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.store(ms, Ordering::Release),
            TimeoutKind::Send => self.send_timeout_ms.store(ms, Ordering::Release),
        }
    }
}

/// Process-global fd -> record table
pub struct FdRegistry {
    records: RwLock<Vec<Option<Arc<FdRecord>>>>,
}

impl FdRegistry {
    /// The process-wide registry
    pub fn instance() -> &'static FdRegistry {
        static INSTANCE: OnceLock<FdRegistry> = OnceLock::new();
        INSTANCE.get_or_init(|| FdRegistry { records: RwLock::new(vec![None; 64]) })
    }

    /// Look up the record for `fd`, creating it when `auto_create`.
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdRecord>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;
        {
            let v = self.records.read().unwrap();
            if idx < v.len() {
                if let Some(record) = &v[idx] {
                    return Some(record.clone());
                }
            }
            if !auto_create {
                return None;
            }
        }

        let mut v = self.records.write().unwrap();
        if idx >= v.len() {
            v.resize(idx + 1, None);
        }
        // lost the write race: someone else created it first
        if let Some(record) = &v[idx] {
            return Some(record.clone());
        }
        let record = FdRecord::new(fd);
        v[idx] = Some(record.clone());
        Some(record)
    }

    /// Drop the record for `fd` (the fd is being closed).
    pub fn del(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let mut v = self.records.write().unwrap();
        if (fd as usize) < v.len() {
            v[fd as usize] = None;
        }
    }
}
