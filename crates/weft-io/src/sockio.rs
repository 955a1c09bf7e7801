//! Blocking-style socket I/O over the reactor
//!
//! Every wrapper follows the same contract: off a reactor thread, or for an
//! fd that is not a managed socket, or one the caller made non-blocking
//! themselves, it is a plain syscall. Otherwise the real call is issued
//! non-blocking; EINTR retries inline, and EAGAIN arms the fd on the
//! reactor, optionally starts a timeout timer, and parks the fiber. The
//! timer and the readiness event race through a shared cancellation flag:
//! whichever fires first decides between a retry and ETIMEDOUT.

use crate::error::{IoError, IoResult};
use crate::fd_registry::{FdRecord, FdRegistry, TimeoutKind};
use std::any::Any;
use std::io::{IoSlice, IoSliceMut};
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use weft_core::constants::{DEFAULT_CONNECT_TIMEOUT_MS, NO_TIMEOUT};
use weft_core::env::env_get;
use weft_core::error::{EngineError, SysError};
use weft_core::{wdebug, werror};
use weft_runtime::{tls, Fiber, IoEvent, IoManager};

/// Set once by whichever wait loses the race: holds the errno to surface.
struct CancelFlag(AtomicI32);

impl CancelFlag {
    fn new() -> Self {
        CancelFlag(AtomicI32::new(0))
    }

    fn get(&self) -> i32 {
        self.0.load(Ordering::Acquire)
    }

    fn set(&self, errno: i32) {
        self.0.store(errno, Ordering::Release);
    }
}

#[inline]
fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

#[inline]
fn check_ssize(n: libc::ssize_t) -> IoResult<usize> {
    if n < 0 {
        Err(IoError::last_sys())
    } else {
        Ok(n as usize)
    }
}

#[inline]
fn check_zero(n: libc::c_int) -> IoResult<()> {
    if n == -1 {
        Err(IoError::last_sys())
    } else {
        Ok(())
    }
}

/// The record for `fd` when the cooperative path applies to it, None when
/// the call should fall through to the raw syscall.
fn coop_record(fd: RawFd) -> IoResult<Option<Arc<FdRecord>>> {
    if !tls::coop_io_enabled() {
        return Ok(None);
    }
    let Some(record) = FdRegistry::instance().get(fd, false) else {
        return Ok(None);
    };
    if record.is_closed() {
        return Err(IoError::Sys(SysError(libc::EBADF)));
    }
    if !record.is_socket() || record.user_nonblock() {
        return Ok(None);
    }
    Ok(Some(record))
}

/// Core of every potentially-blocking wrapper.
fn do_io<F>(fd: RawFd, ev: IoEvent, tkind: TimeoutKind, name: &str, mut raw: F) -> IoResult<usize>
where
    F: FnMut() -> libc::ssize_t,
{
    let Some(record) = coop_record(fd)? else {
        return check_ssize(raw());
    };

    let timeout = record.timeout(tkind);
    let flag = Arc::new(CancelFlag::new());

    loop {
        let mut n = raw();
        while n == -1 && errno() == libc::EINTR {
            n = raw();
        }
        if n >= 0 {
            return Ok(n as usize);
        }
        if errno() != libc::EAGAIN {
            return Err(IoError::last_sys());
        }

        wdebug!("{}: fd={} would block, parking fiber", name, fd);
        let iom = IoManager::current().ok_or(IoError::Engine(EngineError::NoReactor))?;

        let timer = if timeout != NO_TIMEOUT {
            let weak_flag = Arc::downgrade(&flag);
            let iom2 = iom.clone();
            let witness: Arc<dyn Any + Send + Sync> = flag.clone();
            let timer = iom.add_conditional_timer(
                timeout,
                move || {
                    let Some(flag) = weak_flag.upgrade() else { return };
                    if flag.get() != 0 {
                        return;
                    }
                    flag.set(libc::ETIMEDOUT);
                    iom2.cancel_event(fd, ev);
                },
                Arc::downgrade(&witness),
                false,
            );
            Some(timer)
        } else {
            None
        };

        if let Err(e) = iom.add_event(fd, ev, None) {
            werror!("{}: arming {:?} on fd {} failed", name, ev, fd);
            if let Some(t) = &timer {
                t.cancel();
            }
            return Err(e.into());
        }
        Fiber::yield_to_hold();

        if let Some(t) = &timer {
            t.cancel();
        }
        let cancelled = flag.get();
        if cancelled != 0 {
            return Err(IoError::Sys(SysError(cancelled)));
        }
        if record.is_closed() {
            // close() synthesised the wake-up; do not re-park on a dead fd
            return Err(IoError::Sys(SysError(libc::EBADF)));
        }
        // woken by readiness: go round and retry the syscall
    }
}

// ── creation / teardown ──

/// `socket(2)`; the new fd is registered so later wrappers recognise it.
pub fn socket(domain: i32, ty: i32, protocol: i32) -> IoResult<RawFd> {
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if fd == -1 {
        return Err(IoError::last_sys());
    }
    if tls::coop_io_enabled() {
        FdRegistry::instance().get(fd, true);
    }
    Ok(fd)
}

/// `close(2)`; any fiber still parked on the fd is woken first (it observes
/// a synthesised event and retries against the closed fd).
pub fn close(fd: RawFd) -> IoResult<()> {
    if tls::coop_io_enabled() {
        if let Some(record) = FdRegistry::instance().get(fd, false) {
            record.mark_closed();
            if let Some(iom) = IoManager::current() {
                iom.cancel_all(fd);
            }
            FdRegistry::instance().del(fd);
        }
    }
    check_zero(unsafe { libc::close(fd) })
}

/// `bind(2)` (never blocks; plain forwarding)
pub fn bind(fd: RawFd, addr: &SocketAddr) -> IoResult<()> {
    let (ss, len) = sockaddr_from(addr);
    check_zero(unsafe { libc::bind(fd, &ss as *const _ as *const libc::sockaddr, len) })
}

/// `listen(2)` (never blocks; plain forwarding)
pub fn listen(fd: RawFd, backlog: i32) -> IoResult<()> {
    check_zero(unsafe { libc::listen(fd, backlog) })
}

/// `accept(2)`; parks until a connection is pending. The accepted fd is
/// registered like [`socket`] does.
pub fn accept(fd: RawFd) -> IoResult<RawFd> {
    let n = do_io(fd, IoEvent::Read, TimeoutKind::Recv, "accept", || unsafe {
        libc::accept(fd, std::ptr::null_mut(), std::ptr::null_mut()) as libc::ssize_t
    })?;
    let newfd = n as RawFd;
    if tls::coop_io_enabled() {
        FdRegistry::instance().get(newfd, true);
    }
    Ok(newfd)
}

// ── data plane ──

/// `read(2)`
pub fn read(fd: RawFd, buf: &mut [u8]) -> IoResult<usize> {
    do_io(fd, IoEvent::Read, TimeoutKind::Recv, "read", || unsafe {
        libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
    })
}

/// `write(2)`
pub fn write(fd: RawFd, buf: &[u8]) -> IoResult<usize> {
    do_io(fd, IoEvent::Write, TimeoutKind::Send, "write", || unsafe {
        libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len())
    })
}

/// `recv(2)`
pub fn recv(fd: RawFd, buf: &mut [u8], flags: i32) -> IoResult<usize> {
    do_io(fd, IoEvent::Read, TimeoutKind::Recv, "recv", || unsafe {
        libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), flags)
    })
}

/// `send(2)`
pub fn send(fd: RawFd, buf: &[u8], flags: i32) -> IoResult<usize> {
    do_io(fd, IoEvent::Write, TimeoutKind::Send, "send", || unsafe {
        libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), flags)
    })
}

/// `readv(2)`
pub fn readv(fd: RawFd, bufs: &mut [IoSliceMut<'_>]) -> IoResult<usize> {
    do_io(fd, IoEvent::Read, TimeoutKind::Recv, "readv", || unsafe {
        libc::readv(fd, bufs.as_mut_ptr() as *mut libc::iovec, bufs.len() as libc::c_int)
    })
}

/// `writev(2)`
pub fn writev(fd: RawFd, bufs: &[IoSlice<'_>]) -> IoResult<usize> {
    do_io(fd, IoEvent::Write, TimeoutKind::Send, "writev", || unsafe {
        libc::writev(fd, bufs.as_ptr() as *const libc::iovec, bufs.len() as libc::c_int)
    })
}

// ── connect ──

fn connect_timeout_cell() -> &'static AtomicU64 {
    static CELL: OnceLock<AtomicU64> = OnceLock::new();
    CELL.get_or_init(|| {
        AtomicU64::new(env_get("WEFT_CONNECT_TIMEOUT_MS", DEFAULT_CONNECT_TIMEOUT_MS))
    })
}

/// The process-wide default connect timeout in ms
pub fn connect_timeout_ms() -> u64 {
    connect_timeout_cell().load(Ordering::Acquire)
}

/// Change the process-wide default connect timeout at runtime.
pub fn set_connect_timeout_ms(ms: u64) {
    connect_timeout_cell().store(ms, Ordering::Release);
}

/// `connect(2)` with the process-wide default timeout
pub fn connect(fd: RawFd, addr: &SocketAddr) -> IoResult<()> {
    connect_with_timeout(fd, addr, connect_timeout_ms())
}

/// `connect(2)` with an explicit timeout (`u64::MAX` = none).
///
/// Waits on WRITE readiness and reads SO_ERROR afterwards, so the result is
/// the precise connection outcome rather than just "became writable".
pub fn connect_with_timeout(fd: RawFd, addr: &SocketAddr, timeout_ms: u64) -> IoResult<()> {
    let (ss, len) = sockaddr_from(addr);
    let raw_connect =
        || unsafe { libc::connect(fd, &ss as *const _ as *const libc::sockaddr, len) };

    if !tls::coop_io_enabled() {
        return check_zero(raw_connect());
    }
    let record = FdRegistry::instance().get(fd, false);
    let Some(record) = record else {
        return check_zero(raw_connect());
    };
    if record.is_closed() {
        return Err(IoError::Sys(SysError(libc::EBADF)));
    }
    if !record.is_socket() || record.user_nonblock() {
        return check_zero(raw_connect());
    }

    let n = raw_connect();
    if n == 0 {
        return Ok(());
    }
    if errno() != libc::EINPROGRESS {
        return Err(IoError::last_sys());
    }

    let iom = IoManager::current().ok_or(IoError::Engine(EngineError::NoReactor))?;
    let flag = Arc::new(CancelFlag::new());

    let timer = if timeout_ms != NO_TIMEOUT {
        let weak_flag = Arc::downgrade(&flag);
        let iom2 = iom.clone();
        let witness: Arc<dyn Any + Send + Sync> = flag.clone();
        Some(iom.add_conditional_timer(
            timeout_ms,
            move || {
                let Some(flag) = weak_flag.upgrade() else { return };
                if flag.get() != 0 {
                    return;
                }
                flag.set(libc::ETIMEDOUT);
                iom2.cancel_event(fd, IoEvent::Write);
            },
            Arc::downgrade(&witness),
            false,
        ))
    } else {
        None
    };

    match iom.add_event(fd, IoEvent::Write, None) {
        Ok(()) => {
            Fiber::yield_to_hold();
            if let Some(t) = &timer {
                t.cancel();
            }
            let cancelled = flag.get();
            if cancelled != 0 {
                return Err(IoError::Sys(SysError(cancelled)));
            }
        }
        Err(e) => {
            if let Some(t) = &timer {
                t.cancel();
            }
            werror!("connect: arming WRITE on fd {} failed", fd);
            return Err(e.into());
        }
    }

    // writability only says the handshake finished; SO_ERROR says how
    let mut err: libc::c_int = 0;
    let mut errlen = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rt = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut errlen,
        )
    };
    if rt == -1 {
        return Err(IoError::last_sys());
    }
    if err != 0 {
        return Err(IoError::Sys(SysError(err)));
    }
    Ok(())
}

// ── flag / timeout reconciliation ──

/// Toggle non-blocking behavior the way the caller sees it.
///
/// For a managed socket the real fd keeps O_NONBLOCK either way (the runtime
/// needs it); only the user-visible flag changes, and wrappers fall through
/// to raw non-blocking syscalls when it is set. Unmanaged fds get a real
/// fcntl toggle.
pub fn set_nonblocking(fd: RawFd, on: bool) -> IoResult<()> {
    if tls::coop_io_enabled() {
        if let Some(record) = FdRegistry::instance().get(fd, false) {
            if !record.is_closed() && record.is_socket() {
                record.set_user_nonblock(on);
                return Ok(());
            }
        }
    }
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags == -1 {
        return Err(IoError::last_sys());
    }
    let flags = if on { flags | libc::O_NONBLOCK } else { flags & !libc::O_NONBLOCK };
    check_zero(unsafe { libc::fcntl(fd, libc::F_SETFL, flags) })
}

/// Non-blocking behavior as the caller sees it (the counterpart of
/// [`set_nonblocking`]).
pub fn nonblocking(fd: RawFd) -> IoResult<bool> {
    if tls::coop_io_enabled() {
        if let Some(record) = FdRegistry::instance().get(fd, false) {
            if !record.is_closed() && record.is_socket() {
                return Ok(record.user_nonblock());
            }
        }
    }
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags == -1 {
        return Err(IoError::last_sys());
    }
    Ok(flags & libc::O_NONBLOCK != 0)
}

/// Configure the receive timeout (SO_RCVTIMEO): remembered for the
/// cooperative path and forwarded to the real socket option.
pub fn set_recv_timeout(fd: RawFd, ms: u64) -> IoResult<()> {
    set_timeout(fd, TimeoutKind::Recv, libc::SO_RCVTIMEO, ms)
}

/// Configure the send timeout (SO_SNDTIMEO)
pub fn set_send_timeout(fd: RawFd, ms: u64) -> IoResult<()> {
    set_timeout(fd, TimeoutKind::Send, libc::SO_SNDTIMEO, ms)
}

/// The remembered receive timeout, if the fd is managed
pub fn recv_timeout(fd: RawFd) -> Option<u64> {
    FdRegistry::instance().get(fd, false).map(|r| r.timeout(TimeoutKind::Recv))
}

/// The remembered send timeout, if the fd is managed
pub fn send_timeout(fd: RawFd) -> Option<u64> {
    FdRegistry::instance().get(fd, false).map(|r| r.timeout(TimeoutKind::Send))
}

fn set_timeout(fd: RawFd, kind: TimeoutKind, optname: libc::c_int, ms: u64) -> IoResult<()> {
    if let Some(record) = FdRegistry::instance().get(fd, false) {
        record.set_timeout(kind, ms);
    }
    let tv = libc::timeval {
        tv_sec: (ms / 1000) as libc::time_t,
        tv_usec: ((ms % 1000) * 1000) as libc::suseconds_t,
    };
    check_zero(unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            optname,
            &tv as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::timeval>() as libc::socklen_t,
        )
    })
}

fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut ss: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        SocketAddr::V4(a) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: a.port().to_be(),
                sin_addr: libc::in_addr { s_addr: u32::from(*a.ip()).to_be() },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut ss as *mut _ as *mut libc::sockaddr_in, sin);
            }
            (ss, std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(a) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: a.port().to_be(),
                sin6_flowinfo: a.flowinfo(),
                sin6_addr: libc::in6_addr { s6_addr: a.ip().octets() },
                sin6_scope_id: a.scope_id(),
            };
            unsafe {
                std::ptr::write(&mut ss as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            (ss, std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::net::{TcpListener, TcpStream};
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    fn reactor(name: &str) -> Arc<IoManager> {
        IoManager::new(2, false, name)
    }

    #[test]
    fn test_raw_fallthrough_off_reactor() {
        // no reactor on this thread: read on a pipe is a plain syscall
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        assert_eq!(write(fds[1], b"hi").unwrap(), 2);
        let mut buf = [0u8; 8];
        assert_eq!(read(fds[0], &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"hi");
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_echo_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4];
            std::io::Read::read_exact(&mut stream, &mut buf).unwrap();
            stream.write_all(&buf).unwrap();
        });

        let iom = reactor("t-echo");
        let (tx, rx) = mpsc::channel();
        iom.schedule(move || {
            let run = || -> IoResult<(Vec<u8>, RawFd)> {
                let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0)?;
                connect(fd, &addr)?;
                send(fd, b"PING", 0)?;
                let mut buf = [0u8; 4];
                let mut got = 0;
                while got < 4 {
                    got += recv(fd, &mut buf[got..], 0)?;
                }
                Ok((buf.to_vec(), fd))
            };
            tx.send(run()).unwrap();
        });

        let (echoed, fd) = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(echoed, b"PING");

        // the fd record shows the reconciled flags
        let record = FdRegistry::instance().get(fd, false).unwrap();
        assert!(record.is_socket());
        assert!(record.sys_nonblock());
        assert!(!record.user_nonblock());

        let (tx, rx) = mpsc::channel();
        iom.schedule(move || {
            tx.send(close(fd)).unwrap();
        });
        rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();

        server.join().unwrap();
        iom.stop();
    }

    #[test]
    fn test_parked_reader_woken_by_late_writer() {
        let iom = reactor("t-park");
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) },
            0
        );
        let (a, b) = (fds[0], fds[1]);

        let (tx, rx) = mpsc::channel();
        iom.schedule(move || {
            // the registry learns about the fd on first contact
            FdRegistry::instance().get(a, true);
            let mut buf = [0u8; 5];
            let n = read(a, &mut buf).unwrap();
            tx.send(buf[..n].to_vec()).unwrap();
        });

        iom.schedule(move || {
            FdRegistry::instance().get(b, true);
            crate::sleep::sleep_ms(100);
            send(b, b"hello", 0).unwrap();
        });

        let got = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(got, b"hello");

        iom.stop();
        FdRegistry::instance().del(a);
        FdRegistry::instance().del(b);
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn test_recv_timeout_surfaces_etimedout() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        // server accepts but never writes
        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            std::thread::sleep(Duration::from_millis(800));
            drop(stream);
        });

        let iom = reactor("t-rcvto");
        let (tx, rx) = mpsc::channel();
        iom.schedule(move || {
            let run = || -> (IoResult<usize>, Duration) {
                let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
                connect(fd, &addr).unwrap();
                set_recv_timeout(fd, 200).unwrap();
                assert_eq!(recv_timeout(fd), Some(200));
                let start = Instant::now();
                let mut buf = [0u8; 4];
                let res = recv(fd, &mut buf, 0);
                (res, start.elapsed())
            };
            tx.send(run()).unwrap();
        });

        let (res, elapsed) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let err = res.unwrap_err();
        assert!(err.is_timeout(), "expected timeout, got {:?}", err);
        assert!(elapsed >= Duration::from_millis(150), "returned too early: {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(700), "returned too late: {:?}", elapsed);

        server.join().unwrap();
        iom.stop();
    }

    #[test]
    fn test_connect_timeout_unroutable() {
        let iom = reactor("t-connto");
        let (tx, rx) = mpsc::channel();
        iom.schedule(move || {
            let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
            // TEST-NET-1: unroutable in any sane environment
            let addr: SocketAddr = "192.0.2.1:81".parse().unwrap();
            let start = Instant::now();
            let res = connect_with_timeout(fd, &addr, 200);
            tx.send((res, start.elapsed())).unwrap();
        });

        let (res, elapsed) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let err = res.unwrap_err();
        match err.errno() {
            Some(e) if e == libc::ETIMEDOUT => {
                assert!(elapsed >= Duration::from_millis(150), "too early: {:?}", elapsed);
                assert!(elapsed < Duration::from_millis(1500), "too late: {:?}", elapsed);
            }
            // environments with an explicit reject route fail fast; that is
            // still a correct connect() outcome, just not a timeout
            Some(e)
                if e == libc::EHOSTUNREACH
                    || e == libc::ENETUNREACH
                    || e == libc::ECONNREFUSED => {}
            other => panic!("unexpected connect error: {:?} ({:?})", err, other),
        }
        iom.stop();
    }

    #[test]
    fn test_vectored_round_trip() {
        let iom = reactor("t-vec");
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) },
            0
        );
        let (a, b) = (fds[0], fds[1]);

        let (tx, rx) = mpsc::channel();
        iom.schedule(move || {
            FdRegistry::instance().get(a, true);
            FdRegistry::instance().get(b, true);

            let n = writev(b, &[IoSlice::new(b"vec"), IoSlice::new(b"tored")]).unwrap();
            assert_eq!(n, 8);

            let mut first = [0u8; 3];
            let mut second = [0u8; 5];
            let mut n = 0;
            while n < 8 {
                let (lo, hi) = if n < 3 { (n, 0) } else { (3, n - 3) };
                let mut bufs =
                    [IoSliceMut::new(&mut first[lo..]), IoSliceMut::new(&mut second[hi..])];
                n += readv(a, &mut bufs).unwrap();
            }
            tx.send((first.to_vec(), second.to_vec())).unwrap();
        });

        let (first, second) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first, b"vec");
        assert_eq!(second, b"tored");

        iom.stop();
        FdRegistry::instance().del(a);
        FdRegistry::instance().del(b);
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn test_user_nonblock_bypasses_parking() {
        let iom = reactor("t-unb");
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) },
            0
        );
        let (a, b) = (fds[0], fds[1]);

        let (tx, rx) = mpsc::channel();
        iom.schedule(move || {
            FdRegistry::instance().get(a, true);
            set_nonblocking(a, true).unwrap();
            assert!(nonblocking(a).unwrap());

            // an empty socket with user-nonblock set reports EAGAIN instead
            // of parking
            let mut buf = [0u8; 4];
            let res = read(a, &mut buf);
            tx.send(res.map(|_| ()).unwrap_err().is_would_block()).unwrap();
        });

        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());

        iom.stop();
        FdRegistry::instance().del(a);
        FdRegistry::instance().del(b);
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn test_close_wakes_parked_reader() {
        let iom = reactor("t-close");
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) },
            0
        );
        let (a, b) = (fds[0], fds[1]);

        let (tx, rx) = mpsc::channel();
        iom.schedule(move || {
            FdRegistry::instance().get(a, true);
            let mut buf = [0u8; 4];
            // parked on a; close(a) from the other fiber synthesises the
            // event, and the retry hits the closed record
            let res = read(a, &mut buf);
            tx.send(res).unwrap();
        });

        iom.schedule(move || {
            crate::sleep::sleep_ms(100);
            close(a).unwrap();
        });

        let res = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let err = res.unwrap_err();
        assert_eq!(err.errno(), Some(libc::EBADF));

        iom.stop();
        unsafe { libc::close(b) };
    }
}
