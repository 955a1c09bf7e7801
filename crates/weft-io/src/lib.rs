//! # weft-io
//!
//! Blocking-style I/O for weft fibers.
//!
//! The functions in this crate look like ordinary syscall wrappers - `read`,
//! `write`, `connect`, `sleep` - but when called on a thread driven by an
//! [`IoManager`](weft_runtime::IoManager), a call that would block instead
//! parks the calling fiber on the reactor and frees the worker thread. On
//! any other thread (or for a non-socket fd, or one the caller explicitly
//! made non-blocking) they fall through to the raw syscall.
//!
//! ```ignore
//! let iom = weft_runtime::IoManager::new(2, false, "io");
//! iom.schedule(|| {
//!     let fd = weft_io::socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
//!     weft_io::connect(fd, &"127.0.0.1:8080".parse().unwrap()).unwrap();
//!     weft_io::write(fd, b"PING").unwrap();
//!     let mut buf = [0u8; 4];
//!     weft_io::read(fd, &mut buf).unwrap();
//!     weft_io::close(fd).unwrap();
//! });
//! ```

pub mod error;
pub mod fd_registry;
pub mod sleep;
pub mod sockio;

pub use error::{IoError, IoResult};
pub use fd_registry::{FdRecord, FdRegistry, TimeoutKind};
pub use sleep::{sleep, sleep_ms, sleep_us};
pub use sockio::{
    accept, bind, close, connect, connect_timeout_ms, connect_with_timeout, listen, nonblocking,
    read, readv, recv, recv_timeout, send, send_timeout, set_connect_timeout_ms, set_nonblocking,
    set_recv_timeout, set_send_timeout, socket, write, writev,
};
