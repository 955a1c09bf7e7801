//! I/O facade errors
//!
//! The two failure kinds stay distinct: `Sys` carries the raw errno from the
//! OS, `Engine` is a runtime-machinery failure (most commonly "no reactor on
//! this thread"). Application code matching on timeouts checks
//! [`IoError::is_timeout`] rather than digging for the errno.

use core::fmt;
use weft_core::error::{EngineError, SysError};

pub type IoResult<T> = Result<T, IoError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoError {
    /// The OS refused: raw errno attached
    Sys(SysError),
    /// The runtime machinery failed
    Engine(EngineError),
}

impl IoError {
    /// Capture errno of the calling thread
    pub fn last_sys() -> Self {
        IoError::Sys(SysError::last())
    }

    /// The raw errno, when this is an OS error
    pub fn errno(&self) -> Option<i32> {
        match self {
            IoError::Sys(e) => Some(e.errno()),
            IoError::Engine(_) => None,
        }
    }

    /// Whether this is an ETIMEDOUT surfaced by a configured timeout
    pub fn is_timeout(&self) -> bool {
        self.errno() == Some(libc::ETIMEDOUT)
    }

    /// Whether this is EAGAIN/EWOULDBLOCK
    pub fn is_would_block(&self) -> bool {
        matches!(self.errno(), Some(e) if e == libc::EAGAIN || e == libc::EWOULDBLOCK)
    }
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoError::Sys(e) => write!(f, "{}", e),
            IoError::Engine(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for IoError {}

impl From<SysError> for IoError {
    fn from(e: SysError) -> Self {
        IoError::Sys(e)
    }
}

impl From<EngineError> for IoError {
    fn from(e: EngineError) -> Self {
        match e {
            // a failed syscall inside the engine is still an OS error to the
            // caller; keep the errno reachable
            EngineError::Sys(s) => IoError::Sys(s),
            other => IoError::Engine(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_stay_distinct() {
        let sys: IoError = SysError(libc::ETIMEDOUT).into();
        assert!(sys.is_timeout());
        assert_eq!(sys.errno(), Some(libc::ETIMEDOUT));

        let eng: IoError = EngineError::NoReactor.into();
        assert!(!eng.is_timeout());
        assert_eq!(eng.errno(), None);

        // engine-wrapped syscall failures surface their errno
        let wrapped: IoError = EngineError::Sys(SysError(libc::EPERM)).into();
        assert_eq!(wrapped.errno(), Some(libc::EPERM));
    }

    #[test]
    fn test_would_block() {
        let e: IoError = SysError(libc::EAGAIN).into();
        assert!(e.is_would_block());
        let e: IoError = SysError(libc::EBADF).into();
        assert!(!e.is_would_block());
    }
}
