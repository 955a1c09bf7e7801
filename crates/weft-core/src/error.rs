//! Error types for the weft runtime
//!
//! Two kinds of failure are kept deliberately distinct: `SysError` carries a
//! raw OS errno from a failed syscall, `EngineError` describes a failure of
//! the runtime machinery itself (no scheduler on this thread, stack mapping
//! failed, ...). Callers that need the errno can always recover it.

use core::fmt;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// A raw OS error, identified by errno
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SysError(pub i32);

impl SysError {
    /// Capture errno of the calling thread
    pub fn last() -> Self {
        SysError(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }

    /// The raw errno value
    #[inline]
    pub const fn errno(&self) -> i32 {
        self.0
    }
}

impl fmt::Display for SysError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (errno {})", std::io::Error::from_raw_os_error(self.0), self.0)
    }
}

impl std::error::Error for SysError {}

/// Failures of the runtime machinery itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// No scheduler is running on the calling thread
    NoScheduler,

    /// No reactor (I/O manager) is running on the calling thread
    NoReactor,

    /// The calling thread is not executing a fiber
    NotAFiber,

    /// Scheduler was already started
    AlreadyStarted,

    /// Fiber stack could not be mapped
    StackAlloc(SysError),

    /// Guard page protection could not be applied
    StackProtect(SysError),

    /// Invalid configuration value
    InvalidConfig(&'static str),

    /// A syscall the engine depends on failed
    Sys(SysError),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::NoScheduler => write!(f, "no scheduler on this thread"),
            EngineError::NoReactor => write!(f, "no reactor on this thread"),
            EngineError::NotAFiber => write!(f, "not running inside a fiber"),
            EngineError::AlreadyStarted => write!(f, "scheduler already started"),
            EngineError::StackAlloc(e) => write!(f, "fiber stack allocation failed: {}", e),
            EngineError::StackProtect(e) => write!(f, "fiber guard page setup failed: {}", e),
            EngineError::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
            EngineError::Sys(e) => write!(f, "syscall failed: {}", e),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<SysError> for EngineError {
    fn from(e: SysError) -> Self {
        EngineError::Sys(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = EngineError::NoScheduler;
        assert_eq!(format!("{}", e), "no scheduler on this thread");

        let e = EngineError::InvalidConfig("stack too small");
        assert_eq!(format!("{}", e), "invalid config: stack too small");
    }

    #[test]
    fn test_sys_error_errno() {
        let e = SysError(libc_eagain());
        assert_eq!(e.errno(), libc_eagain());
        let display = format!("{}", e);
        assert!(display.contains(&format!("errno {}", libc_eagain())));
    }

    #[test]
    fn test_error_conversion() {
        let sys = SysError(9);
        let eng: EngineError = sys.into();
        assert!(matches!(eng, EngineError::Sys(SysError(9))));
    }

    // EAGAIN without depending on libc in this crate
    fn libc_eagain() -> i32 {
        11
    }
}
