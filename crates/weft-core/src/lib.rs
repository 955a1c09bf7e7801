//! # weft-core
//!
//! Core support types for the weft fiber runtime.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! Everything that touches the OS (context switching, epoll, fd plumbing)
//! lives in `weft-runtime` and `weft-io`.
//!
//! ## Modules
//!
//! - `error` - engine error types and the OS-errno wrapper
//! - `log` - leveled stderr logging macros
//! - `env` - environment variable parsing helpers

#![allow(dead_code)]

pub mod env;
pub mod error;
pub mod log;

// Re-exports for convenience
pub use env::{env_get, env_get_bool, env_get_opt};
pub use error::{EngineError, EngineResult, SysError};
pub use log::LogLevel;

/// Shared constants
pub mod constants {
    /// Default fiber stack size (1 MiB)
    pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

    /// Minimum accepted fiber stack size
    pub const MIN_STACK_SIZE: usize = 16 * 1024;

    /// Timeout sentinel meaning "no timeout configured"
    pub const NO_TIMEOUT: u64 = u64::MAX;

    /// Default TCP connect timeout in milliseconds
    pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

    /// Longest single epoll_wait the reactor will issue, in milliseconds
    pub const MAX_EPOLL_TIMEOUT_MS: u64 = 1000;
}
