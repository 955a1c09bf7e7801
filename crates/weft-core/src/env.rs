//! Environment variable parsing helpers
//!
//! ```ignore
//! use weft_core::env::{env_get, env_get_bool};
//!
//! let stack: usize = env_get("WEFT_STACK_SIZE", 1024 * 1024);
//! let flush = env_get_bool("WEFT_LOG_FLUSH", false);
//! ```

use std::str::FromStr;

/// Get an environment variable parsed as `T`, or the default
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Get an environment variable as boolean
///
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true; anything
/// else that is set counts as false; unset returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Get an environment variable as `Some(T)` if set and parseable
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
