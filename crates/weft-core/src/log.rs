//! Leveled stderr logging for weft
//!
//! Small, dependency-free and safe to call from any thread, including from
//! inside a fiber: each line is a single locked write to stderr, never a
//! blocking channel.
//!
//! # Environment Variables
//!
//! - `WEFT_LOG_LEVEL=<level>` - off|error|warn|info|debug|trace (or 0..5)
//! - `WEFT_LOG_FLUSH=1` - flush stderr after every line
//!
//! # Usage
//!
//! ```ignore
//! use weft_core::{werror, wwarn, winfo, wdebug, wtrace};
//!
//! winfo!("worker {} started", id);
//! werror!("epoll_ctl failed: {}", err);
//! ```

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Log levels, most severe first
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "off" | "0" => Some(LogLevel::Off),
            "error" | "1" => Some(LogLevel::Error),
            "warn" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "[ERROR]",
            LogLevel::Warn => "[WARN ]",
            LogLevel::Info => "[INFO ]",
            LogLevel::Debug => "[DEBUG]",
            LogLevel::Trace => "[TRACE]",
        }
    }
}

static LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static FLUSH: AtomicBool = AtomicBool::new(false);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Read `WEFT_LOG_LEVEL` / `WEFT_LOG_FLUSH` once.
///
/// Called automatically on first log; call explicitly for deterministic
/// startup ordering.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }
    if let Some(level) = std::env::var("WEFT_LOG_LEVEL").ok().and_then(|v| LogLevel::parse(&v)) {
        LEVEL.store(level as u8, Ordering::Relaxed);
    }
    if let Ok(v) = std::env::var("WEFT_LOG_FLUSH") {
        FLUSH.store(matches!(v.as_str(), "1" | "true" | "yes" | "on"), Ordering::Relaxed);
    }
}

/// Current level
#[inline]
pub fn level() -> LogLevel {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    LogLevel::from_u8(LEVEL.load(Ordering::Relaxed))
}

/// Override the level programmatically
pub fn set_level(level: LogLevel) {
    INITIALIZED.store(true, Ordering::SeqCst);
    LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Whether a message at `level` would be emitted
#[inline]
pub fn enabled(at: LogLevel) -> bool {
    at as u8 <= level() as u8
}

#[doc(hidden)]
pub fn _emit(at: LogLevel, args: std::fmt::Arguments<'_>) {
    if !enabled(at) {
        return;
    }
    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    let _ = write!(handle, "{} ", at.tag());
    let _ = handle.write_fmt(args);
    let _ = handle.write_all(b"\n");
    if FLUSH.load(Ordering::Relaxed) {
        let _ = handle.flush();
    }
}

/// Error level log
#[macro_export]
macro_rules! werror {
    ($($arg:tt)*) => {{
        $crate::log::_emit($crate::log::LogLevel::Error, format_args!($($arg)*));
    }};
}

/// Warning level log
#[macro_export]
macro_rules! wwarn {
    ($($arg:tt)*) => {{
        $crate::log::_emit($crate::log::LogLevel::Warn, format_args!($($arg)*));
    }};
}

/// Info level log
#[macro_export]
macro_rules! winfo {
    ($($arg:tt)*) => {{
        $crate::log::_emit($crate::log::LogLevel::Info, format_args!($($arg)*));
    }};
}

/// Debug level log
#[macro_export]
macro_rules! wdebug {
    ($($arg:tt)*) => {{
        $crate::log::_emit($crate::log::LogLevel::Debug, format_args!($($arg)*));
    }};
}

/// Trace level log (most verbose)
#[macro_export]
macro_rules! wtrace {
    ($($arg:tt)*) => {{
        $crate::log::_emit($crate::log::LogLevel::Trace, format_args!($($arg)*));
    }};
}
