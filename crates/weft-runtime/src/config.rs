//! Runtime configuration
//!
//! Compile-time defaults with environment overrides, read once.
//!
//! Environment variables:
//! - `WEFT_STACK_SIZE` - fiber stack size in bytes (default 1 MiB)

use std::sync::OnceLock;
use weft_core::constants::{DEFAULT_STACK_SIZE, MIN_STACK_SIZE};
use weft_core::env::env_get;
use weft_core::error::EngineError;
use weft_core::wwarn;

/// Compile-time defaults
pub mod defaults {
    pub const STACK_SIZE: usize = super::DEFAULT_STACK_SIZE;
}

/// Runtime configuration with builder-style setters
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Stack size per fiber, in bytes
    pub stack_size: usize,
}

impl RuntimeConfig {
    /// Defaults with environment overrides applied
    pub fn from_env() -> Self {
        RuntimeConfig {
            stack_size: env_get("WEFT_STACK_SIZE", defaults::STACK_SIZE),
        }
    }

    /// Plain defaults, no environment lookup
    pub fn new() -> Self {
        RuntimeConfig { stack_size: defaults::STACK_SIZE }
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.stack_size < MIN_STACK_SIZE {
            return Err(EngineError::InvalidConfig("stack_size below minimum"));
        }
        Ok(())
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

static CONFIG: OnceLock<RuntimeConfig> = OnceLock::new();

fn global() -> &'static RuntimeConfig {
    CONFIG.get_or_init(|| {
        let cfg = RuntimeConfig::from_env();
        match cfg.validate() {
            Ok(()) => cfg,
            Err(e) => {
                wwarn!("ignoring invalid runtime config ({}), using defaults", e);
                RuntimeConfig::new()
            }
        }
    })
}

/// Stack size used for fibers created without an explicit size
#[inline]
pub fn stack_size() -> usize {
    global().stack_size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = RuntimeConfig::new();
        assert_eq!(cfg.stack_size, 1024 * 1024);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_builder_and_validation() {
        let cfg = RuntimeConfig::new().stack_size(8 * 1024);
        assert!(cfg.validate().is_err());

        let cfg = RuntimeConfig::new().stack_size(256 * 1024);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_global_stack_size_sane() {
        assert!(stack_size() >= MIN_STACK_SIZE);
    }
}
