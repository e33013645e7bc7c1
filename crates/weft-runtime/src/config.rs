//! Runtime configuration
//!
//! Compile-time defaults with environment overrides, builder-style.
//!
//! # Environment
//!
//! - `WEFT_STACK_SIZE` - fiber stack size in bytes
//! - `WEFT_NUM_WORKERS` - worker thread count
//! - `WEFT_PIN_CPU` - pin workers to cores (0/1)
//! - `WEFT_PIN_OFFSET` - first core index
//! - `WEFT_PIN_STRIDE` - core step between workers
//! - `WEFT_CONNECT_TIMEOUT_MS` - default connect timeout
//! - `WEFT_EPOLL_BATCH` - max events per epoll_wait
//! - `WEFT_IDLE_BLOCK_MS` - max reactor block per idle pass

use weft_core::env::{env_get, env_get_bool};

mod defaults {
    pub const STACK_SIZE: usize = 128 * 1024;
    pub const NUM_WORKERS: usize = 4;
    pub const PIN_CPU: bool = false;
    pub const PIN_OFFSET: usize = 0;
    pub const PIN_STRIDE: usize = 1;
    pub const CONNECT_TIMEOUT_MS: u64 = 5_000;
    pub const EPOLL_BATCH: usize = 256;
    pub const IDLE_BLOCK_MS: u64 = 5_000;
}

/// Knobs recognized by the scheduler and reactor.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Usable bytes per fiber stack (guard page excluded)
    pub stack_size: usize,
    /// Default worker count for runtimes built without an explicit one
    pub num_workers: usize,
    /// Pin worker threads to cores
    pub pin_cpu: bool,
    /// First core index used for pinning
    pub pin_offset: usize,
    /// Core step between consecutive workers
    pub pin_stride: usize,
    /// Default timeout for hooked connect, in milliseconds
    pub connect_timeout_ms: u64,
    /// Max kernel events per epoll_wait
    pub epoll_batch: usize,
    /// Max milliseconds the reactor blocks per idle pass
    pub idle_block_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RuntimeConfig {
    /// Compile-time defaults, no environment lookups.
    pub fn new() -> Self {
        Self {
            stack_size: defaults::STACK_SIZE,
            num_workers: defaults::NUM_WORKERS,
            pin_cpu: defaults::PIN_CPU,
            pin_offset: defaults::PIN_OFFSET,
            pin_stride: defaults::PIN_STRIDE,
            connect_timeout_ms: defaults::CONNECT_TIMEOUT_MS,
            epoll_batch: defaults::EPOLL_BATCH,
            idle_block_ms: defaults::IDLE_BLOCK_MS,
        }
    }

    /// Defaults with any `WEFT_*` environment overrides applied.
    pub fn from_env() -> Self {
        Self {
            stack_size: env_get("WEFT_STACK_SIZE", defaults::STACK_SIZE),
            num_workers: env_get("WEFT_NUM_WORKERS", defaults::NUM_WORKERS),
            pin_cpu: env_get_bool("WEFT_PIN_CPU", defaults::PIN_CPU),
            pin_offset: env_get("WEFT_PIN_OFFSET", defaults::PIN_OFFSET),
            pin_stride: env_get("WEFT_PIN_STRIDE", defaults::PIN_STRIDE),
            connect_timeout_ms: env_get("WEFT_CONNECT_TIMEOUT_MS", defaults::CONNECT_TIMEOUT_MS),
            epoll_batch: env_get("WEFT_EPOLL_BATCH", defaults::EPOLL_BATCH),
            idle_block_ms: env_get("WEFT_IDLE_BLOCK_MS", defaults::IDLE_BLOCK_MS),
        }
    }

    pub fn stack_size(mut self, n: usize) -> Self {
        self.stack_size = n;
        self
    }

    pub fn num_workers(mut self, n: usize) -> Self {
        self.num_workers = n;
        self
    }

    pub fn pin_cpu(mut self, on: bool) -> Self {
        self.pin_cpu = on;
        self
    }

    pub fn pin_offset(mut self, n: usize) -> Self {
        self.pin_offset = n;
        self
    }

    pub fn pin_stride(mut self, n: usize) -> Self {
        self.pin_stride = n;
        self
    }

    pub fn connect_timeout_ms(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = ms;
        self
    }

    pub fn epoll_batch(mut self, n: usize) -> Self {
        self.epoll_batch = n;
        self
    }

    pub fn idle_block_ms(mut self, ms: u64) -> Self {
        self.idle_block_ms = ms;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stack_size < 16 * 1024 {
            return Err(ConfigError::InvalidValue("stack_size must be >= 16 KiB"));
        }
        if self.num_workers == 0 {
            return Err(ConfigError::InvalidValue("num_workers must be > 0"));
        }
        if self.epoll_batch == 0 {
            return Err(ConfigError::InvalidValue("epoll_batch must be > 0"));
        }
        if self.idle_block_ms == 0 {
            return Err(ConfigError::InvalidValue("idle_block_ms must be > 0"));
        }
        Ok(())
    }
}

/// Configuration error
#[derive(Debug, Clone)]
pub enum ConfigError {
    InvalidValue(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(RuntimeConfig::new().validate().is_ok());
        assert!(RuntimeConfig::from_env().validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let c = RuntimeConfig::new()
            .num_workers(8)
            .stack_size(256 * 1024)
            .pin_cpu(true)
            .pin_offset(2)
            .pin_stride(2);
        assert_eq!(c.num_workers, 8);
        assert_eq!(c.stack_size, 256 * 1024);
        assert!(c.pin_cpu);
        assert_eq!(c.pin_offset, 2);
    }

    #[test]
    fn test_validation_rejects_zero_workers() {
        assert!(RuntimeConfig::new().num_workers(0).validate().is_err());
        assert!(RuntimeConfig::new().stack_size(1024).validate().is_err());
    }
}
