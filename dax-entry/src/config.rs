//! Engine Configuration
//!
//! Tunables for the entry engine. Configuration can be set programmatically
//! or loaded from environment variables.
//!
//! # Environment Variables
//!
//! All environment variables use the `DAX_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `DAX_SCAN_BATCH` | Entries visited before a range scan drops the index lock | 4096 |
//! | `DAX_WAIT_TIMEOUT_MS` | Bound on waiting for a locked entry (0 = wait forever) | 0 |
//! | `DAX_IDLE_TIMEOUT_MS` | Bound on waiting for a busy frame (0 = wait forever) | 0 |
//! | `DAX_NOMEM_RETRY_LIMIT` | Index growth retries before `OutOfMemory` (0 = unbounded) | 0 |
//!
//! # Example
//!
//! ```rust
//! use dax_entry::config::EngineConfig;
//! use std::time::Duration;
//!
//! let config = EngineConfig::builder()
//!     .scan_batch(1024)
//!     .wait_timeout(Some(Duration::from_secs(5)))
//!     .build()
//!     .unwrap();
//! assert_eq!(config.scan_batch, 1024);
//! ```

use std::env;
use std::time::Duration;

use thiserror::Error;

/// Default number of entries a range scan visits between lock drops.
pub const DEFAULT_SCAN_BATCH: usize = 4096;

/// Engine configuration.
///
/// The defaults are unbounded:
/// waits never time out and index growth is retried forever.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Entries visited by writeback, zap and delete scans before the index
    /// lock is released and the thread yields.
    /// Default: 4096.
    pub scan_batch: usize,

    /// Maximum time to wait for a locked entry.
    /// None means wait forever (default).
    pub wait_timeout: Option<Duration>,

    /// Maximum time [`wait_until_idle`](crate::frame::FramePool::wait_until_idle)
    /// waits for a frame's external users to go away.
    /// None means wait forever (default).
    pub idle_timeout: Option<Duration>,

    /// Number of times index growth is retried before giving up.
    /// None means retry forever (default).
    pub nomem_retry_limit: Option<u32>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scan_batch: DEFAULT_SCAN_BATCH,
            wait_timeout: None,
            idle_timeout: None,
            nomem_retry_limit: None,
        }
    }
}

impl EngineConfig {
    /// Create a new builder for EngineConfig.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Variables that are not set, or do not parse, keep their defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(val) = parse_env_usize("DAX_SCAN_BATCH") {
            if val > 0 {
                config.scan_batch = val;
            }
        }

        if let Some(val) = parse_env_u64("DAX_WAIT_TIMEOUT_MS") {
            config.wait_timeout = millis_or_none(val);
        }

        if let Some(val) = parse_env_u64("DAX_IDLE_TIMEOUT_MS") {
            config.idle_timeout = millis_or_none(val);
        }

        if let Some(val) = parse_env_u64("DAX_NOMEM_RETRY_LIMIT") {
            config.nomem_retry_limit = if val > 0 {
                Some(u32::try_from(val).unwrap_or(u32::MAX))
            } else {
                None
            };
        }

        config
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scan_batch == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scan_batch".into(),
                message: "must be at least 1".into(),
            });
        }

        if self.wait_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::InvalidValue {
                field: "wait_timeout".into(),
                message: "use None to wait forever".into(),
            });
        }

        if self.idle_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::InvalidValue {
                field: "idle_timeout".into(),
                message: "use None to wait forever".into(),
            });
        }

        if self.nomem_retry_limit == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "nomem_retry_limit".into(),
                message: "use None to retry forever".into(),
            });
        }

        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("invalid configuration for '{field}': {message}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Error message.
        message: String,
    },
}

/// Builder for EngineConfig.
#[derive(Debug, Clone, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the scan batch size.
    pub fn scan_batch(mut self, n: usize) -> Self {
        self.config.scan_batch = n;
        self
    }

    /// Set the locked-entry wait bound.
    pub fn wait_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.wait_timeout = timeout;
        self
    }

    /// Set the busy-frame wait bound.
    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// Set the index growth retry limit.
    pub fn nomem_retry_limit(mut self, limit: Option<u32>) -> Self {
        self.config.nomem_retry_limit = limit;
        self
    }

    /// Build the configuration.
    ///
    /// This validates the configuration and returns an error if invalid.
    pub fn build(self) -> Result<EngineConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build the configuration without validation.
    pub fn build_unchecked(self) -> EngineConfig {
        self.config
    }
}

fn millis_or_none(ms: u64) -> Option<Duration> {
    if ms > 0 {
        Some(Duration::from_millis(ms))
    } else {
        None
    }
}

/// Parse an environment variable as usize.
fn parse_env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

/// Parse an environment variable as u64.
fn parse_env_u64(name: &str) -> Option<u64> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}
