//! Scheduler configuration
//!
//! Loaded from TOML; every field has a default so an empty file is valid.

use crate::error::ConfigError;
use crate::logging::LoggingConfig;
use crate::types::DEFAULT_FLAG_PREFIX;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Busy message shown while another job holds a project's slot
pub const DEFAULT_BUSY_MESSAGE: &str = "Another task is running. Please wait.";

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Status polling cadence
    pub poll_interval_ms: u64,
    /// Client-side timeout around the fire-and-forget start call
    pub start_timeout_ms: u64,
    /// Deadline for the initial "last saved result" read
    pub load_deadline_ms: u64,
    /// Busy message when a job does not supply its own
    pub default_busy_message: String,
    /// Prefix for durable in-flight flags
    pub flag_prefix: String,
    /// Buffer size of the system notice channel
    pub notice_capacity: usize,
    /// Logging
    pub logging: LoggingConfig,
}

impl SchedulerConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With poll interval
    #[inline]
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = duration_ms(interval);
        self
    }

    /// With start timeout
    #[inline]
    #[must_use]
    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout_ms = duration_ms(timeout);
        self
    }

    /// With load deadline
    #[inline]
    #[must_use]
    pub fn with_load_deadline(mut self, deadline: Duration) -> Self {
        self.load_deadline_ms = duration_ms(deadline);
        self
    }

    /// Poll interval as a `Duration`
    #[inline]
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Start timeout as a `Duration`
    #[inline]
    #[must_use]
    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    /// Load deadline as a `Duration`
    #[inline]
    #[must_use]
    pub fn load_deadline(&self) -> Duration {
        Duration::from_millis(self.load_deadline_ms)
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&raw)
    }

    /// Reject values the scheduler cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.start_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "start_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.notice_capacity == 0 {
            return Err(ConfigError::Invalid(
                "notice_capacity must be greater than zero".to_string(),
            ));
        }
        if self.flag_prefix.is_empty() {
            return Err(ConfigError::Invalid("flag_prefix must not be empty".to_string()));
        }
        Ok(())
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 4_000,
            start_timeout_ms: 30_000,
            load_deadline_ms: 10_000,
            default_busy_message: DEFAULT_BUSY_MESSAGE.to_string(),
            flag_prefix: DEFAULT_FLAG_PREFIX.to_string(),
            notice_capacity: 64,
            logging: LoggingConfig::default(),
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
