use std::num::NonZeroUsize;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_TASK_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_MAX_QUEUE_LENGTH: usize = 1024;
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 250;

/// Number of parallel hardware lanes, falling back to a single unit when the
/// platform can't tell.
pub fn default_max_units() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

/// Pool configuration. Every field has a default, so a partial config (or
/// none at all) is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "clap", derive(clap::Args))]
#[serde(default)]
pub struct PoolConfig {
    /// Upper bound on concurrently live execution units
    #[cfg_attr(feature = "clap", arg(long, default_value_t = default_max_units()))]
    pub max_units: usize,

    /// Idle time after which a unit is reclaimed
    #[cfg_attr(feature = "clap", arg(long, default_value_t = DEFAULT_IDLE_TIMEOUT_MS))]
    pub idle_timeout_ms: u64,

    /// Execution time after which a task fails and its unit is replaced
    #[cfg_attr(feature = "clap", arg(long, default_value_t = DEFAULT_TASK_TIMEOUT_MS))]
    pub task_timeout_ms: u64,

    /// Tasks allowed to wait for a unit before submissions are rejected
    #[cfg_attr(feature = "clap", arg(long, default_value_t = DEFAULT_MAX_QUEUE_LENGTH))]
    pub max_queue_length: usize,

    /// Period of the idle/timeout sweep
    #[cfg_attr(feature = "clap", arg(long, default_value_t = DEFAULT_SWEEP_INTERVAL_MS))]
    pub sweep_interval_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_units: default_max_units(),
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            task_timeout_ms: DEFAULT_TASK_TIMEOUT_MS,
            max_queue_length: DEFAULT_MAX_QUEUE_LENGTH,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
        }
    }
}

impl PoolConfig {
    pub fn with_max_units(mut self, max_units: usize) -> Self {
        self.max_units = max_units;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_queue_length(mut self, max_queue_length: usize) -> Self {
        self.max_queue_length = max_queue_length;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_units == 0 {
            return Err(Error::InvalidConfig("max_units must be at least 1"));
        }
        if self.idle_timeout_ms == 0 {
            return Err(Error::InvalidConfig("idle_timeout_ms must be positive"));
        }
        if self.task_timeout_ms == 0 {
            return Err(Error::InvalidConfig("task_timeout_ms must be positive"));
        }
        // tokio's interval panics on a zero period
        if self.sweep_interval_ms == 0 {
            return Err(Error::InvalidConfig("sweep_interval_ms must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PoolConfig::default();
        assert!(config.max_units >= 1);
        assert_eq!(config.idle_timeout(), Duration::from_secs(30));
        assert_eq!(config.task_timeout(), Duration::from_secs(60));
        assert_eq!(config.max_queue_length, DEFAULT_MAX_QUEUE_LENGTH);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_config_from_json() -> anyhow::Result<()> {
        let config: PoolConfig = serde_json::from_str(r#"{"max_units": 2, "task_timeout_ms": 500}"#)?;
        assert_eq!(config.max_units, 2);
        assert_eq!(config.task_timeout(), Duration::from_millis(500));
        assert_eq!(config.idle_timeout_ms, DEFAULT_IDLE_TIMEOUT_MS);
        Ok(())
    }

    #[test]
    fn test_validate_rejects_zeroes() {
        let config = PoolConfig::default().with_max_units(0);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let config = PoolConfig::default().with_sweep_interval(Duration::ZERO);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        // an empty queue is allowed: tasks then only run if a unit is free
        let config = PoolConfig::default().with_max_queue_length(0);
        assert!(config.validate().is_ok());
    }
}
