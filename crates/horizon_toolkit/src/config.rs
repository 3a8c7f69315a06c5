//! Toolkit configuration.
//!
//! Plain serde structs so a host can embed them in its own config file; every
//! field has a default so partial sections deserialize cleanly.

use crate::error::ValidationError;
use crate::ticks::{TickRate, TICKS_PER_SECOND};
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_ticks_per_second() -> u32 {
    TICKS_PER_SECOND
}

fn default_worker_threads() -> usize {
    num_cpus::get().max(1)
}

fn default_worker_thread_name() -> String {
    "horizon-worker".to_string()
}

fn default_max_blocking_threads() -> usize {
    512
}

fn default_shutdown_timeout_ms() -> u64 {
    5000
}

fn default_cleanup_delay_secs() -> u64 {
    10
}

fn default_cleanup_interval_secs() -> u64 {
    30
}

/// Top-level toolkit configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolkitConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
}

impl ToolkitConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.scheduler.validate()?;
        self.lifecycle.validate()
    }
}

/// Scheduler and worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Logical ticks per wall-clock second
    #[serde(default = "default_ticks_per_second")]
    pub ticks_per_second: u32,
    /// Async worker threads (core pool of the runtime)
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    #[serde(default = "default_worker_thread_name")]
    pub worker_thread_name: String,
    /// Upper bound of the blocking pool that runs async-context jobs
    #[serde(default = "default_max_blocking_threads")]
    pub max_blocking_threads: usize,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            ticks_per_second: default_ticks_per_second(),
            worker_threads: default_worker_threads(),
            worker_thread_name: default_worker_thread_name(),
            max_blocking_threads: default_max_blocking_threads(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.ticks_per_second == 0 || self.ticks_per_second > 1000 {
            return Err(ValidationError::InvalidTickRate(self.ticks_per_second));
        }
        if self.worker_threads == 0 {
            return Err(ValidationError::InvalidConfig(
                "worker_threads must be at least 1".to_string(),
            ));
        }
        if self.max_blocking_threads == 0 {
            return Err(ValidationError::InvalidConfig(
                "max_blocking_threads must be at least 1".to_string(),
            ));
        }
        if self.worker_thread_name.trim().is_empty() {
            return Err(ValidationError::InvalidConfig(
                "worker_thread_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn tick_rate(&self) -> TickRate {
        TickRate::new(self.ticks_per_second)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Housekeeping for plugin-level registries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Delay before the first sweep of closed registry entries
    #[serde(default = "default_cleanup_delay_secs")]
    pub cleanup_delay_secs: u64,
    /// Interval between sweeps (0 disables the sweep)
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            cleanup_delay_secs: default_cleanup_delay_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

impl LifecycleConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.cleanup_interval_secs > 0 && self.cleanup_delay_secs > 86_400 {
            return Err(ValidationError::InvalidConfig(
                "cleanup_delay_secs must not exceed one day".to_string(),
            ));
        }
        Ok(())
    }

    pub fn cleanup_enabled(&self) -> bool {
        self.cleanup_interval_secs > 0
    }
}
