//! Configuration management for the Horizon host.
//!
//! This module handles loading and validation of host configuration from TOML
//! files. The `[scheduler]` and `[lifecycle]` sections are passed straight to
//! the toolkit.

use horizon_toolkit::{LifecycleConfig, SchedulerConfig, ToolkitConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Default tick interval for serde deserialization
fn default_tick_interval() -> u64 {
    50 // 20 ticks per second
}

fn default_server_name() -> String {
    "horizon".to_string()
}

fn default_enabled_plugins() -> Vec<String> {
    vec!["greeter".to_string()]
}

fn default_announce_interval_secs() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Application configuration loaded from TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Main loop settings
    #[serde(default)]
    pub server: ServerSettings,
    /// Worker pool and tick rate
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Plugin registry housekeeping
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    /// Plugin configuration settings
    #[serde(default)]
    pub plugins: PluginSettings,
    /// Logging configuration settings
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Main loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Name shown in logs
    #[serde(default = "default_server_name")]
    pub name: String,
    /// Server tick interval in milliseconds; must match `scheduler.ticks_per_second`
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
}

/// Built-in plugins to enable at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginSettings {
    /// Plugin names, enabled in this order
    #[serde(default = "default_enabled_plugins")]
    pub enabled: Vec<String>,
    /// How often the greeter announces its tally
    #[serde(default = "default_announce_interval_secs")]
    pub announce_interval_secs: u64,
}

/// Logging system configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Whether to output logs in JSON format
    #[serde(default)]
    pub json_format: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            name: default_server_name(),
            tick_interval_ms: default_tick_interval(),
        }
    }
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self {
            enabled: default_enabled_plugins(),
            announce_interval_secs: default_announce_interval_secs(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, creates a default configuration file at the
    /// specified path and returns the default configuration.
    pub async fn load_from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let config: AppConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content).await?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// The toolkit's share of the configuration.
    pub fn toolkit_config(&self) -> ToolkitConfig {
        ToolkitConfig {
            scheduler: self.scheduler.clone(),
            lifecycle: self.lifecycle.clone(),
        }
    }

    /// Applies a new tick rate to both the main loop and the scheduler.
    pub fn set_ticks_per_second(&mut self, ticks_per_second: u32) {
        self.scheduler.ticks_per_second = ticks_per_second;
        self.server.tick_interval_ms = 1000 / u64::from(ticks_per_second.max(1));
    }

    /// Validates the configuration for consistency and correctness.
    pub fn validate(&self) -> Result<(), String> {
        if self.server.tick_interval_ms == 0 {
            return Err("server.tick_interval_ms must be greater than 0".to_string());
        }

        self.toolkit_config()
            .validate()
            .map_err(|e| format!("Invalid toolkit configuration: {e}"))?;

        let scheduler_tick_ms = self.scheduler.tick_rate().tick_duration().as_millis() as u64;
        if scheduler_tick_ms != self.server.tick_interval_ms {
            return Err(format!(
                "server.tick_interval_ms ({}) does not match scheduler.ticks_per_second ({} -> {}ms)",
                self.server.tick_interval_ms, self.scheduler.ticks_per_second, scheduler_tick_ms
            ));
        }

        if self.plugins.announce_interval_secs == 0 {
            return Err("plugins.announce_interval_secs must be greater than 0".to_string());
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                &self.logging.level
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_app_config_default() {
        let config = AppConfig::default();
        assert_eq!(config.server.tick_interval_ms, 50);
        assert_eq!(config.scheduler.ticks_per_second, 20);
        assert_eq!(config.plugins.enabled, vec!["greeter".to_string()]);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_load_from_nonexistent_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let config = AppConfig::load_from_file(&path).await.unwrap();

        assert_eq!(config.server.tick_interval_ms, 50);
        assert!(path.exists());

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("[scheduler]"));
        assert!(written.contains("[lifecycle]"));
    }

    #[tokio::test]
    async fn test_load_from_existing_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[server]
name = "test-host"
tick_interval_ms = 10

[scheduler]
ticks_per_second = 100
worker_threads = 2

[plugins]
enabled = []

[logging]
level = "debug"
json_format = true
"#
        )
        .unwrap();

        let config = AppConfig::load_from_file(file.path()).await.unwrap();

        assert_eq!(config.server.name, "test-host");
        assert_eq!(config.scheduler.ticks_per_second, 100);
        assert_eq!(config.scheduler.worker_threads, 2);
        assert_eq!(config.scheduler.worker_thread_name, "horizon-worker");
        assert_eq!(config.lifecycle.cleanup_interval_secs, 30);
        assert!(config.plugins.enabled.is_empty());
        assert!(config.logging.json_format);
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_load_rejects_malformed_toml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[server\ntick_interval_ms = ").unwrap();
        assert!(AppConfig::load_from_file(file.path()).await.is_err());
    }

    #[test]
    fn test_validation_tick_mismatch() {
        let mut config = AppConfig::default();
        config.server.tick_interval_ms = 16;
        assert!(config.validate().unwrap_err().contains("does not match"));

        config.set_ticks_per_second(100);
        assert_eq!(config.server.tick_interval_ms, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_invalid_values() {
        let mut config = AppConfig::default();
        config.server.tick_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.scheduler.worker_threads = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.plugins.announce_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serde_deserialization_with_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.tick_interval_ms, default_tick_interval());
        assert_eq!(config.plugins.announce_interval_secs, 60);

        let round_trip: AppConfig = toml::from_str(&toml::to_string_pretty(&config).unwrap()).unwrap();
        assert_eq!(round_trip.server.name, config.server.name);
    }
}
