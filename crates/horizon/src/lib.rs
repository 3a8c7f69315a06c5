//! # Horizon Host - Main Entry Point
//!
//! Runs toolkit plugins on a fixed-rate main thread with a worker pool beside
//! it. This entry point handles CLI parsing, configuration loading and
//! application lifecycle management.
//!
//! ## Quick Start
//!
//! ```bash
//! # Run with default configuration
//! horizon
//!
//! # Specify custom configuration
//! horizon --config production.toml
//!
//! # Override specific settings
//! horizon --tps 40 --workers 8 --log-level debug
//!
//! # JSON logging for production
//! horizon --json-logs
//! ```
//!
//! ## Configuration
//!
//! The host loads configuration from a TOML file (default: `config.toml`).
//! If the file doesn't exist, a default configuration will be created.
//!
//! ## Signal Handling
//!
//! The host shuts down gracefully on SIGINT (Ctrl+C) and SIGTERM. A second
//! signal during shutdown exits immediately.

use tracing::error;

mod app;
mod cli;
mod config;
mod logging;
mod signals;

use app::Application;
use cli::CliArgs;
use config::AppConfig;

/// Main entry point for the Horizon host.
///
/// # Exit Codes
///
/// * **0**: Successful execution and shutdown
/// * **1**: Error during startup, configuration, or runtime
pub async fn init() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Logging settings come from the file before anything else is validated
    let mut config = AppConfig::load_from_file(&args.config_path)
        .await
        .unwrap_or_default();
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }

    if let Err(e) = logging::setup_logging(&config.logging, args.json_logs) {
        eprintln!("❌ Failed to setup logging: {e}");
        std::process::exit(1);
    }

    match Application::new(args).await {
        Ok(app) => {
            if let Err(e) = app.run().await {
                error!("❌ Application error: {:?}", e);
                std::process::exit(1);
            }
        }
        Err(e) => {
            error!("❌ Failed to start application: {e:?}");
            std::process::exit(1);
        }
    }

    Ok(())
}

pub use app::{MainLoop, ServerTickEvent};
pub use config::{LoggingSettings, PluginSettings, ServerSettings};
