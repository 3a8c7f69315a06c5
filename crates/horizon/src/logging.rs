//! Logging system setup and configuration.
//!
//! This module handles the initialization of the tracing-based logging system
//! with support for both human-readable and JSON output formats.

use crate::config::LoggingSettings;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initializes the logging system with the specified configuration.
///
/// Respects `RUST_LOG` when set; otherwise filters at `config.level`. Thread
/// names are always included so sync-context output (`horizon-main`) can be
/// told apart from worker output.
pub fn setup_logging(
    config: &LoggingSettings,
    json_format: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let log_level = config.level.as_str();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if json_format || config.json_format {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_file(false)
                    .with_line_number(false)
                    .with_thread_ids(true)
                    .with_thread_names(true),
            )
            .try_init()?;
    } else {
        registry
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_file(false)
                    .with_line_number(false)
                    .with_thread_ids(true)
                    .with_thread_names(true),
            )
            .try_init()?;
    }

    info!("🔧 Logging initialized with level: {}", log_level);
    Ok(())
}

/// Displays the startup banner through the logger.
pub fn display_banner() {
    let version = option_env!("CARGO_PKG_VERSION").unwrap_or("UNK");
    info!("╔══════════════════════════════════════════╗");
    info!("║            🌟 HORIZON HOST 🌟            ║");
    info!("║              Toolkit v{:<10}         ║", version);
    info!("║                                          ║");
    info!("║  ⏱️  Tick-driven main thread              ║");
    info!("║  ⚡ Worker pool for async work           ║");
    info!("║  🤝 Promises across both contexts        ║");
    info!("║  🔌 Scoped plugin lifecycles             ║");
    info!("║                                          ║");
    info!("╚══════════════════════════════════════════╝");
}
