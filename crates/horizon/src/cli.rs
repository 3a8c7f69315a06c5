//! Command-line interface handling for the Horizon host.
//!
//! This module provides command-line argument parsing using the `clap` crate.
//! Every option overrides the matching configuration file setting.

use clap::{value_parser, Arg, ArgMatches, Command};
use std::ffi::OsString;
use std::path::PathBuf;

/// Command line arguments parsed from user input.
#[derive(Debug, Clone)]
pub struct CliArgs {
    /// Path to the configuration file
    pub config_path: PathBuf,
    /// Optional override for log level
    pub log_level: Option<String>,
    /// Whether to force JSON log output
    pub json_logs: bool,
    /// Optional override for the tick rate
    pub ticks_per_second: Option<u32>,
    /// Optional override for the async worker count
    pub worker_threads: Option<usize>,
}

impl Default for CliArgs {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("config.toml"),
            log_level: None,
            json_logs: false,
            ticks_per_second: None,
            worker_threads: None,
        }
    }
}

fn command() -> Command {
    Command::new("Horizon")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Horizon Team <team@horizon.dev>")
        .about("Tick-based plugin host with sync/async scheduling")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("config.toml"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)"),
        )
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .help("Output logs in JSON format")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("tps")
                .short('t')
                .long("tps")
                .value_name("TICKS")
                .help("Ticks per second for the main loop and scheduler")
                .value_parser(value_parser!(u32)),
        )
        .arg(
            Arg::new("workers")
                .short('w')
                .long("workers")
                .value_name("COUNT")
                .help("Async worker thread count")
                .value_parser(value_parser!(usize)),
        )
}

impl CliArgs {
    /// Parses the process arguments, exiting with clap's usage message on error.
    pub fn parse() -> Self {
        Self::from_matches(&command().get_matches())
    }

    /// Parses an explicit argument list. The first item is the binary name.
    pub fn try_parse_from<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        command()
            .try_get_matches_from(args)
            .map(|matches| Self::from_matches(&matches))
    }

    fn from_matches(matches: &ArgMatches) -> Self {
        Self {
            config_path: matches
                .get_one::<String>("config")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("config.toml")),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
            ticks_per_second: matches.get_one::<u32>("tps").copied(),
            worker_threads: matches.get_one::<usize>("workers").copied(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = CliArgs::try_parse_from(["horizon"]).unwrap();
        assert_eq!(args.config_path, PathBuf::from("config.toml"));
        assert!(args.log_level.is_none());
        assert!(!args.json_logs);
        assert!(args.ticks_per_second.is_none());
        assert!(args.worker_threads.is_none());
    }

    #[test]
    fn test_overrides() {
        let args = CliArgs::try_parse_from([
            "horizon",
            "--config",
            "prod.toml",
            "-l",
            "debug",
            "--json-logs",
            "--tps",
            "40",
            "--workers",
            "3",
        ])
        .unwrap();

        assert_eq!(args.config_path, PathBuf::from("prod.toml"));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert!(args.json_logs);
        assert_eq!(args.ticks_per_second, Some(40));
        assert_eq!(args.worker_threads, Some(3));
    }

    #[test]
    fn test_rejects_non_numeric_tick_rate() {
        assert!(CliArgs::try_parse_from(["horizon", "--tps", "fast"]).is_err());
    }
}
