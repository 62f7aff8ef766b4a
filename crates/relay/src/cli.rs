//! Command-line interface handling for the relay host.
//!
//! This module provides command-line argument parsing using the `clap` crate,
//! producing overrides that are merged on top of the configuration file.

use clap::{Arg, Command};
use std::path::PathBuf;

/// Command line arguments parsed from user input.
///
/// Each optional field overrides the corresponding configuration file
/// setting when present.
#[derive(Debug, Clone)]
pub struct CliArgs {
    /// Path to the configuration file
    pub config_path: PathBuf,
    /// Optional override for the module directory
    pub module_dir: Option<PathBuf>,
    /// Optional override for the RPC bind address
    pub bind_address: Option<String>,
    /// Optional override for log level
    pub log_level: Option<String>,
    /// Whether to force JSON log output
    pub json_logs: bool,
}

impl CliArgs {
    /// Parses command line arguments using clap.
    ///
    /// # Panics
    ///
    /// This function will panic if required arguments are missing, though
    /// all arguments have sensible defaults defined in the clap configuration.
    pub fn parse() -> Self {
        let matches = Command::new("Relay Module Host")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Module host with hot-swappable local and remote modules")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Configuration file path")
                    .default_value("config.toml"),
            )
            .arg(
                Arg::new("modules")
                    .short('m')
                    .long("modules")
                    .value_name("DIR")
                    .help("Module directory path"),
            )
            .arg(
                Arg::new("bind")
                    .short('b')
                    .long("bind")
                    .value_name("ADDRESS")
                    .help("RPC bind address (e.g., 127.0.0.1:9005)"),
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
            .get_matches();

        Self {
            config_path: PathBuf::from(
                matches
                    .get_one::<String>("config")
                    .expect("Default config path should always be set"),
            ),
            module_dir: matches.get_one::<String>("modules").map(PathBuf::from),
            bind_address: matches.get_one::<String>("bind").cloned(),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
        }
    }
}
