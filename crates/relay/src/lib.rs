//! # Relay Module Host - Main Entry Point
//!
//! Module host with hot-swappable local and remote modules, type-safe event
//! dispatch, and a WebSocket RPC bridge. This entry point handles CLI parsing,
//! configuration loading, and application lifecycle management.
//!
//! ## Quick Start
//!
//! ```bash
//! # Run with default configuration
//! relay
//!
//! # Specify custom configuration
//! relay --config production.toml
//!
//! # Override specific settings
//! relay --bind 0.0.0.0:9005 --modules /opt/relay/modules --log-level debug
//!
//! # JSON logging for production
//! relay --json-logs
//! ```
//!
//! ## Configuration
//!
//! The host loads configuration from a TOML file (default: `config.toml`).
//! If the file doesn't exist, a default configuration will be created.
//!
//! ## Signal Handling
//!
//! The host handles graceful shutdown on:
//! - SIGINT (Ctrl+C)
//! - SIGTERM (Unix systems)

use tracing::error;

mod api;
mod app;
mod cli;
mod commands;
mod config;
mod logging;
mod signals;

use cli::CliArgs;

/// Main entry point for the relay host.
///
/// Handles the complete application lifecycle including:
/// 1. Command-line argument parsing
/// 2. Configuration loading and validation
/// 3. Logging system initialization
/// 4. Application creation and execution
/// 5. Error handling and cleanup
///
/// # Exit Codes
///
/// * **0**: Successful execution and shutdown
/// * **1**: Error during startup, configuration, or runtime
///
/// Note: This function is called from an async context (main with
/// #[tokio::main]), so it should NOT have #[tokio::main] itself.
pub async fn init() -> Result<(), Box<dyn std::error::Error>> {
    // Parse CLI arguments first
    let args = CliArgs::parse();

    // Load configuration to get logging settings
    let config = AppConfig::load_from_file(&args.config_path)
        .await
        .unwrap_or_default();

    // Setup logging before anything else
    if let Err(e) = logging::setup_logging(&config.logging, args.json_logs) {
        eprintln!("❌ Failed to setup logging: {e}");
        std::process::exit(1);
    }

    // Create and run application
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

// Re-export main types for embedders that wire up their own API methods
pub use api::{ApiMethod, ApiRegistry};
pub use app::Application;
pub use config::{
    AppConfig, LoggingSettings, ModuleSettings, RemoteEndpoint, ServerSettings,
};

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn default_config_validates() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.bind_address, "127.0.0.1:9005");
        assert_eq!(config.modules.directory, "modules");
        assert_eq!(config.logging.level, "info");
    }

    #[tokio::test]
    async fn config_validation_rejects_bad_settings() {
        let mut config = AppConfig::default();

        // Invalid bind address
        config.server.bind_address = "invalid".to_string();
        assert!(config.validate().is_err());

        // Empty module directory
        config.server.bind_address = "127.0.0.1:9005".to_string();
        config.modules.directory = String::new();
        assert!(config.validate().is_err());

        // Invalid log level
        config.modules.directory = "modules".to_string();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        // Remote endpoint with port 0
        config.logging.level = "info".to_string();
        config.modules.remote.insert(
            "peer".to_string(),
            RemoteEndpoint {
                host: "127.0.0.1".to_string(),
                port: 0,
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn remote_table_maps_names_to_addresses() {
        let mut config = AppConfig::default();
        config.modules.remote.insert(
            "weather".to_string(),
            RemoteEndpoint {
                host: "10.0.0.7".to_string(),
                port: 9100,
            },
        );

        let table = config.remote_table();
        assert_eq!(table.len(), 1);
        let addr = table.get("weather").unwrap();
        assert_eq!(addr.host, "10.0.0.7");
        assert_eq!(addr.port, 9100);
    }

    #[test]
    fn cli_args_carry_overrides() {
        let args = CliArgs {
            config_path: PathBuf::from("test.toml"),
            module_dir: Some(PathBuf::from("test_modules")),
            bind_address: Some("127.0.0.1:9000".to_string()),
            log_level: Some("debug".to_string()),
            json_logs: true,
        };

        assert_eq!(args.config_path, PathBuf::from("test.toml"));
        assert_eq!(args.module_dir, Some(PathBuf::from("test_modules")));
        assert_eq!(args.bind_address, Some("127.0.0.1:9000".to_string()));
        assert_eq!(args.log_level, Some("debug".to_string()));
        assert!(args.json_logs);
    }

    #[tokio::test]
    async fn application_new_applies_cli_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let args = CliArgs {
            config_path: dir.path().join("config.toml"),
            module_dir: Some(dir.path().join("mods")),
            bind_address: Some("127.0.0.1:0".to_string()),
            log_level: None,
            json_logs: false,
        };

        let app = Application::new(args.clone()).await.unwrap();

        // A default config file was written next to the overrides.
        assert!(args.config_path.exists());
        assert_eq!(app.manager().module_count(), 0);
        assert_eq!(app.api().names(), vec!["describe".to_string()]);
    }
}
