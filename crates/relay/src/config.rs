//! Configuration management for the relay host.
//!
//! Handles loading, validation, and defaulting of host configuration from
//! TOML files and command-line overrides.

use compact_str::CompactString;
use relay_event_system::RemoteAddr;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::info;

fn default_bind_address() -> String {
    "127.0.0.1:9005".to_string()
}

fn default_shutdown_grace() -> u64 {
    5
}

fn default_module_directory() -> String {
    "modules".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Application configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// RPC server settings
    #[serde(default)]
    pub server: ServerSettings,
    /// Module discovery settings
    #[serde(default)]
    pub modules: ModuleSettings,
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Network settings for the host's RPC endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Address the RPC server binds to (e.g. "127.0.0.1:9005")
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Grace period in seconds for module teardown during shutdown
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,
}

/// Where module code comes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleSettings {
    /// Directory scanned for dylib modules
    #[serde(default = "default_module_directory")]
    pub directory: String,
    /// Statically known remote modules: logical name → endpoint
    #[serde(default)]
    pub remote: HashMap<String, RemoteEndpoint>,
}

/// Endpoint of a remote module peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteEndpoint {
    pub host: String,
    pub port: u16,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Whether to emit JSON-formatted logs
    #[serde(default)]
    pub json_format: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            shutdown_grace_seconds: default_shutdown_grace(),
        }
    }
}

impl Default for ModuleSettings {
    fn default() -> Self {
        Self {
            directory: default_module_directory(),
            remote: HashMap::new(),
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

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            modules: ModuleSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl AppConfig {
    /// Loads configuration from `path`, writing a default file there first
    /// when none exists.
    pub async fn load_from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
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

    /// Validates the merged configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self
            .server
            .bind_address
            .parse::<std::net::SocketAddr>()
            .is_err()
        {
            return Err(format!(
                "Invalid bind address: {}",
                &self.server.bind_address
            ));
        }

        if self.server.shutdown_grace_seconds == 0 {
            return Err("server.shutdown_grace_seconds must be greater than 0".to_string());
        }

        if self.modules.directory.is_empty() {
            return Err("Module directory cannot be empty".to_string());
        }

        for (name, endpoint) in &self.modules.remote {
            if name.is_empty() {
                return Err("Remote module names cannot be empty".to_string());
            }
            if endpoint.host.is_empty() {
                return Err(format!("Remote module '{name}' has an empty host"));
            }
            if endpoint.port == 0 {
                return Err(format!("Remote module '{name}' has port 0"));
            }
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

    /// The name → address table the module manager consumes.
    pub fn remote_table(&self) -> HashMap<CompactString, RemoteAddr> {
        self.modules
            .remote
            .iter()
            .map(|(name, endpoint)| {
                (
                    CompactString::new(name),
                    RemoteAddr::new(endpoint.host.clone(), endpoint.port),
                )
            })
            .collect()
    }
}
