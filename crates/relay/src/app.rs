//! Main application logic and lifecycle management.
//!
//! This module contains the core `Application` struct that orchestrates
//! host startup, the initial module load, and graceful shutdown.

use crate::api::ApiRegistry;
use crate::cli::CliArgs;
use crate::commands::{ApiCallCommand, LoadModuleCommand};
use crate::config::AppConfig;
use crate::logging::display_banner;
use crate::signals;
use module_system::{DylibModuleSource, ModuleManager};
use relay_event_system::{EventBus, ReadyEvent};
use relay_rpc::RpcServer;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Main application struct.
///
/// The `Application` manages the complete lifecycle of the relay host:
/// configuration loading, module manager and RPC server construction, the
/// initial load sweep, and graceful shutdown handling.
pub struct Application {
    /// Loaded application configuration
    config: AppConfig,
    /// Event bus shared by every module
    bus: EventBus,
    /// Module lifecycle manager
    manager: ModuleManager,
    /// RPC server, consumed by [`run`](Self::run)
    server: Option<RpcServer>,
    /// Allow-list backing the `api_call` command
    api: Arc<ApiRegistry>,
}

impl Application {
    /// Creates a new application instance.
    ///
    /// Loads configuration, applies CLI overrides, validates settings, and
    /// wires up the event bus, module manager, and RPC command table.
    ///
    /// # Process
    ///
    /// 1. Load configuration from file (creating default if missing)
    /// 2. Apply command-line argument overrides
    /// 3. Validate merged configuration
    /// 4. Display startup banner
    /// 5. Build the bus, module source, manager, and RPC server
    pub async fn new(args: CliArgs) -> Result<Self, Box<dyn std::error::Error>> {
        info!(
            "🔧 Loading configuration from: {}",
            args.config_path.display()
        );
        let mut config = AppConfig::load_from_file(&args.config_path).await?;

        // Apply CLI overrides
        if let Some(module_dir) = args.module_dir {
            config.modules.directory = module_dir.to_string_lossy().to_string();
        }

        if let Some(bind_address) = args.bind_address {
            config.server.bind_address = bind_address;
        }

        if let Some(log_level) = args.log_level {
            config.logging.level = log_level;
        }

        if args.json_logs {
            config.logging.json_format = true;
        }

        // Validate configuration
        if let Err(e) = config.validate() {
            return Err(format!("Configuration validation failed: {e}").into());
        }
        info!("✅ Configuration loaded and validated successfully");

        display_banner();

        let bus = EventBus::new();
        let source = Arc::new(DylibModuleSource::new(&config.modules.directory));
        let manager = ModuleManager::new(bus.clone(), source, config.remote_table());
        let api = Arc::new(ApiRegistry::new());

        let server = RpcServer::new();
        server.register(
            "load_module",
            Arc::new(LoadModuleCommand::new(manager.clone())),
        );
        server.register("api_call", Arc::new(ApiCallCommand::new(api.clone())));

        info!("🚀 Relay Module Host v{}", env!("CARGO_PKG_VERSION"));
        info!(
            "📂 Config: {} | Modules: {} | Known remotes: {}",
            args.config_path.display(),
            config.modules.directory,
            config.modules.remote.len()
        );

        Ok(Self {
            config,
            bus,
            manager,
            server: Some(server),
            api,
        })
    }

    /// The allow-list backing `api_call`.
    ///
    /// Embedders register their methods here before calling
    /// [`run`](Self::run).
    pub fn api(&self) -> &Arc<ApiRegistry> {
        &self.api
    }

    /// The event bus shared by every module.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// The module lifecycle manager.
    pub fn manager(&self) -> &ModuleManager {
        &self.manager
    }

    /// Runs the application until a shutdown signal arrives.
    ///
    /// Binds and serves the RPC endpoint, performs the initial load of every
    /// known module, publishes [`ReadyEvent`], then waits for a termination
    /// signal before unloading everything within the configured grace period.
    pub async fn run(mut self) -> Result<(), Box<dyn std::error::Error>> {
        info!("🌟 Starting Relay Module Host");

        let mut server = self.server.take().ok_or("Application::run called twice")?;
        let bound = server.bind(&self.config.server.bind_address).await?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
        let server_handle = tokio::spawn(server.serve(shutdown_rx));

        self.bus.register::<ReadyEvent, _>(|_| {
            info!("Ready.");
            Ok(())
        });

        // Initial sweep over everything the source and remote table know.
        match self.manager.load(&[]).await {
            Ok(count) => info!("🎉 Initial load complete: {} module(s)", count),
            Err(e) => {
                error!("❌ Initial module load failed: {}", e);
                let _ = shutdown_tx.send(());
                return Err(format!("Initial module load failed: {e}").into());
            }
        }

        self.bus.publish(&ReadyEvent {})?;

        info!("✅ Relay is now running!");
        info!("🔌 Accepting RPC connections on {}", bound);
        info!("🛑 Press Ctrl+C to gracefully shutdown");

        signals::wait_for_shutdown().await?;

        info!("🛑 Shutdown signal received, beginning graceful shutdown...");

        // Stop accepting new connections first, then tear modules down.
        let _ = shutdown_tx.send(());

        let grace = Duration::from_secs(self.config.server.shutdown_grace_seconds);
        let unloaded = self.manager.shutdown(grace).await;
        info!("📤 {} module(s) unloaded", unloaded);

        match tokio::time::timeout(Duration::from_secs(2), server_handle).await {
            Ok(Ok(Ok(()))) => info!("✅ RPC server stopped"),
            Ok(Ok(Err(e))) => warn!("❌ RPC server exited with error: {}", e),
            Ok(Err(e)) => warn!("❌ RPC server task failed: {}", e),
            Err(_) => warn!("⏱️ RPC server did not stop within timeout"),
        }

        let stats = self.bus.stats();
        info!("📊 Final Statistics:");
        info!("  - Events published: {}", stats.events_published);
        info!("  - Listener invocations: {}", stats.listeners_invoked);
        info!("  - Listener failures: {}", stats.listener_failures);

        info!("✅ Relay shutdown complete");
        info!("👋 Goodbye!");

        Ok(())
    }
}
