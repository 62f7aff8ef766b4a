use async_trait::async_trait;
use module_system::{export_module, Module, ModuleContext, ModuleError};
use relay_event_system::{registry, ErrorEvent, Event, ModuleLoadEvent, ModuleUnloadEvent};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

// ============================================================================
// Sample Module: Echo
// ============================================================================

/// A simple module that narrates bus traffic.
///
/// Echoes every [`EchoEvent`] it sees and comments on lifecycle events, so a
/// freshly built host has something visible to load, reload, and unload.
pub struct EchoModule {
    /// Echoes observed since setup, shared with the listener closure
    seen: Arc<AtomicU64>,
}

impl EchoModule {
    pub fn new() -> Self {
        info!("🎉 EchoModule: Creating new instance");
        Self {
            seen: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl Default for EchoModule {
    fn default() -> Self {
        Self::new()
    }
}

/// Demonstration event other modules (or remote peers) can publish.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EchoEvent {
    pub text: String,
}

impl Event for EchoEvent {
    const NAME: &'static str = "echo";
}

#[async_trait]
impl Module for EchoModule {
    fn name(&self) -> &str {
        "echo"
    }

    async fn setup(&mut self, ctx: &ModuleContext) -> Result<(), ModuleError> {
        info!("📣 EchoModule: Registering event listeners...");

        // Make the variant resolvable by name for remote subscribers.
        registry::register_event::<EchoEvent>();

        let seen = self.seen.clone();
        ctx.add_listener::<EchoEvent, _>(move |event| {
            seen.fetch_add(1, Ordering::Relaxed);
            info!("📣 EchoModule: '{}'", event.text);
            Ok(())
        });

        ctx.add_listener::<ModuleLoadEvent, _>(|event| {
            info!("📣 EchoModule: welcome, {}!", event.module);
            Ok(())
        });

        ctx.add_listener::<ModuleUnloadEvent, _>(|event| {
            info!("📣 EchoModule: goodbye, {}.", event.module);
            Ok(())
        });

        ctx.add_listener::<ErrorEvent, _>(|event| {
            warn!("📣 EchoModule: a listener failed: {}", event.error);
            Ok(())
        });

        info!("📣 EchoModule: ✅ All listeners registered!");
        Ok(())
    }

    async fn teardown(&mut self, _ctx: &ModuleContext) -> Result<(), ModuleError> {
        info!(
            "📣 EchoModule: Shutting down after {} echo(s)",
            self.seen.load(Ordering::Relaxed)
        );
        Ok(())
    }
}

// Export the module through the C ABI the host scans for.
export_module!(EchoModule);
