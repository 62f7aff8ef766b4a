//! # Relay Event System
//!
//! Typed publish/subscribe event dispatch for the Relay module host.
//!
//! ## Core Features
//!
//! - **Type Safety**: events are serde structs with a stable wire name,
//!   decoded back into their concrete type before a listener runs
//! - **Async/Await Support**: built on Tokio; publishing schedules one task
//!   per listener and never blocks the publisher
//! - **Error Isolation**: a failing listener is logged and converted into an
//!   [`ErrorEvent`] whose own dispatch can never recurse
//! - **Registry**: a process-wide name → variant table so event names that
//!   arrive over the RPC bridge resolve back into dispatchable variants
//!
//! ## Quick Start Example
//!
//! ```rust,no_run
//! use relay_event_system::{Event, EventBus, EventError};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct TickEvent {
//!     count: u64,
//! }
//!
//! impl Event for TickEvent {
//!     const NAME: &'static str = "tick";
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), EventError> {
//!     let bus = EventBus::new();
//!     bus.register(|event: TickEvent| {
//!         println!("tick {}", event.count);
//!         Ok(())
//!     });
//!     bus.publish(&TickEvent { count: 1 })?;
//!     Ok(())
//! }
//! ```

// Core modules
pub mod bus;
pub mod events;
pub mod listener;
pub mod registry;

// Re-export commonly used items for convenience
pub use bus::{BusStats, EventBus, ListenerId};
pub use events::{
    ErrorEvent, Event, EventError, ModuleLoadEvent, ModuleRecord, ModuleReloadEvent,
    ModuleUnloadEvent, ReadyEvent, RemoteAddr,
};
pub use listener::{AsyncTypedListener, EventListener, TypedListener};
pub use registry::{register_event, registered_event_names, resolve, EventDescriptor};

// External dependencies that modules commonly need
pub use async_trait::async_trait;
pub use serde::{Deserialize, Serialize};
pub use std::sync::Arc;
