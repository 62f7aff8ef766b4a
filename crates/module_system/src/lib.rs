//! Module system for loading and managing relay modules.
//!
//! This crate provides the host-side infrastructure for module lifecycles:
//! discovery and dynamic loading of dylib modules, static registration for
//! embedders, remote modules bridged over RPC, and the manager that ties
//! load/unload/reload together with per-name serialization, a code cache,
//! and rollback on failed reloads.

mod error;
mod manager;
mod module;
mod remote;
mod source;

pub use error::{ModuleError, ModuleSystemError};
pub use manager::{ManagerHandle, ModuleManager, ModuleRequest};
pub use module::{default_module_name, ListenerSet, Module, ModuleContext, MODULE_ABI_VERSION};
pub use remote::RemoteModule;
pub use source::{DylibModuleSource, LoadedUnit, ModuleFactory, ModuleSource, StaticModuleSource};

/// Re-export commonly used types for module development
pub use relay_event_system::{Event, EventBus, EventError, ListenerId, ModuleRecord, RemoteAddr};
pub use libloading::Library;
