//! Process-wide event type registry.
//!
//! Maps stable event names to variant descriptors so names that arrive over
//! the RPC bridge can be resolved back into dispatchable variants. The table
//! is seeded with the core lifecycle variants and lives for the process
//! lifetime.

use crate::events::{
    ErrorEvent, Event, EventError, ModuleLoadEvent, ModuleReloadEvent, ModuleUnloadEvent,
    ReadyEvent,
};
use compact_str::CompactString;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use tracing::debug;

/// Descriptor for one registered event variant.
#[derive(Debug, Clone, Copy)]
pub struct EventDescriptor {
    /// Stable wire name ([`Event::NAME`])
    pub name: &'static str,
    /// Rust type backing the variant, for logs
    pub type_name: &'static str,
    /// Typed validation: parses payload bytes as this variant
    pub decode: fn(&[u8]) -> Result<(), EventError>,
}

static REGISTRY: Lazy<DashMap<CompactString, EventDescriptor>> = Lazy::new(|| {
    let table = DashMap::new();
    seed::<ReadyEvent>(&table);
    seed::<ErrorEvent>(&table);
    seed::<ModuleLoadEvent>(&table);
    seed::<ModuleUnloadEvent>(&table);
    seed::<ModuleReloadEvent>(&table);
    table
});

fn seed<T: Event>(table: &DashMap<CompactString, EventDescriptor>) {
    table.insert(CompactString::new(T::NAME), descriptor::<T>());
}

fn descriptor<T: Event>() -> EventDescriptor {
    EventDescriptor {
        name: T::NAME,
        type_name: std::any::type_name::<T>(),
        decode: |data| T::decode(data).map(|_| ()),
    }
}

/// Registers an event variant under its [`Event::NAME`].
///
/// Registering the same name again replaces the previous descriptor, so
/// re-running module setup code is harmless.
pub fn register_event<T: Event>() {
    if let Some(old) = REGISTRY.insert(CompactString::new(T::NAME), descriptor::<T>()) {
        debug!(
            "♻️ Event '{}' re-registered ({} -> {})",
            T::NAME,
            old.type_name,
            std::any::type_name::<T>()
        );
    }
}

/// Looks up a variant descriptor by wire name.
pub fn resolve(name: &str) -> Option<EventDescriptor> {
    REGISTRY.get(name).map(|entry| *entry.value())
}

/// Names of every registered variant.
pub fn registered_event_names() -> Vec<CompactString> {
    REGISTRY.iter().map(|entry| entry.key().clone()).collect()
}
