//! Module capability and the context handed to modules during their
//! lifecycle.
//!
//! A module is any unit the manager can load: a dylib built against this
//! crate, a statically registered type, or a proxy for code running in
//! another process. The contract is small: `setup` once after construction,
//! `teardown` once before removal, and a [`ModuleRecord`] describing the
//! instance for lifecycle events.
//!
//! Listener bookkeeping is the context's job, not the module's: everything
//! registered through [`ModuleContext`] is recorded in a [`ListenerSet`]
//! and revoked by the manager after teardown, so a module that forgets to
//! remove a listener does not leak it.

use crate::error::ModuleError;
use crate::manager::ManagerHandle;
use async_trait::async_trait;
use compact_str::CompactString;
use relay_event_system::{Event, EventBus, EventError, EventListener, ListenerId, ModuleRecord};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Bumped whenever the `Module` trait or its FFI surface changes shape.
/// Dylib modules report the version they were built against and the loader
/// refuses anything that does not match.
pub const MODULE_ABI_VERSION: u32 = 1;

/// A loadable unit of behavior.
#[async_trait]
pub trait Module: Send + Sync {
    /// Logical name, unique among loaded modules.
    fn name(&self) -> &str;

    /// Called exactly once after construction, before the instance becomes
    /// visible in the manager's registry. Failure discards the instance.
    async fn setup(&mut self, ctx: &ModuleContext) -> Result<(), ModuleError>;

    /// Called exactly once before removal from the registry. Listener
    /// revocation happens afterwards regardless of the outcome, so the
    /// default body has nothing to do.
    async fn teardown(&mut self, _ctx: &ModuleContext) -> Result<(), ModuleError> {
        Ok(())
    }

    /// Identity snapshot carried by lifecycle events.
    fn record(&self) -> ModuleRecord {
        ModuleRecord::local(self.name())
    }
}

/// Default module name for a type: the lowercased final segment of its type
/// path, generics stripped.
pub fn default_module_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_lowercase()
}

/// Tracks every listener a module registered so the manager can revoke them
/// all after teardown.
#[derive(Debug, Clone, Default)]
pub struct ListenerSet {
    entries: Arc<Mutex<Vec<(CompactString, ListenerId)>>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, Vec<(CompactString, ListenerId)>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record(&self, event_name: &str, id: ListenerId) {
        self.entries().push((CompactString::new(event_name), id));
    }

    /// Forgets the first matching record. Returns whether one existed.
    pub fn forget(&self, event_name: &str, id: ListenerId) -> bool {
        let mut entries = self.entries();
        if let Some(position) = entries
            .iter()
            .position(|(name, entry_id)| *name == event_name && *entry_id == id)
        {
            entries.remove(position);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Unregisters every recorded listener from `bus` and clears the set.
    /// Returns how many were actually removed from the bus.
    pub fn revoke_all(&self, bus: &EventBus) -> usize {
        let drained: Vec<(CompactString, ListenerId)> = std::mem::take(&mut *self.entries());
        let mut revoked = 0;
        for (event_name, id) in drained {
            if bus.unregister(&event_name, id) {
                revoked += 1;
            }
        }
        revoked
    }
}

/// Handle a module uses to reach the host during setup and teardown.
///
/// Clones share the same listener set, so listeners registered from spawned
/// tasks are still revoked with the module.
#[derive(Clone)]
pub struct ModuleContext {
    bus: EventBus,
    module_name: CompactString,
    listeners: ListenerSet,
    manager: ManagerHandle,
}

impl std::fmt::Debug for ModuleContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleContext")
            .field("module_name", &self.module_name)
            .field("tracked_listeners", &self.listeners.len())
            .finish()
    }
}

impl ModuleContext {
    pub(crate) fn new(
        bus: EventBus,
        module_name: impl Into<CompactString>,
        manager: ManagerHandle,
    ) -> Self {
        Self {
            bus,
            module_name: module_name.into(),
            listeners: ListenerSet::new(),
            manager,
        }
    }

    /// The host's event bus, for publishing.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// The logical name this module is registered under.
    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    /// Weak handle to the owning manager.
    pub fn manager(&self) -> ManagerHandle {
        self.manager.clone()
    }

    /// Registers a sync listener for `T` and records it for revocation.
    pub fn add_listener<T, F>(&self, handler: F) -> ListenerId
    where
        T: Event,
        F: Fn(T) -> Result<(), EventError> + Send + Sync + 'static,
    {
        let id = self.bus.register::<T, F>(handler);
        self.listeners.record(T::NAME, id);
        id
    }

    /// Registers an async listener for `T` and records it for revocation.
    pub fn add_async_listener<T, F, Fut>(&self, handler: F) -> ListenerId
    where
        T: Event,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), EventError>> + Send + 'static,
    {
        let id = self.bus.register_async::<T, F, Fut>(handler);
        self.listeners.record(T::NAME, id);
        id
    }

    /// Registers a pre-built listener under an explicit event name.
    pub fn add_raw_listener(&self, event_name: &str, listener: Arc<dyn EventListener>) -> ListenerId {
        let id = self.bus.register_raw(event_name, listener);
        self.listeners.record(event_name, id);
        id
    }

    /// Unregisters one listener and forgets its record.
    pub fn remove_listener(&self, event_name: &str, id: ListenerId) -> bool {
        self.listeners.forget(event_name, id);
        self.bus.unregister(event_name, id)
    }

    /// Revokes everything this module still has registered.
    pub(crate) fn revoke_all(&self) -> usize {
        let revoked = self.listeners.revoke_all(&self.bus);
        if revoked > 0 {
            debug!(
                "♻️ Revoked {} listeners of module '{}'",
                revoked, self.module_name
            );
        }
        revoked
    }
}

/// Generates the FFI exports a dylib module needs.
///
/// The wrapped type must provide `fn new() -> Self`. This emits
/// `relay_module_abi_version()` and `relay_create_module()`, the two
/// symbols the loader looks for.
///
/// # Example
///
/// ```rust,ignore
/// pub struct EchoModule { /* ... */ }
///
/// impl EchoModule {
///     fn new() -> Self { /* ... */ }
/// }
///
/// #[async_trait]
/// impl Module for EchoModule { /* ... */ }
///
/// export_module!(EchoModule);
/// ```
#[macro_export]
macro_rules! export_module {
    ($module_type:ty) => {
        /// ABI version this module was built against.
        #[no_mangle]
        pub extern "C" fn relay_module_abi_version() -> u32 {
            $crate::MODULE_ABI_VERSION
        }

        /// Constructs the module instance. Returns null if construction
        /// panics; panics must not cross the FFI boundary.
        #[no_mangle]
        pub extern "C" fn relay_create_module() -> *mut dyn $crate::Module {
            match std::panic::catch_unwind(|| {
                let module: Box<dyn $crate::Module> = Box::new(<$module_type>::new());
                Box::into_raw(module)
            }) {
                Ok(raw) => raw,
                Err(_) => std::ptr::null_mut::<$module_type>() as *mut dyn $crate::Module,
            }
        }
    };
}

// ============================================================================
// Tests
// ============================================================================
