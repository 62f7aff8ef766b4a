//! Module manager: load, unload, and reload modules by logical name.
//!
//! State per name is absent → loaded → absent. Operations on one name are
//! serialized behind a per-name mutex (a second operation queues behind the
//! first); operations on different names run concurrently. The manager owns
//! the code cache that makes reload pick up fresh code: unload purges every
//! cached unit whose location starts with the module's code location before
//! it even looks the instance up, and reload snapshots those entries so a
//! failed replacement can roll back to the previous code.

use crate::error::ModuleSystemError;
use crate::module::{Module, ModuleContext};
use crate::remote::RemoteModule;
use crate::source::{LoadedUnit, ModuleSource};
use compact_str::CompactString;
use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use relay_event_system::{
    EventBus, ModuleLoadEvent, ModuleRecord, ModuleReloadEvent, ModuleUnloadEvent, RemoteAddr,
};
use relay_rpc::{RpcError, RpcSession, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// One lifecycle request: which name, and what we know about where it lives.
#[derive(Debug, Clone)]
pub struct ModuleRequest {
    pub name: CompactString,
    /// Address when the name is (or claims to be) remote.
    pub remote: Option<RemoteAddr>,
    /// Inbound connection of a peer announcing itself via `load_module`.
    pub announce: Option<Arc<RpcSession>>,
}

impl ModuleRequest {
    pub fn local(name: impl Into<CompactString>) -> Self {
        Self {
            name: name.into(),
            remote: None,
            announce: None,
        }
    }

    pub fn remote(name: impl Into<CompactString>, addr: RemoteAddr) -> Self {
        Self {
            name: name.into(),
            remote: Some(addr),
            announce: None,
        }
    }

    pub fn announced(
        name: impl Into<CompactString>,
        addr: RemoteAddr,
        session: Arc<RpcSession>,
    ) -> Self {
        Self {
            name: name.into(),
            remote: Some(addr),
            announce: Some(session),
        }
    }
}

#[derive(Clone)]
enum ModuleOrigin {
    Local { unit: Arc<LoadedUnit> },
    Remote { addr: RemoteAddr },
}

/// Registry entry for one loaded module.
#[derive(Clone)]
struct ModuleEntry {
    module: Arc<Mutex<Box<dyn Module>>>,
    context: ModuleContext,
    origin: ModuleOrigin,
    record: ModuleRecord,
}

struct ManagerInner {
    bus: EventBus,
    source: Arc<dyn ModuleSource>,
    remote_table: HashMap<CompactString, RemoteAddr>,
    instances: DashMap<CompactString, ModuleEntry>,
    code_cache: DashMap<String, Arc<LoadedUnit>>,
    gates: DashMap<CompactString, Arc<Mutex<()>>>,
}

/// Weak handle to a manager, held by module contexts so a module can reach
/// back (e.g. the remote-disconnect unload) without keeping the manager
/// alive.
#[derive(Clone)]
pub struct ManagerHandle {
    inner: Weak<ManagerInner>,
}

impl fmt::Debug for ManagerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerHandle")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

impl ManagerHandle {
    /// A handle pointing at nothing; `upgrade` always returns `None`.
    pub fn detached() -> Self {
        Self { inner: Weak::new() }
    }

    pub fn upgrade(&self) -> Option<ModuleManager> {
        self.inner.upgrade().map(|inner| ModuleManager { inner })
    }
}

#[derive(Copy, Clone)]
enum BatchOp {
    Load,
    Unload,
    Reload,
}

impl BatchOp {
    fn verb(self) -> &'static str {
        match self {
            BatchOp::Load => "Load",
            BatchOp::Unload => "Unload",
            BatchOp::Reload => "Reload",
        }
    }
}

/// Manages the lifecycle of local and remote modules.
#[derive(Clone)]
pub struct ModuleManager {
    inner: Arc<ManagerInner>,
}

impl fmt::Debug for ModuleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleManager")
            .field("loaded", &self.inner.instances.len())
            .field("cached_units", &self.inner.code_cache.len())
            .finish()
    }
}

impl ModuleManager {
    pub fn new(
        bus: EventBus,
        source: Arc<dyn ModuleSource>,
        remote_table: HashMap<CompactString, RemoteAddr>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                bus,
                source,
                remote_table,
                instances: DashMap::new(),
                code_cache: DashMap::new(),
                gates: DashMap::new(),
            }),
        }
    }

    /// Weak handle for module contexts.
    pub fn handle(&self) -> ManagerHandle {
        ManagerHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn module_count(&self) -> usize {
        self.inner.instances.len()
    }

    pub fn module_names(&self) -> Vec<CompactString> {
        let mut names: Vec<CompactString> = self
            .inner
            .instances
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.inner.instances.contains_key(name)
    }

    /// Record of a loaded module, if present.
    pub fn record_of(&self, name: &str) -> Option<ModuleRecord> {
        self.inner
            .instances
            .get(name)
            .map(|entry| entry.record.clone())
    }

    /// Everything the manager could load right now: local names from the
    /// source plus the remote table, the remote tag winning on collision.
    pub fn list_known(&self) -> Vec<ModuleRequest> {
        let mut known: BTreeMap<CompactString, Option<RemoteAddr>> = self
            .inner
            .source
            .list()
            .into_iter()
            .map(|name| (name, None))
            .collect();
        for (name, addr) in &self.inner.remote_table {
            known.insert(name.clone(), Some(addr.clone()));
        }
        known
            .into_iter()
            .map(|(name, remote)| ModuleRequest {
                name,
                remote,
                announce: None,
            })
            .collect()
    }

    // ========================================================================
    // Single-name operations
    // ========================================================================

    /// Loads one module. `Ok(true)` iff a new instance ended up registered.
    pub async fn load_single(&self, request: &ModuleRequest) -> Result<bool, ModuleSystemError> {
        let gate = self.gate(&request.name);
        let _guard = gate.lock().await;
        self.load_locked(request).await
    }

    /// Unloads one module. `Ok(true)` iff an instance was actually removed.
    pub async fn unload_single(&self, name: &str) -> Result<bool, ModuleSystemError> {
        let gate = self.gate(name);
        let _guard = gate.lock().await;
        self.unload_locked(name).await
    }

    /// Replaces one module with a freshly resolved instance, rolling back to
    /// the previous one when the replacement fails.
    pub async fn reload_single(&self, request: &ModuleRequest) -> Result<bool, ModuleSystemError> {
        let gate = self.gate(&request.name);
        let _guard = gate.lock().await;
        self.reload_locked(request).await
    }

    fn gate(&self, name: &str) -> Arc<Mutex<()>> {
        self.inner
            .gates
            .entry(CompactString::new(name))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn load_locked(&self, request: &ModuleRequest) -> Result<bool, ModuleSystemError> {
        let name = request.name.as_str();
        if self.inner.instances.contains_key(name) {
            debug!("Module '{}' is already loaded", name);
            return Ok(false);
        }

        // An announcing peer skips the probe: the connection in hand proves
        // it is alive.
        if let Some(announce) = &request.announce {
            let addr = request.remote.clone().ok_or_else(|| {
                ModuleSystemError::Resolution(format!(
                    "announced load of '{name}' carried no remote address"
                ))
            })?;
            let module = Box::new(RemoteModule::new(
                request.name.clone(),
                addr.clone(),
                Some(announce.clone()),
            ));
            return self.install(name, module, ModuleOrigin::Remote { addr }).await;
        }

        if let Some(addr) = self.remote_addr_for(request) {
            return self.probe_remote(name, &addr).await;
        }

        let unit = self.cached_or_resolved(name)?;
        let module = unit.factory.construct()?;
        self.install(name, module, ModuleOrigin::Local { unit }).await
    }

    fn remote_addr_for(&self, request: &ModuleRequest) -> Option<RemoteAddr> {
        request
            .remote
            .clone()
            .or_else(|| self.inner.remote_table.get(request.name.as_str()).cloned())
    }

    /// `hello` probe for a configured remote name. The peer completes the
    /// load asynchronously by dialing back with `load_module`, so a
    /// successful probe normally still reports `false` here.
    async fn probe_remote(&self, name: &str, addr: &RemoteAddr) -> Result<bool, ModuleSystemError> {
        match relay_rpc::invoke_once(&addr.host, addr.port, "hello", Value::Null).await {
            Ok(_) => {
                debug!(
                    "Remote module '{}' answered hello at {}; waiting for it to announce itself",
                    name, addr
                );
                Ok(self.inner.instances.contains_key(name))
            }
            Err(RpcError::ConnectionRefused(target)) => {
                info!("🔌 Remote module '{}' is not reachable at {}", name, target);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn cached_or_resolved(&self, name: &str) -> Result<Arc<LoadedUnit>, ModuleSystemError> {
        let location = self.inner.source.location_of(name);
        if let Some(unit) = self.inner.code_cache.get(&location) {
            debug!("Reusing cached code for '{}' from {}", name, location);
            return Ok(unit.clone());
        }
        let unit = Arc::new(self.inner.source.resolve(name)?);
        self.inner
            .code_cache
            .insert(unit.location.clone(), unit.clone());
        Ok(unit)
    }

    /// Runs setup, registers the instance, and publishes `module_load`.
    async fn install(
        &self,
        name: &str,
        module: Box<dyn Module>,
        origin: ModuleOrigin,
    ) -> Result<bool, ModuleSystemError> {
        let record = self.register_instance(name, module, origin).await?;
        self.publish_lifecycle(&ModuleLoadEvent { module: record });
        Ok(true)
    }

    /// Runs setup and registers the instance without announcing it on the
    /// bus. Rollbacks go through here directly: restoring the previous
    /// instance is not a new load.
    async fn register_instance(
        &self,
        name: &str,
        mut module: Box<dyn Module>,
        origin: ModuleOrigin,
    ) -> Result<ModuleRecord, ModuleSystemError> {
        let context = ModuleContext::new(self.inner.bus.clone(), name, self.handle());
        if let Err(e) = module.setup(&context).await {
            // Discard the half-built instance together with anything it
            // managed to register.
            context.revoke_all();
            error!("❌ Setup of module '{}' failed: {}", name, e);
            return Err(e.into());
        }

        let record = module.record();
        let entry = ModuleEntry {
            module: Arc::new(Mutex::new(module)),
            context,
            origin,
            record: record.clone(),
        };
        self.inner.instances.insert(CompactString::new(name), entry);
        info!("✅ Module loaded: {}", record);
        Ok(record)
    }

    async fn unload_locked(&self, name: &str) -> Result<bool, ModuleSystemError> {
        // Purge cached code first so a later load re-resolves from the
        // source even if no instance is registered right now.
        self.purge_cache(name);

        let Some(entry) = self.inner.instances.get(name).map(|e| e.clone()) else {
            debug!("Module '{}' is not loaded", name);
            return Ok(false);
        };

        {
            let mut module = entry.module.lock().await;
            if let Err(e) = module.teardown(&entry.context).await {
                error!("❌ Teardown of module '{}' failed: {}", name, e);
            }
        }

        self.inner.instances.remove(name);
        entry.context.revoke_all();
        info!("📤 Module unloaded: {}", entry.record);
        self.publish_lifecycle(&ModuleUnloadEvent {
            module: entry.record.clone(),
        });
        Ok(true)
    }

    fn purge_cache(&self, name: &str) -> usize {
        let prefix = self.inner.source.location_of(name);
        let doomed: Vec<String> = self
            .inner
            .code_cache
            .iter()
            .filter(|entry| entry.key().starts_with(&prefix))
            .map(|entry| entry.key().clone())
            .collect();
        let count = doomed.len();
        for location in doomed {
            self.inner.code_cache.remove(&location);
            debug!("♻️ Purged cached code: {}", location);
        }
        count
    }

    fn cache_snapshot(&self, name: &str) -> Vec<(String, Arc<LoadedUnit>)> {
        let prefix = self.inner.source.location_of(name);
        self.inner
            .code_cache
            .iter()
            .filter(|entry| entry.key().starts_with(&prefix))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    async fn reload_locked(&self, request: &ModuleRequest) -> Result<bool, ModuleSystemError> {
        let name = request.name.as_str();
        let previous = self.inner.instances.get(name).map(|e| e.clone());
        let snapshot = self.cache_snapshot(name);

        self.unload_locked(name).await?;

        match self.load_locked(request).await {
            Ok(loaded) => {
                if loaded {
                    if let (Some(previous), Some(current)) = (&previous, self.record_of(name)) {
                        info!("♻️ Module reloaded: {}", current);
                        self.publish_lifecycle(&ModuleReloadEvent {
                            old_module: previous.record.clone(),
                            module: current,
                        });
                    }
                }
                Ok(loaded)
            }
            Err(load_error) => {
                let Some(previous) = previous else {
                    return Err(load_error);
                };
                warn!(
                    "♻️ Reload of '{}' failed ({}); rolling back to the previous instance",
                    name, load_error
                );
                for (location, unit) in snapshot {
                    self.inner.code_cache.insert(location, unit);
                }
                match self.rollback(name, &previous).await {
                    Ok(()) => Err(load_error),
                    Err(rollback_error) => {
                        error!(
                            "❌ Rollback of '{}' failed as well: {}",
                            name, rollback_error
                        );
                        Err(ModuleSystemError::ReloadRollback {
                            name: name.to_string(),
                            error: Box::new(load_error),
                            rollback: Box::new(rollback_error),
                        })
                    }
                }
            }
        }
    }

    /// Reconstructs the previous instance from its origin after a failed
    /// reload, without publishing any lifecycle event. Best-effort: the
    /// caller surfaces our failure alongside the original one.
    async fn rollback(
        &self,
        name: &str,
        previous: &ModuleEntry,
    ) -> Result<(), ModuleSystemError> {
        let module: Box<dyn Module> = match &previous.origin {
            ModuleOrigin::Local { unit } => unit.factory.construct()?,
            ModuleOrigin::Remote { addr } => {
                Box::new(RemoteModule::new(name, addr.clone(), None))
            }
        };
        self.register_instance(name, module, previous.origin.clone())
            .await
            .map(|_| ())
    }

    fn publish_lifecycle<T: relay_event_system::Event>(&self, event: &T) {
        if let Err(e) = self.inner.bus.publish(event) {
            error!("❌ Could not publish {} event: {}", T::NAME, e);
        }
    }

    // ========================================================================
    // Batch operations
    // ========================================================================

    /// Loads the named modules, or everything known when `names` is empty.
    /// Returns how many loads reported `true`.
    pub async fn load(&self, names: &[&str]) -> Result<usize, ModuleSystemError> {
        self.run_batch(BatchOp::Load, self.expand(names)).await
    }

    /// Unloads the named modules, or everything known when `names` is empty.
    pub async fn unload(&self, names: &[&str]) -> Result<usize, ModuleSystemError> {
        self.run_batch(BatchOp::Unload, self.expand(names)).await
    }

    /// Reloads the named modules, or everything known when `names` is empty.
    pub async fn reload(&self, names: &[&str]) -> Result<usize, ModuleSystemError> {
        self.run_batch(BatchOp::Reload, self.expand(names)).await
    }

    fn expand(&self, names: &[&str]) -> Vec<ModuleRequest> {
        if names.is_empty() {
            return self.list_known();
        }
        names
            .iter()
            .map(|name| ModuleRequest {
                name: CompactString::new(name),
                remote: self.inner.remote_table.get(*name).cloned(),
                announce: None,
            })
            .collect()
    }

    /// Fans out one task per name, lets every task finish, then re-raises the
    /// first failure observed; successes on other names stay in effect.
    async fn run_batch(
        &self,
        op: BatchOp,
        requests: Vec<ModuleRequest>,
    ) -> Result<usize, ModuleSystemError> {
        let mut tasks = FuturesUnordered::new();
        for request in requests {
            let manager = self.clone();
            tasks.push(async move {
                let name = request.name.clone();
                let result = match op {
                    BatchOp::Load => manager.load_single(&request).await,
                    BatchOp::Unload => manager.unload_single(request.name.as_str()).await,
                    BatchOp::Reload => manager.reload_single(&request).await,
                };
                (name, result)
            });
        }

        let mut successes = 0usize;
        let mut first_failure: Option<ModuleSystemError> = None;
        while let Some((name, result)) = tasks.next().await {
            match result {
                Ok(true) => successes += 1,
                Ok(false) => {}
                Err(e) => {
                    error!("❌ {} of '{}' failed: {}", op.verb(), name, e);
                    if first_failure.is_none() {
                        first_failure = Some(e);
                    }
                }
            }
        }
        match first_failure {
            Some(e) => Err(e),
            None => Ok(successes),
        }
    }

    /// Unloads everything within a bounded grace period. Failures are logged
    /// and never abort the remaining teardowns; returns how many modules
    /// actually unloaded.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        let names = self.module_names();
        if names.is_empty() {
            return 0;
        }
        info!("🛑 Shutting down {} module(s)", names.len());

        let unloaded = Arc::new(AtomicUsize::new(0));
        let counter = unloaded.clone();
        let manager = self.clone();
        let sweep = async move {
            let mut tasks = FuturesUnordered::new();
            for name in names {
                let manager = manager.clone();
                let counter = counter.clone();
                tasks.push(async move {
                    match manager.unload_single(name.as_str()).await {
                        Ok(true) => {
                            counter.fetch_add(1, Ordering::SeqCst);
                        }
                        Ok(false) => {}
                        Err(e) => error!("❌ Shutdown unload of '{}' failed: {}", name, e),
                    }
                });
            }
            while tasks.next().await.is_some() {}
        };

        if tokio::time::timeout(grace, sweep).await.is_err() {
            error!(
                "⏱️ Module shutdown exceeded its {:.1}s grace period; {} still registered",
                grace.as_secs_f64(),
                self.module_count()
            );
        }
        unloaded.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModuleError;
    use crate::module::Module;
    use crate::source::StaticModuleSource;
    use async_trait::async_trait;
    use relay_event_system::{registry, Event};
    use relay_rpc::{CommandHandler, RpcServer};
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    #[derive(Debug, Serialize, Deserialize)]
    struct TickEvent {
        tick: u64,
    }

    impl Event for TickEvent {
        const NAME: &'static str = "tick";
    }

    struct TestModule {
        name: String,
        fail_setup: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Module for TestModule {
        fn name(&self) -> &str {
            &self.name
        }

        async fn setup(&mut self, ctx: &ModuleContext) -> Result<(), ModuleError> {
            if self.fail_setup.load(Ordering::SeqCst) {
                return Err(ModuleError::Setup("instructed to fail".to_string()));
            }
            ctx.add_listener::<TickEvent, _>(|_event| Ok(()));
            Ok(())
        }
    }

    struct TestHarness {
        manager: ModuleManager,
        source: Arc<StaticModuleSource>,
        bus: EventBus,
    }

    fn harness_with_remotes(remotes: HashMap<CompactString, RemoteAddr>) -> TestHarness {
        let bus = EventBus::new();
        let source = Arc::new(StaticModuleSource::new());
        let manager = ModuleManager::new(bus.clone(), source.clone(), remotes);
        TestHarness {
            manager,
            source,
            bus,
        }
    }

    fn harness() -> TestHarness {
        harness_with_remotes(HashMap::new())
    }

    fn register_test_module(source: &StaticModuleSource, name: &str, fail_setup: Arc<AtomicBool>) {
        let module_name = name.to_string();
        source.register(
            name,
            move || -> Result<Box<dyn Module>, ModuleSystemError> {
                Ok(Box::new(TestModule {
                    name: module_name.clone(),
                    fail_setup: fail_setup.clone(),
                }))
            },
        );
    }

    fn lifecycle_probe<T: Event>(bus: &EventBus) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        bus.register::<T, _>(move |event| {
            let _ = tx.send(event);
            Ok(())
        });
        rx
    }

    async fn expect_event<T: Event>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("lifecycle event never arrived")
            .expect("lifecycle channel closed")
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn load_registers_once_and_second_load_is_a_noop() {
        let h = harness();
        register_test_module(&h.source, "alpha", Arc::new(AtomicBool::new(false)));
        let mut loads = lifecycle_probe::<ModuleLoadEvent>(&h.bus);

        let request = ModuleRequest::local("alpha");
        assert!(h.manager.load_single(&request).await.unwrap());
        assert!(h.manager.is_loaded("alpha"));
        assert_eq!(h.manager.module_count(), 1);

        let event = expect_event(&mut loads).await;
        assert_eq!(event.module.name, "alpha");
        assert!(!event.module.is_remote());

        // Second load reports "nothing new" and publishes nothing.
        assert!(!h.manager.load_single(&request).await.unwrap());
        settle().await;
        assert!(loads.try_recv().is_err());
    }

    #[tokio::test]
    async fn unload_removes_instance_and_revokes_listeners() {
        let h = harness();
        register_test_module(&h.source, "alpha", Arc::new(AtomicBool::new(false)));
        let mut unloads = lifecycle_probe::<ModuleUnloadEvent>(&h.bus);

        h.manager
            .load_single(&ModuleRequest::local("alpha"))
            .await
            .unwrap();
        assert_eq!(h.bus.listener_count(TickEvent::NAME), 1);

        assert!(h.manager.unload_single("alpha").await.unwrap());
        assert!(!h.manager.is_loaded("alpha"));
        assert!(h.manager.module_names().is_empty());
        assert_eq!(h.bus.listener_count(TickEvent::NAME), 0);

        let event = expect_event(&mut unloads).await;
        assert_eq!(event.module.name, "alpha");

        // Unloading an absent name is a no-op, not an error.
        assert!(!h.manager.unload_single("alpha").await.unwrap());
    }

    #[tokio::test]
    async fn failed_setup_discards_the_instance() {
        let h = harness();
        register_test_module(&h.source, "alpha", Arc::new(AtomicBool::new(true)));

        let err = h
            .manager
            .load_single(&ModuleRequest::local("alpha"))
            .await
            .unwrap_err();
        assert!(matches!(err, ModuleSystemError::Module(_)));
        assert!(!h.manager.is_loaded("alpha"));
        assert_eq!(h.bus.listener_count(TickEvent::NAME), 0);
    }

    #[tokio::test]
    async fn reload_replaces_the_instance_and_publishes_reload() {
        let h = harness();
        register_test_module(&h.source, "alpha", Arc::new(AtomicBool::new(false)));
        let mut reloads = lifecycle_probe::<ModuleReloadEvent>(&h.bus);

        h.manager
            .load_single(&ModuleRequest::local("alpha"))
            .await
            .unwrap();
        assert!(h
            .manager
            .reload_single(&ModuleRequest::local("alpha"))
            .await
            .unwrap());
        assert!(h.manager.is_loaded("alpha"));
        // The replacement's listener is registered exactly once; the old
        // instance's listener is gone.
        assert_eq!(h.bus.listener_count(TickEvent::NAME), 1);

        let event = expect_event(&mut reloads).await;
        assert_eq!(event.old_module.name, "alpha");
        assert_eq!(event.module.name, "alpha");
    }

    #[tokio::test]
    async fn failed_rollback_surfaces_both_errors() {
        let h = harness();
        let fail_setup = Arc::new(AtomicBool::new(false));
        register_test_module(&h.source, "alpha", fail_setup.clone());
        let mut reloads = lifecycle_probe::<ModuleReloadEvent>(&h.bus);

        h.manager
            .load_single(&ModuleRequest::local("alpha"))
            .await
            .unwrap();

        // The shared flag makes the replacement fail, and the rollback's
        // reconstruction too, so both errors must surface together.
        fail_setup.store(true, Ordering::SeqCst);
        let err = h
            .manager
            .reload_single(&ModuleRequest::local("alpha"))
            .await
            .unwrap_err();
        assert!(matches!(err, ModuleSystemError::ReloadRollback { .. }));
        // Callers were warned: a failed rollback can leave the name absent.
        assert!(!h.manager.is_loaded("alpha"));

        settle().await;
        assert!(reloads.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_reload_with_working_rollback_keeps_the_module() {
        let h = harness();
        // Two factories under one name: the manager resolves through the
        // cache snapshot on rollback, so re-registering a failing factory
        // after the first load makes the *reload* fail while the snapshot
        // unit still constructs the working type.
        register_test_module(&h.source, "alpha", Arc::new(AtomicBool::new(false)));
        h.manager
            .load_single(&ModuleRequest::local("alpha"))
            .await
            .unwrap();

        register_test_module(&h.source, "alpha", Arc::new(AtomicBool::new(true)));
        let mut reloads = lifecycle_probe::<ModuleReloadEvent>(&h.bus);
        let mut loads = lifecycle_probe::<ModuleLoadEvent>(&h.bus);

        let err = h
            .manager
            .reload_single(&ModuleRequest::local("alpha"))
            .await
            .unwrap_err();
        // The original failure surfaces alone: rollback reconstructed the
        // previous instance from the snapshotted unit.
        assert!(matches!(err, ModuleSystemError::Module(_)));
        assert!(h.manager.is_loaded("alpha"));
        assert_eq!(h.bus.listener_count(TickEvent::NAME), 1);

        settle().await;
        assert!(reloads.try_recv().is_err());
        // The restored instance came back silently: no `module_load` either.
        assert!(loads.try_recv().is_err());
    }

    #[tokio::test]
    async fn batch_load_of_everything_known_counts_successes() {
        let h = harness();
        register_test_module(&h.source, "alpha", Arc::new(AtomicBool::new(false)));
        register_test_module(&h.source, "beta", Arc::new(AtomicBool::new(false)));

        let loaded = h.manager.load(&[]).await.unwrap();
        assert_eq!(loaded, 2);
        assert_eq!(h.manager.module_count(), 2);

        // Everything already loaded: zero new registrations, no error.
        assert_eq!(h.manager.load(&[]).await.unwrap(), 0);

        let unloaded = h.manager.unload(&[]).await.unwrap();
        assert_eq!(unloaded, 2);
        assert_eq!(h.manager.module_count(), 0);
    }

    #[tokio::test]
    async fn batch_failure_surfaces_after_other_names_finish() {
        let h = harness();
        register_test_module(&h.source, "good", Arc::new(AtomicBool::new(false)));
        register_test_module(&h.source, "bad", Arc::new(AtomicBool::new(true)));

        let err = h.manager.load(&["good", "bad"]).await.unwrap_err();
        assert!(matches!(err, ModuleSystemError::Module(_)));
        // The failing name did not poison its sibling.
        assert!(h.manager.is_loaded("good"));
        assert!(!h.manager.is_loaded("bad"));
    }

    #[tokio::test]
    async fn unreachable_remote_probe_downgrades_to_not_loaded() {
        // Bind-and-drop to find a port with nothing listening.
        let port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };
        let mut remotes = HashMap::new();
        remotes.insert(
            CompactString::new("wires"),
            RemoteAddr::new("127.0.0.1", port),
        );
        let h = harness_with_remotes(remotes);
        let mut loads = lifecycle_probe::<ModuleLoadEvent>(&h.bus);

        let request = ModuleRequest::remote("wires", RemoteAddr::new("127.0.0.1", port));
        assert!(!h.manager.load_single(&request).await.unwrap());
        assert!(!h.manager.is_loaded("wires"));
        settle().await;
        assert!(loads.try_recv().is_err());
    }

    #[tokio::test]
    async fn list_known_unions_source_and_remote_table() {
        let mut remotes = HashMap::new();
        remotes.insert(
            CompactString::new("beta"),
            RemoteAddr::new("127.0.0.1", 9020),
        );
        remotes.insert(
            CompactString::new("gamma"),
            RemoteAddr::new("127.0.0.1", 9021),
        );
        let h = harness_with_remotes(remotes);
        register_test_module(&h.source, "alpha", Arc::new(AtomicBool::new(false)));
        register_test_module(&h.source, "beta", Arc::new(AtomicBool::new(false)));

        let known = h.manager.list_known();
        let names: Vec<&str> = known.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "beta", "gamma"]);
        // The remote tag wins when a name is both local and remote.
        assert!(known[0].remote.is_none());
        assert!(known[1].remote.is_some());
        assert!(known[2].remote.is_some());
    }

    #[tokio::test]
    async fn shutdown_unloads_everything_within_grace() {
        let h = harness();
        register_test_module(&h.source, "alpha", Arc::new(AtomicBool::new(false)));
        register_test_module(&h.source, "beta", Arc::new(AtomicBool::new(false)));
        h.manager.load(&[]).await.unwrap();

        let unloaded = h.manager.shutdown(Duration::from_secs(5)).await;
        assert_eq!(unloaded, 2);
        assert_eq!(h.manager.module_count(), 0);
    }

    // ========================================================================
    // Remote module tests against an in-process peer
    // ========================================================================

    /// Answers the peer-side `setup`/`teardown`/`event` commands and mirrors
    /// everything it sees into channels the test can assert on.
    struct FakePeer {
        events: Vec<&'static str>,
        seen: mpsc::UnboundedSender<Value>,
        torn_down: mpsc::UnboundedSender<()>,
    }

    struct PeerSetup {
        events: Vec<&'static str>,
    }

    #[async_trait]
    impl CommandHandler for PeerSetup {
        async fn handle(&self, _session: &RpcSession, _data: Value) -> Result<Value, RpcError> {
            Ok(json!({ "events": self.events }))
        }
    }

    struct PeerTeardown {
        torn_down: mpsc::UnboundedSender<()>,
    }

    #[async_trait]
    impl CommandHandler for PeerTeardown {
        async fn handle(&self, _session: &RpcSession, _data: Value) -> Result<Value, RpcError> {
            let _ = self.torn_down.send(());
            Ok(Value::Null)
        }
    }

    struct PeerEventSink {
        seen: mpsc::UnboundedSender<Value>,
    }

    #[async_trait]
    impl CommandHandler for PeerEventSink {
        async fn handle(&self, _session: &RpcSession, data: Value) -> Result<Value, RpcError> {
            let _ = self.seen.send(data);
            Ok(Value::Null)
        }
    }

    async fn start_fake_peer(
        peer: FakePeer,
    ) -> (std::net::SocketAddr, tokio::sync::broadcast::Sender<()>) {
        let server = RpcServer::new();
        server.register("hello", Arc::new(PeerEventSink { seen: peer.seen.clone() }));
        server.register("setup", Arc::new(PeerSetup { events: peer.events }));
        server.register(
            "teardown",
            Arc::new(PeerTeardown {
                torn_down: peer.torn_down,
            }),
        );
        server.register("event", Arc::new(PeerEventSink { seen: peer.seen }));
        let mut server = server;
        let addr = server.bind("127.0.0.1:0").await.unwrap();
        let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
        tokio::spawn(server.serve(shutdown_rx));
        (addr, shutdown_tx)
    }

    #[tokio::test]
    async fn announced_remote_load_forwards_events_and_tears_down() {
        registry::register_event::<TickEvent>();

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let (teardown_tx, mut teardown_rx) = mpsc::unbounded_channel();
        let (addr, _peer_shutdown) = start_fake_peer(FakePeer {
            events: vec!["tick"],
            seen: seen_tx,
            torn_down: teardown_tx,
        })
        .await;

        let h = harness();
        // Any live session works as the announcing connection here.
        let announce = Arc::new(
            relay_rpc::connect("127.0.0.1", addr.port()).await.unwrap(),
        );
        let request = ModuleRequest::announced(
            "wires",
            RemoteAddr::new("127.0.0.1", addr.port()),
            announce,
        );
        let mut loads = lifecycle_probe::<ModuleLoadEvent>(&h.bus);

        assert!(h.manager.load_single(&request).await.unwrap());
        assert!(h.manager.is_loaded("wires"));
        let record = h.manager.record_of("wires").unwrap();
        assert!(record.is_remote());
        let event = expect_event(&mut loads).await;
        assert!(event.module.is_remote());

        // A local publish crosses the boundary as {"t": ..., "d": ...}.
        h.bus.publish(&TickEvent { tick: 7 }).unwrap();
        let envelope = timeout(Duration::from_secs(2), seen_rx.recv())
            .await
            .expect("event never reached the peer")
            .unwrap();
        assert_eq!(envelope["t"], "tick");
        assert_eq!(envelope["d"]["tick"], 7);

        // Unload tears the peer down and drops the forwarding listener.
        assert!(h.manager.unload_single("wires").await.unwrap());
        timeout(Duration::from_secs(2), teardown_rx.recv())
            .await
            .expect("peer teardown never invoked")
            .unwrap();
        assert_eq!(h.bus.listener_count(TickEvent::NAME), 0);
    }

    #[tokio::test]
    async fn remote_setup_with_unknown_event_fails_the_load() {
        let (seen_tx, _seen_rx) = mpsc::unbounded_channel();
        let (teardown_tx, _teardown_rx) = mpsc::unbounded_channel();
        let (addr, _peer_shutdown) = start_fake_peer(FakePeer {
            events: vec!["never_registered_anywhere"],
            seen: seen_tx,
            torn_down: teardown_tx,
        })
        .await;

        let h = harness();
        let announce = Arc::new(
            relay_rpc::connect("127.0.0.1", addr.port()).await.unwrap(),
        );
        let request = ModuleRequest::announced(
            "wires",
            RemoteAddr::new("127.0.0.1", addr.port()),
            announce,
        );

        let err = h.manager.load_single(&request).await.unwrap_err();
        assert!(err.to_string().contains("unknown event"));
        assert!(!h.manager.is_loaded("wires"));
    }

    #[tokio::test]
    async fn reachable_remote_probe_reports_pending_announce() {
        let (seen_tx, _seen_rx) = mpsc::unbounded_channel();
        let (teardown_tx, _teardown_rx) = mpsc::unbounded_channel();
        let (addr, _peer_shutdown) = start_fake_peer(FakePeer {
            events: vec![],
            seen: seen_tx,
            torn_down: teardown_tx,
        })
        .await;

        let mut remotes = HashMap::new();
        remotes.insert(
            CompactString::new("wires"),
            RemoteAddr::new("127.0.0.1", addr.port()),
        );
        let h = harness_with_remotes(remotes);

        // The probe reaches the peer, but registration only happens when the
        // peer announces itself, so this load reports false.
        let request = ModuleRequest::remote("wires", RemoteAddr::new("127.0.0.1", addr.port()));
        assert!(!h.manager.load_single(&request).await.unwrap());
        assert!(!h.manager.is_loaded("wires"));
    }
}
