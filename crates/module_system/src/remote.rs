//! Remote modules: proxies for module code running in another process.
//!
//! A [`RemoteModule`] looks like any other module to the manager, but its
//! setup opens an RPC session to the peer, asks it which events it wants,
//! and subscribes one forwarding listener per event name. Local events then
//! cross the process boundary as fire-and-forget `event` commands; nothing
//! else does.

use crate::error::ModuleError;
use crate::manager::ManagerHandle;
use crate::module::{Module, ModuleContext};
use async_trait::async_trait;
use compact_str::CompactString;
use relay_event_system::{registry, EventError, EventListener, ModuleRecord, RemoteAddr};
use relay_rpc::{DisconnectListener, PushListener, RpcSession, Value};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Proxy for a module hosted by a remote peer.
pub struct RemoteModule {
    name: CompactString,
    addr: RemoteAddr,
    announce: Option<Arc<RpcSession>>,
    session: Option<RpcSession>,
}

impl std::fmt::Debug for RemoteModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteModule")
            .field("name", &self.name)
            .field("addr", &self.addr)
            .field("connected", &self.session.as_ref().map(RpcSession::connected))
            .finish()
    }
}

impl RemoteModule {
    /// `announce` is the inbound connection the peer announced itself on,
    /// when there is one; its disconnect is what takes the module offline.
    pub fn new(
        name: impl Into<CompactString>,
        addr: RemoteAddr,
        announce: Option<Arc<RpcSession>>,
    ) -> Self {
        Self {
            name: name.into(),
            addr,
            announce,
            session: None,
        }
    }

    pub fn addr(&self) -> &RemoteAddr {
        &self.addr
    }
}

#[async_trait]
impl Module for RemoteModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn record(&self) -> ModuleRecord {
        ModuleRecord::remote(self.name.as_str(), self.addr.clone())
    }

    async fn setup(&mut self, ctx: &ModuleContext) -> Result<(), ModuleError> {
        let session = relay_rpc::connect(&self.addr.host, self.addr.port).await?;
        info!("🔗 Remote module '{}' online at {}", self.name, self.addr);

        if let Some(announce) = &self.announce {
            announce
                .on_push(Arc::new(RemoteLogListener {
                    module: self.name.clone(),
                }))
                .await;
            announce
                .on_disconnect(Arc::new(RemoteOffline {
                    module: self.name.clone(),
                    manager: ctx.manager(),
                }))
                .await;
        }

        let reply = session.invoke("setup", Value::Null).await?;
        let wanted = parse_event_names(&self.name, &reply)?;
        for event_name in &wanted {
            // Only registered event types may cross the boundary; an unknown
            // name fails the whole load.
            if registry::resolve(event_name).is_none() {
                session.close();
                return Err(ModuleError::Setup(format!(
                    "remote module '{}' subscribed to unknown event '{}'",
                    self.name, event_name
                )));
            }
            ctx.add_raw_listener(
                event_name,
                Arc::new(EventForwarder {
                    event_name: CompactString::new(event_name),
                    session: session.clone(),
                }),
            );
        }
        debug!(
            "📡 Remote module '{}' subscribed to {} event(s)",
            self.name,
            wanted.len()
        );

        self.session = Some(session);
        Ok(())
    }

    async fn teardown(&mut self, _ctx: &ModuleContext) -> Result<(), ModuleError> {
        if let Some(session) = self.session.take() {
            if session.connected() {
                let result = session.invoke("teardown", Value::Null).await;
                session.close();
                result?;
            }
        }
        Ok(())
    }
}

fn parse_event_names(module: &str, reply: &Value) -> Result<Vec<String>, ModuleError> {
    let names = reply
        .get("events")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            ModuleError::Setup(format!(
                "remote module '{}' answered setup without an 'events' array: {}",
                module, reply
            ))
        })?;
    names
        .iter()
        .map(|name| {
            name.as_str().map(str::to_string).ok_or_else(|| {
                ModuleError::Setup(format!(
                    "remote module '{}' listed a non-string event name: {}",
                    module, name
                ))
            })
        })
        .collect()
}

/// Forwards one event variant over the wire as `{"t": name, "d": fields}`.
struct EventForwarder {
    event_name: CompactString,
    session: RpcSession,
}

#[async_trait]
impl EventListener for EventForwarder {
    async fn handle(&self, payload: &[u8]) -> Result<(), EventError> {
        let fields: Value =
            serde_json::from_slice(payload).map_err(EventError::Deserialization)?;
        let envelope = json!({ "t": self.event_name.as_str(), "d": fields });
        trace!("📤 Forwarding '{}' to {}", self.event_name, self.session.peer());
        self.session.notify("event", envelope).map_err(|e| {
            EventError::ListenerExecution(format!(
                "could not forward '{}' to {}: {}",
                self.event_name,
                self.session.peer(),
                e
            ))
        })
    }

    fn listener_name(&self) -> &str {
        "remote_event_forwarder"
    }
}

/// Re-logs `{level, message}` push records from the peer under the remote
/// module's name.
struct RemoteLogListener {
    module: CompactString,
}

#[async_trait]
impl PushListener for RemoteLogListener {
    async fn on_push(&self, data: Value) {
        let level = data.get("level").and_then(Value::as_str).unwrap_or("info");
        let message = data.get("message").and_then(Value::as_str).unwrap_or_default();
        match level {
            "error" => error!("[{}] {}", self.module, message),
            "warn" | "warning" => warn!("[{}] {}", self.module, message),
            "debug" => debug!("[{}] {}", self.module, message),
            "trace" => trace!("[{}] {}", self.module, message),
            _ => info!("[{}] {}", self.module, message),
        }
    }
}

/// Unloads the module when its announcing connection drops.
struct RemoteOffline {
    module: CompactString,
    manager: ManagerHandle,
}

#[async_trait]
impl DisconnectListener for RemoteOffline {
    async fn on_disconnect(&self, error: Option<String>) {
        match &error {
            Some(e) => info!("🔴 Remote module '{}' offline: {}", self.module, e),
            None => debug!("🔴 Remote module '{}' offline", self.module),
        }
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        if let Err(e) = manager.unload_single(self.module.as_str()).await {
            error!(
                "❌ Could not unload offline module '{}': {}",
                self.module, e
            );
        }
    }
}
