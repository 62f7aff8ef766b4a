//! RPC command handlers bridging remote callers into the host.
//!
//! Two commands make up the host's wire surface: `load_module` lets a peer
//! announce itself as a remote module, and `api_call` dispatches into the
//! allow-listed [`ApiRegistry`]. Malformed payloads are answered with a
//! negative acknowledgement describing the offending field; they never tear
//! down the transport.

use crate::api::ApiRegistry;
use module_system::{ModuleManager, ModuleRequest};
use relay_event_system::RemoteAddr;
use relay_rpc::{CommandHandler, RpcError, RpcSession};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

/// Handles `load_module` announcements from peers.
///
/// The calling session rides along on the load, so the peer's log pushes are
/// re-logged locally and its disconnect auto-unloads the module.
pub struct LoadModuleCommand {
    manager: ModuleManager,
}

impl LoadModuleCommand {
    pub fn new(manager: ModuleManager) -> Self {
        Self { manager }
    }
}

#[async_trait::async_trait]
impl CommandHandler for LoadModuleCommand {
    async fn handle(&self, session: &RpcSession, data: Value) -> Result<Value, RpcError> {
        let name = match data.get("name").and_then(Value::as_str) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => {
                warn!("❓ load_module from {} without a module name", session.peer());
                return Err(RpcError::Rejected(
                    "load_module: 'name' must be a non-empty string".to_string(),
                ));
            }
        };

        let Some(host) = data.get("host").and_then(Value::as_str) else {
            warn!("❓ load_module '{}' from {} without a host", name, session.peer());
            return Err(RpcError::Rejected(
                "load_module: 'host' must be a string".to_string(),
            ));
        };

        // as_u64 turns floats and negatives into None, so 9005.5 is rejected
        // here rather than truncated.
        let port = match data.get("port").and_then(Value::as_u64) {
            Some(port) if port > 0 && port <= u64::from(u16::MAX) => port as u16,
            _ => {
                warn!("❓ load_module '{}' from {} with a bad port", name, session.peer());
                return Err(RpcError::Rejected(
                    "load_module: 'port' must be an integer between 1 and 65535".to_string(),
                ));
            }
        };

        info!(
            "🔌 Peer {} announcing module '{}' at {}:{}",
            session.peer(),
            name,
            host,
            port
        );

        let request = ModuleRequest::announced(
            name.as_str(),
            RemoteAddr::new(host, port),
            Arc::new(session.clone()),
        );
        match self.manager.load_single(&request).await {
            Ok(true) => Ok(json!({ "loaded": true })),
            Ok(false) => Err(RpcError::Rejected(format!(
                "module '{name}' is already loaded"
            ))),
            Err(e) => Err(RpcError::Rejected(e.to_string())),
        }
    }
}

/// Handles `api_call` requests by dispatching into the [`ApiRegistry`].
pub struct ApiCallCommand {
    api: Arc<ApiRegistry>,
}

impl ApiCallCommand {
    pub fn new(api: Arc<ApiRegistry>) -> Self {
        Self { api }
    }
}

#[async_trait::async_trait]
impl CommandHandler for ApiCallCommand {
    async fn handle(&self, session: &RpcSession, data: Value) -> Result<Value, RpcError> {
        let Some(method) = data.get("method").and_then(Value::as_str) else {
            warn!("❓ api_call from {} without a method name", session.peer());
            return Err(RpcError::Rejected(
                "api_call: 'method' must be a string".to_string(),
            ));
        };

        let kwargs = match data.get("kwargs") {
            None | Some(Value::Null) => json!({}),
            Some(value) if value.is_object() => value.clone(),
            Some(_) => {
                warn!(
                    "❓ api_call '{}' from {} with non-object kwargs",
                    method,
                    session.peer()
                );
                return Err(RpcError::Rejected(
                    "api_call: 'kwargs' must be an object".to_string(),
                ));
            }
        };

        self.api.call(method, kwargs).await.map_err(|e| match e {
            RpcError::UnknownCommand(m) => RpcError::Rejected(format!("unknown api method: {m}")),
            other => other,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
