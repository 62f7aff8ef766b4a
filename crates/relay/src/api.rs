//! Allow-listed API methods exposed over the RPC bridge.
//!
//! Remote callers reach host functionality exclusively through the
//! [`ApiRegistry`]: an explicit name → handler table populated at startup.
//! Anything not registered is rejected, so the registry doubles as the
//! security boundary for the `api_call` command.

use compact_str::CompactString;
use dashmap::DashMap;
use relay_rpc::RpcError;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

/// A single callable API method.
///
/// Implementations receive the caller-supplied keyword arguments as a JSON
/// object and return a JSON result that travels back as the positive
/// acknowledgement.
#[async_trait::async_trait]
pub trait ApiMethod: Send + Sync {
    async fn call(&self, kwargs: Value) -> Result<Value, RpcError>;
}

/// Explicit allow-list of API methods reachable via `api_call`.
///
/// The built-in `describe` method always exists and returns the sorted list
/// of registered method names, so callers can discover what the host offers.
pub struct ApiRegistry {
    methods: DashMap<CompactString, Arc<dyn ApiMethod>>,
}

impl ApiRegistry {
    pub fn new() -> Self {
        Self {
            methods: DashMap::new(),
        }
    }

    /// Registers a method under `name`, replacing any previous handler.
    pub fn register(&self, name: impl Into<CompactString>, method: Arc<dyn ApiMethod>) {
        let name = name.into();
        debug!("📝 API method registered: {}", name);
        self.methods.insert(name, method);
    }

    /// All callable method names, including the built-in `describe`.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .methods
            .iter()
            .map(|entry| entry.key().to_string())
            .collect();
        names.push("describe".to_string());
        names.sort();
        names.dedup();
        names
    }

    /// Dispatches `method` with `kwargs`.
    ///
    /// Unknown names are rejected rather than silently ignored.
    pub async fn call(&self, method: &str, kwargs: Value) -> Result<Value, RpcError> {
        if method == "describe" {
            return Ok(json!({ "methods": self.names() }));
        }

        let handler = self
            .methods
            .get(method)
            .map(|entry| Arc::clone(entry.value()));

        match handler {
            Some(handler) => handler.call(kwargs).await,
            None => Err(RpcError::UnknownCommand(method.to_string())),
        }
    }
}

impl Default for ApiRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ApiRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiRegistry")
            .field("methods", &self.names())
            .finish()
    }
}
