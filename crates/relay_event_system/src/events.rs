//! # Event Traits and Core Events
//!
//! This module defines the [`Event`] trait every dispatchable occurrence
//! implements, the built-in lifecycle events published by the module manager,
//! and the shared error type for the event system.
//!
//! ## Event Identity
//!
//! Every event variant declares a stable wire name through [`Event::NAME`].
//! That name is what listeners subscribe under, what the registry resolves,
//! and what remote peers send when they ask for a variant to be forwarded.
//!
//! ## Design Principles
//!
//! - **Type Safety**: events are plain serde structs, decoded back into their
//!   concrete type before a listener ever sees them
//! - **Serialization**: one JSON representation per variant, shared between
//!   the bus and the RPC bridge
//! - **Extensibility**: adding a variant is deriving serde and picking a name

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt::{self, Debug};

// ============================================================================
// Event Trait
// ============================================================================

/// Core trait that all events must implement.
///
/// Events are immutable named occurrences. The provided `encode`/`decode`
/// methods give the bus and the RPC bridge a single JSON payload shape per
/// variant, so an event forwarded to a remote peer round-trips byte-for-byte.
pub trait Event: Serialize + DeserializeOwned + Debug + Send + Sync + 'static {
    /// Stable wire/registry name for this variant.
    ///
    /// Must be unique across the process; the registry and the bus both key
    /// on it.
    const NAME: &'static str;

    /// Serializes the event to its JSON payload bytes.
    fn encode(&self) -> Result<Vec<u8>, EventError> {
        serde_json::to_vec(self).map_err(|e| {
            tracing::error!(
                "🔴 Event serialization failed for '{}': {} (event debug: {:?})",
                Self::NAME,
                e,
                self
            );
            EventError::Serialization(e)
        })
    }

    /// Parses an event of this variant back out of payload bytes.
    fn decode(data: &[u8]) -> Result<Self, EventError> {
        serde_json::from_slice(data).map_err(|e| {
            tracing::error!(
                "🔴 Event deserialization failed for '{}': {} ({} bytes)",
                Self::NAME,
                e,
                data.len()
            );
            EventError::Deserialization(e)
        })
    }
}

// ============================================================================
// Module Identity
// ============================================================================

/// Address of a module that lives in another process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteAddr {
    /// Hostname or IP the peer listens on
    pub host: String,
    /// TCP port of the peer's RPC endpoint
    pub port: u16,
}

impl RemoteAddr {
    /// Creates a new remote address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for RemoteAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Serializable snapshot of a module's public identity.
///
/// Lifecycle events carry records instead of instances so listeners (local
/// and remote) can tell which module changed without holding a reference to
/// the instance past its removal from the manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleRecord {
    /// Logical name, unique among loaded modules at any instant
    pub name: String,
    /// Present iff the module executes in another process
    pub remote: Option<RemoteAddr>,
}

impl ModuleRecord {
    /// Record for a module running inside this process.
    pub fn local(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            remote: None,
        }
    }

    /// Record for a module reachable at `addr`.
    pub fn remote(name: impl Into<String>, addr: RemoteAddr) -> Self {
        Self {
            name: name.into(),
            remote: Some(addr),
        }
    }

    /// True when this module executes in another process.
    pub fn is_remote(&self) -> bool {
        self.remote.is_some()
    }
}

impl fmt::Display for ModuleRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.remote {
            Some(addr) => write!(f, "{} ({})", self.name, addr),
            None => write!(f, "{}", self.name),
        }
    }
}

// ============================================================================
// Core Lifecycle Events
// ============================================================================

/// Event published once startup completes and the host is accepting work.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadyEvent {}

impl Event for ReadyEvent {
    const NAME: &'static str = "ready";
}

/// Event wrapping a failure raised by an event listener.
///
/// Published by the bus when a listener fails under error isolation. The
/// publication of this event itself runs *without* isolation, so a faulty
/// error listener is logged but never produces a second `ErrorEvent`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    /// Display form of the causing error
    pub error: String,
    /// Formatted source chain of the causing error
    pub trace: String,
}

impl ErrorEvent {
    /// Builds an error event from any error, walking its source chain.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut trace = err.to_string();
        let mut source = err.source();
        while let Some(cause) = source {
            trace.push_str("\n  caused by: ");
            trace.push_str(&cause.to_string());
            source = cause.source();
        }
        Self {
            error: err.to_string(),
            trace,
        }
    }
}

impl Event for ErrorEvent {
    const NAME: &'static str = "error";
}

/// Event published after a module instance is registered with the manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleLoadEvent {
    /// The module that was loaded
    pub module: ModuleRecord,
}

impl Event for ModuleLoadEvent {
    const NAME: &'static str = "module_load";
}

/// Event published after a module instance is removed from the manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleUnloadEvent {
    /// The module that was unloaded
    pub module: ModuleRecord,
}

impl Event for ModuleUnloadEvent {
    const NAME: &'static str = "module_unload";
}

/// Event published after a successful reload, carrying both generations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleReloadEvent {
    /// The instance that was replaced
    pub old_module: ModuleRecord,
    /// The instance now registered under the name
    pub module: ModuleRecord,
}

impl Event for ModuleReloadEvent {
    const NAME: &'static str = "module_reload";
}

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during event system operations.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    /// Serialization failed when converting an event to bytes
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Deserialization failed when converting bytes back to an event
    #[error("Deserialization error: {0}")]
    Deserialization(serde_json::Error),
    /// Listener execution failed during event processing
    #[error("Listener execution error: {0}")]
    ListenerExecution(String),
    #[error("An unexpected error occurred: {0}")]
    Other(String),
}
