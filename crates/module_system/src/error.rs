//! Error types for the module system.

use relay_event_system::EventError;
use relay_rpc::RpcError;
use thiserror::Error;

/// Errors raised by module implementations themselves.
///
/// Module authors return these from `setup`/`teardown`; the manager wraps
/// them into [`ModuleSystemError`] when it reports an operation's outcome.
#[derive(Error, Debug)]
pub enum ModuleError {
    #[error("Setup failed: {0}")]
    Setup(String),

    #[error("Teardown failed: {0}")]
    Teardown(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error(transparent)]
    Event(#[from] EventError),

    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),
}

#[derive(Error, Debug)]
pub enum ModuleSystemError {
    #[error("Module resolution error: {0}")]
    Resolution(String),

    #[error("Library loading error: {0}")]
    Library(String),

    #[error("Module ABI mismatch: {0}")]
    AbiMismatch(String),

    #[error("Module error: {0}")]
    Module(#[from] ModuleError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("Event system error: {0}")]
    Event(#[from] EventError),

    /// A reload's compensating load failed too. Both failures surface so the
    /// caller can see that the name may now be absent.
    #[error("Reload of '{name}' failed: {error}; rollback also failed: {rollback}")]
    ReloadRollback {
        name: String,
        error: Box<ModuleSystemError>,
        rollback: Box<ModuleSystemError>,
    },
}
