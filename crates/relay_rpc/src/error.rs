//! Error types for the RPC bridge.

/// Enumeration of possible RPC bridge errors.
///
/// `ConnectionRefused` is split out from the other transport failures because
/// callers treat it differently: a reachability probe against a peer that is
/// simply not running downgrades it to "not available right now" instead of
/// propagating an error.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The peer actively refused the connection
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// Transport-level I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket protocol failure
    #[error("WebSocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),

    /// The session is closed; pending and future calls cannot complete
    #[error("Connection closed")]
    Closed,

    /// The peer answered a request with a negative acknowledgement
    #[error("Remote error: {0}")]
    Remote(String),

    /// A frame or payload could not be serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No handler is registered for the requested command
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// A request payload failed validation
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// A handler declined the request; the message travels back verbatim as
    /// the negative acknowledgement
    #[error("{0}")]
    Rejected(String),

    /// `serve` was called before `bind`
    #[error("Server not bound")]
    NotBound,
}
