//! Outbound RPC connections.

use crate::error::RpcError;
use crate::session::RpcSession;
use serde_json::Value;
use std::io;
use tokio::net::TcpStream;
use tracing::debug;

/// Dials `host:port` and returns a live session.
///
/// A refused TCP connection comes back as [`RpcError::ConnectionRefused`]
/// so callers probing for an optional peer can tell "nobody there" apart
/// from real transport failures.
pub async fn connect(host: &str, port: u16) -> Result<RpcSession, RpcError> {
    let addr = format!("{host}:{port}");
    let stream = TcpStream::connect(&addr).await.map_err(|e| {
        if e.kind() == io::ErrorKind::ConnectionRefused {
            RpcError::ConnectionRefused(addr.clone())
        } else {
            RpcError::Io(e)
        }
    })?;

    let (ws, _response) = tokio_tungstenite::client_async(format!("ws://{addr}/"), stream).await?;
    debug!("🔗 RPC connected to {}", addr);
    Ok(RpcSession::spawn(ws, addr, None))
}

/// Connects, invokes a single command, and closes the session.
pub async fn invoke_once(
    host: &str,
    port: u16,
    cmd: &str,
    data: Value,
) -> Result<Value, RpcError> {
    let session = connect(host, port).await?;
    let result = session.invoke(cmd, data).await;
    session.close();
    result
}
