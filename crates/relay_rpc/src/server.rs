//! WebSocket RPC server.
//!
//! [`RpcServer`] accepts connections on a bound address and spawns an
//! [`RpcSession`] per client, wired to the server's command table. Handlers
//! implement [`CommandHandler`] and receive the session they arrived on, so
//! they can push messages back or hold the session for later.

use crate::error::RpcError;
use crate::session::RpcSession;
use async_trait::async_trait;
use compact_str::CompactString;
use dashmap::DashMap;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Handler for one named command.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// `session` is the connection the request arrived on.
    async fn handle(&self, session: &RpcSession, data: Value) -> Result<Value, RpcError>;
}

pub(crate) type CommandTable = DashMap<CompactString, Arc<dyn CommandHandler>>;

/// Accepts WebSocket connections and routes their requests to registered
/// command handlers.
pub struct RpcServer {
    commands: Arc<CommandTable>,
    listener: Option<TcpListener>,
}

impl Default for RpcServer {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcServer {
    pub fn new() -> Self {
        Self {
            commands: Arc::new(DashMap::new()),
            listener: None,
        }
    }

    /// Registers `handler` under `name`, replacing any previous handler.
    pub fn register(&self, name: &str, handler: Arc<dyn CommandHandler>) {
        debug!("📝 Registered RPC command '{}'", name);
        self.commands.insert(CompactString::new(name), handler);
    }

    /// Binds the listening socket and returns the local address (useful with
    /// port 0).
    pub async fn bind(&mut self, addr: &str) -> Result<SocketAddr, RpcError> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        info!("🚀 RPC server listening on {}", local);
        self.listener = Some(listener);
        Ok(local)
    }

    /// Runs the accept loop until `shutdown` fires.
    ///
    /// Each accepted connection gets its own session; a failed WebSocket
    /// handshake only drops that connection.
    pub async fn serve(
        self,
        mut shutdown: tokio::sync::broadcast::Receiver<()>,
    ) -> Result<(), RpcError> {
        let listener = self.listener.ok_or(RpcError::NotBound)?;
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    let commands = self.commands.clone();
                    tokio::spawn(async move {
                        match tokio_tungstenite::accept_async(stream).await {
                            Ok(ws) => {
                                info!("🔌 RPC client connected: {}", addr);
                                RpcSession::spawn(ws, addr.to_string(), Some(commands));
                            }
                            Err(e) => {
                                error!("❌ WebSocket handshake with {} failed: {}", addr, e);
                            }
                        }
                    });
                }
                _ = shutdown.recv() => {
                    info!("🛑 RPC accept loop stopping");
                    break;
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{connect, invoke_once};
    use crate::session::{DisconnectListener, PushListener};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::{broadcast, mpsc};
    use tokio::time::timeout;

    struct EchoCommand;

    #[async_trait]
    impl CommandHandler for EchoCommand {
        async fn handle(&self, _session: &RpcSession, data: Value) -> Result<Value, RpcError> {
            Ok(data)
        }
    }

    struct FailCommand;

    #[async_trait]
    impl CommandHandler for FailCommand {
        async fn handle(&self, _session: &RpcSession, _data: Value) -> Result<Value, RpcError> {
            Err(RpcError::InvalidPayload("bad input".to_string()))
        }
    }

    struct CountCommand {
        hits: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl CommandHandler for CountCommand {
        async fn handle(&self, _session: &RpcSession, _data: Value) -> Result<Value, RpcError> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        }
    }

    /// Pushes the request data back over the session instead of answering
    /// with it.
    struct PushBackCommand;

    #[async_trait]
    impl CommandHandler for PushBackCommand {
        async fn handle(&self, session: &RpcSession, data: Value) -> Result<Value, RpcError> {
            session.push(data)?;
            Ok(Value::Null)
        }
    }

    /// Never answers; used to leave an invoke pending across a disconnect.
    struct HangCommand;

    #[async_trait]
    impl CommandHandler for HangCommand {
        async fn handle(&self, _session: &RpcSession, _data: Value) -> Result<Value, RpcError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Value::Null)
        }
    }

    struct ChannelPushListener {
        tx: mpsc::UnboundedSender<Value>,
    }

    #[async_trait]
    impl PushListener for ChannelPushListener {
        async fn on_push(&self, data: Value) {
            let _ = self.tx.send(data);
        }
    }

    struct ChannelDisconnectListener {
        tx: mpsc::UnboundedSender<Option<String>>,
    }

    #[async_trait]
    impl DisconnectListener for ChannelDisconnectListener {
        async fn on_disconnect(&self, error: Option<String>) {
            let _ = self.tx.send(error);
        }
    }

    async fn start_server(server: RpcServer) -> (SocketAddr, broadcast::Sender<()>) {
        let mut server = server;
        let addr = server.bind("127.0.0.1:0").await.unwrap();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        tokio::spawn(server.serve(shutdown_rx));
        (addr, shutdown_tx)
    }

    #[tokio::test]
    async fn invoke_round_trips_through_a_handler() {
        let server = RpcServer::new();
        server.register("echo", Arc::new(EchoCommand));
        let (addr, _shutdown) = start_server(server).await;

        let session = connect("127.0.0.1", addr.port()).await.unwrap();
        let reply = session
            .invoke("echo", json!({"value": 42}))
            .await
            .unwrap();
        assert_eq!(reply, json!({"value": 42}));
        session.close();
    }

    #[tokio::test]
    async fn unknown_command_is_a_negative_ack() {
        let server = RpcServer::new();
        let (addr, _shutdown) = start_server(server).await;

        let session = connect("127.0.0.1", addr.port()).await.unwrap();
        let err = session.invoke("nope", Value::Null).await.unwrap_err();
        match err {
            RpcError::Remote(message) => assert!(message.contains("unknown command")),
            other => panic!("expected Remote, got {other:?}"),
        }
        // The session survives a failed command.
        assert!(session.connected());
        session.close();
    }

    #[tokio::test]
    async fn handler_error_surfaces_as_remote_error() {
        let server = RpcServer::new();
        server.register("fail", Arc::new(FailCommand));
        let (addr, _shutdown) = start_server(server).await;

        let session = connect("127.0.0.1", addr.port()).await.unwrap();
        let err = session.invoke("fail", Value::Null).await.unwrap_err();
        match err {
            RpcError::Remote(message) => assert!(message.contains("bad input")),
            other => panic!("expected Remote, got {other:?}"),
        }
        session.close();
    }

    #[tokio::test]
    async fn notify_runs_the_handler_without_a_response() {
        let hits = Arc::new(AtomicUsize::new(0));
        let server = RpcServer::new();
        server.register("count", Arc::new(CountCommand { hits: hits.clone() }));
        let (addr, _shutdown) = start_server(server).await;

        let session = connect("127.0.0.1", addr.port()).await.unwrap();
        session.notify("count", Value::Null).unwrap();
        session.notify("count", Value::Null).unwrap();

        let server_hits = hits.clone();
        timeout(Duration::from_secs(2), async move {
            while server_hits.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("notifies never reached the handler");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        session.close();
    }

    #[tokio::test]
    async fn push_messages_reach_registered_listeners() {
        let server = RpcServer::new();
        server.register("pushback", Arc::new(PushBackCommand));
        let (addr, _shutdown) = start_server(server).await;

        let session = connect("127.0.0.1", addr.port()).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.on_push(Arc::new(ChannelPushListener { tx })).await;

        session
            .invoke("pushback", json!({"note": "hello"}))
            .await
            .unwrap();

        let pushed = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("push never arrived")
            .unwrap();
        assert_eq!(pushed, json!({"note": "hello"}));
        session.close();
    }

    #[tokio::test]
    async fn close_fails_pending_invokes_and_fires_disconnect() {
        let server = RpcServer::new();
        server.register("hang", Arc::new(HangCommand));
        let (addr, _shutdown) = start_server(server).await;

        let session = connect("127.0.0.1", addr.port()).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        session
            .on_disconnect(Arc::new(ChannelDisconnectListener { tx }))
            .await;

        let pending = {
            let session = session.clone();
            tokio::spawn(async move { session.invoke("hang", Value::Null).await })
        };
        // Let the invoke get onto the wire before closing.
        tokio::time::sleep(Duration::from_millis(50)).await;
        session.close();

        let result = timeout(Duration::from_secs(2), pending)
            .await
            .expect("pending invoke never resolved")
            .unwrap();
        assert!(matches!(result, Err(RpcError::Closed)));

        let fired = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("disconnect listener never fired");
        assert!(fired.is_some());
        assert!(!session.connected());
    }

    #[tokio::test]
    async fn repeated_close_fires_disconnect_exactly_once() {
        let server = RpcServer::new();
        let (addr, _shutdown) = start_server(server).await;

        let session = connect("127.0.0.1", addr.port()).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        session
            .on_disconnect(Arc::new(ChannelDisconnectListener { tx }))
            .await;

        session.close();
        session.close();

        let fired = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("disconnect listener never fired")
            .expect("listener channel dropped");
        // Locally-initiated close carries no transport error.
        assert!(fired.is_none());
        assert!(!session.connected());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn disconnect_listener_added_late_fires_immediately() {
        let server = RpcServer::new();
        let (addr, _shutdown) = start_server(server).await;

        let session = connect("127.0.0.1", addr.port()).await.unwrap();
        session.close();
        // Wait for the reader task to observe the close.
        timeout(Duration::from_secs(2), async {
            while session.connected() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        session
            .on_disconnect(Arc::new(ChannelDisconnectListener { tx }))
            .await;
        let fired = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("late disconnect listener never fired")
            .expect("listener channel dropped");
        assert!(fired.is_none());
    }

    #[tokio::test]
    async fn invoke_once_connects_calls_and_closes() {
        let server = RpcServer::new();
        server.register("echo", Arc::new(EchoCommand));
        let (addr, _shutdown) = start_server(server).await;

        let reply = invoke_once("127.0.0.1", addr.port(), "echo", json!("ping"))
            .await
            .unwrap();
        assert_eq!(reply, json!("ping"));
    }

    #[tokio::test]
    async fn connecting_to_a_dead_port_is_connection_refused() {
        // Bind and immediately drop to get a port nothing listens on.
        let port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };

        let err = connect("127.0.0.1", port).await.unwrap_err();
        assert!(matches!(err, RpcError::ConnectionRefused(_)));
    }

    #[tokio::test]
    async fn serve_without_bind_is_rejected() {
        let server = RpcServer::new();
        let (_tx, rx) = broadcast::channel(1);
        let err = server.serve(rx).await.unwrap_err();
        assert!(matches!(err, RpcError::NotBound));
    }
}
