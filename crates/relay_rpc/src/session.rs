//! RPC session handling.
//!
//! An [`RpcSession`] wraps one live WebSocket connection, accepted or dialed.
//! It owns a writer task (single owner of the sink half) and a reader task
//! that dispatches incoming frames: responses are correlated back to pending
//! invokes by id, requests are routed through the command table when this
//! side has one, and pushes go to registered push listeners.
//!
//! When the reader ends (peer close, transport error, or local `close()`),
//! every pending invoke fails with [`RpcError::Closed`] and the disconnect
//! listeners fire exactly once.

use crate::error::RpcError;
use crate::frame::{Frame, NOTIFY_ID};
use crate::server::CommandTable;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, warn};

pub(crate) type WsStream = WebSocketStream<TcpStream>;

/// Listener for one-way push messages arriving on a session.
#[async_trait]
pub trait PushListener: Send + Sync {
    async fn on_push(&self, data: Value);
}

/// Listener fired exactly once when a session ends.
///
/// `error` carries the transport failure when the session was lost rather
/// than closed cleanly.
#[async_trait]
pub trait DisconnectListener: Send + Sync {
    async fn on_disconnect(&self, error: Option<String>);
}

/// One live RPC connection. Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct RpcSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    peer: String,
    outbound: mpsc::UnboundedSender<Message>,
    pending: DashMap<u64, oneshot::Sender<(bool, Value)>>,
    next_id: AtomicU64,
    connected: AtomicBool,
    disconnect_fired: AtomicBool,
    push_listeners: RwLock<Vec<Arc<dyn PushListener>>>,
    disconnect_listeners: RwLock<Vec<Arc<dyn DisconnectListener>>>,
    commands: Option<Arc<CommandTable>>,
}

impl fmt::Debug for RpcSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcSession")
            .field("peer", &self.inner.peer)
            .field("connected", &self.connected())
            .finish()
    }
}

impl RpcSession {
    /// Starts the writer and reader tasks for an established WebSocket.
    ///
    /// `commands` is present on accepted sessions (the server side routes
    /// inbound requests through it) and absent on dialed ones.
    pub(crate) fn spawn(
        stream: WsStream,
        peer: String,
        commands: Option<Arc<CommandTable>>,
    ) -> Self {
        let (mut ws_sender, mut ws_receiver) = stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

        let inner = Arc::new(SessionInner {
            peer: peer.clone(),
            outbound,
            pending: DashMap::new(),
            next_id: AtomicU64::new(NOTIFY_ID + 1),
            connected: AtomicBool::new(true),
            disconnect_fired: AtomicBool::new(false),
            push_listeners: RwLock::new(Vec::new()),
            disconnect_listeners: RwLock::new(Vec::new()),
            commands,
        });

        // Writer task: single owner of the sink half.
        let writer_peer = peer;
        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = ws_sender.send(message).await {
                    debug!("🔌 RPC write to {} failed: {}", writer_peer, e);
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        // Reader task: dispatches frames until the connection ends.
        let session = Self { inner };
        let reader = session.clone();
        tokio::spawn(async move {
            let mut transport_error = None;
            while let Some(message) = ws_receiver.next().await {
                match message {
                    Ok(Message::Text(text)) => reader.dispatch_text(&text).await,
                    Ok(Message::Ping(data)) => {
                        let _ = reader.inner.outbound.send(Message::Pong(data));
                    }
                    Ok(Message::Close(_)) => {
                        debug!("🔌 Peer {} requested close", reader.inner.peer);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        transport_error = Some(e.to_string());
                        break;
                    }
                }
            }
            reader.finish(transport_error).await;
        });

        session
    }

    /// Address of the peer, for logs.
    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    /// True until the session is closed or the transport drops.
    pub fn connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Invokes `cmd` on the peer and waits for the correlated response.
    ///
    /// A negative acknowledgement surfaces as [`RpcError::Remote`]; a session
    /// that ends before the response arrives surfaces as [`RpcError::Closed`].
    pub async fn invoke(&self, cmd: &str, data: Value) -> Result<Value, RpcError> {
        if !self.connected() {
            return Err(RpcError::Closed);
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner.pending.insert(id, reply_tx);
        if !self.connected() {
            // The reader may have drained `pending` right before our insert.
            self.inner.pending.remove(&id);
            return Err(RpcError::Closed);
        }

        let frame = Frame::Request {
            id,
            cmd: cmd.to_string(),
            data,
        };
        if let Err(e) = self.send_frame(&frame) {
            self.inner.pending.remove(&id);
            return Err(e);
        }

        match reply_rx.await {
            Ok((true, value)) => Ok(value),
            Ok((false, value)) => Err(RpcError::Remote(match value {
                Value::String(text) => text,
                other => other.to_string(),
            })),
            Err(_) => Err(RpcError::Closed),
        }
    }

    /// Sends `cmd` with the reserved fire-and-forget id; no response frame
    /// will come back.
    pub fn notify(&self, cmd: &str, data: Value) -> Result<(), RpcError> {
        if !self.connected() {
            return Err(RpcError::Closed);
        }
        self.send_frame(&Frame::Request {
            id: NOTIFY_ID,
            cmd: cmd.to_string(),
            data,
        })
    }

    /// Sends a one-way push message to the peer.
    pub fn push(&self, data: Value) -> Result<(), RpcError> {
        if !self.connected() {
            return Err(RpcError::Closed);
        }
        self.send_frame(&Frame::Push { push: data })
    }

    /// Registers a listener for push messages from the peer.
    pub async fn on_push(&self, listener: Arc<dyn PushListener>) {
        self.inner.push_listeners.write().await.push(listener);
    }

    /// Registers a listener fired exactly once when the session ends.
    ///
    /// A listener registered after the session already ended is invoked
    /// immediately.
    pub async fn on_disconnect(&self, listener: Arc<dyn DisconnectListener>) {
        if self.inner.disconnect_fired.load(Ordering::SeqCst) {
            tokio::spawn(async move { listener.on_disconnect(None).await });
            return;
        }
        self.inner.disconnect_listeners.write().await.push(listener);
    }

    /// Closes the session. Safe to call more than once.
    pub fn close(&self) {
        if self.inner.connected.swap(false, Ordering::SeqCst) {
            debug!("🔌 Closing RPC session with {}", self.inner.peer);
            let _ = self.inner.outbound.send(Message::Close(None));
            // The reader only ends once the peer echoes the close, which a
            // peer that never polls its sink again will not do. Drive the
            // teardown from here; the reader's own `finish` becomes a no-op.
            let session = self.clone();
            tokio::spawn(async move { session.finish(None).await });
        }
    }

    fn send_frame(&self, frame: &Frame) -> Result<(), RpcError> {
        let text = serde_json::to_string(frame)?;
        self.inner
            .outbound
            .send(Message::Text(text.into()))
            .map_err(|_| RpcError::Closed)
    }

    async fn dispatch_text(&self, text: &str) {
        let frame: Frame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("⚠️ Malformed frame from {}: {}", self.inner.peer, e);
                return;
            }
        };

        match frame {
            Frame::Response { id, ok, data } => {
                if let Some((_, reply)) = self.inner.pending.remove(&id) {
                    let _ = reply.send((ok, data));
                } else {
                    debug!(
                        "Response for unknown request {} from {}",
                        id, self.inner.peer
                    );
                }
            }
            Frame::Request { id, cmd, data } => self.dispatch_request(id, cmd, data),
            Frame::Push { push } => {
                let listeners = self.inner.push_listeners.read().await.clone();
                if listeners.is_empty() {
                    debug!("📭 Push from {} with no listeners", self.inner.peer);
                    return;
                }
                tokio::spawn(async move {
                    for listener in listeners {
                        listener.on_push(push.clone()).await;
                    }
                });
            }
        }
    }

    fn dispatch_request(&self, id: u64, cmd: String, data: Value) {
        let handler = self
            .inner
            .commands
            .as_ref()
            .and_then(|table| table.get(cmd.as_str()).map(|entry| entry.value().clone()));

        let Some(handler) = handler else {
            warn!("❓ Unknown command '{}' from {}", cmd, self.inner.peer);
            if id != NOTIFY_ID {
                self.answer(id, false, Value::String(format!("unknown command: {cmd}")));
            }
            return;
        };

        // One task per request so a slow handler never stalls the reader.
        let session = self.clone();
        tokio::spawn(async move {
            match handler.handle(&session, data).await {
                Ok(value) => {
                    if id != NOTIFY_ID {
                        session.answer(id, true, value);
                    }
                }
                Err(e) => {
                    error!(
                        "❌ Command '{}' from {} failed: {}",
                        cmd, session.inner.peer, e
                    );
                    if id != NOTIFY_ID {
                        session.answer(id, false, Value::String(e.to_string()));
                    }
                }
            }
        });
    }

    fn answer(&self, id: u64, ok: bool, data: Value) {
        if let Err(e) = self.send_frame(&Frame::Response { id, ok, data }) {
            debug!(
                "Could not answer request {} for {}: {}",
                id, self.inner.peer, e
            );
        }
    }

    async fn finish(&self, error: Option<String>) {
        self.inner.connected.store(false, Ordering::SeqCst);
        // Wake every pending invoke with a closed-session failure.
        self.inner.pending.clear();

        if self.inner.disconnect_fired.swap(true, Ordering::SeqCst) {
            return;
        }
        match &error {
            Some(e) => info!("🔌 RPC session with {} lost: {}", self.inner.peer, e),
            None => debug!("🔌 RPC session with {} closed", self.inner.peer),
        }
        let listeners = self.inner.disconnect_listeners.read().await.clone();
        for listener in listeners {
            listener.on_disconnect(error.clone()).await;
        }
    }
}
