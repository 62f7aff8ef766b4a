//! Relay RPC - WebSocket JSON RPC for host/peer bridging
//!
//! A small request/response protocol over WebSocket text frames, used to
//! reach modules running in other processes. Three frame shapes travel in
//! both directions:
//!
//! - **Request** `{id, cmd, data}`: invoke a named command; `id: 0` means
//!   fire-and-forget
//! - **Response** `{id, ok, data}`: positive or negative acknowledgement,
//!   correlated by id
//! - **Push** `{push}`: one-way message outside the request/response cycle
//!
//! Either side may serve commands; [`RpcServer`] accepts connections and
//! routes requests through its command table, while [`connect`] dials out
//! and yields a session for invoking the other side.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use relay_rpc::{CommandHandler, RpcError, RpcServer, RpcSession};
//! use relay_rpc::async_trait;
//! use serde_json::{json, Value};
//! use std::sync::Arc;
//!
//! struct Hello;
//!
//! #[async_trait]
//! impl CommandHandler for Hello {
//!     async fn handle(&self, _session: &RpcSession, _data: Value) -> Result<Value, RpcError> {
//!         Ok(json!({"hello": true}))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), RpcError> {
//!     let mut server = RpcServer::new();
//!     server.register("hello", Arc::new(Hello));
//!     server.bind("127.0.0.1:9010").await?;
//!     let (_tx, rx) = tokio::sync::broadcast::channel(1);
//!     server.serve(rx).await
//! }
//! ```

pub mod client;
pub mod error;
pub mod frame;
pub mod server;
pub mod session;

pub use client::{connect, invoke_once};
pub use error::RpcError;
pub use frame::{Frame, NOTIFY_ID};
pub use server::{CommandHandler, RpcServer};
pub use session::{DisconnectListener, PushListener, RpcSession};

// External dependencies that command handlers commonly need
pub use async_trait::async_trait;
pub use serde_json::Value;
