//! # Relay Remote Module Peer
//!
//! Demonstration peer that registers itself with a running relay host as a
//! remote module. It serves the peer half of the remote module protocol:
//! - `hello`: reachability probe, answered with the peer's name
//! - `setup`: replies with the event names it wants forwarded
//! - `event`: receives forwarded event envelopes and logs them
//! - `teardown`: acknowledged when the host unloads the module
//!
//! After binding its own endpoint the peer dials the host's `load_module`
//! command. The announce connection stays open so the host re-logs pushed
//! log records under the peer's name and auto-unloads the module when the
//! connection drops.

use clap::Parser;
use relay_rpc::{connect, CommandHandler, DisconnectListener, RpcError, RpcServer, RpcSession};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "remote-peer")]
#[command(about = "Relay remote module demonstration peer")]
struct Args {
    /// Logical module name to register under
    #[arg(short, long, default_value = "peer")]
    name: String,

    /// Address of the running relay host (host:port)
    #[arg(short, long, default_value = "127.0.0.1:9005")]
    connect: String,

    /// Local port to serve the peer protocol on (0 picks a free port)
    #[arg(short, long, default_value = "0")]
    listen: u16,

    /// Event names to subscribe to, comma separated
    #[arg(short, long, default_value = "module_load,module_unload")]
    events: String,
}

/// Answers the host's reachability probe.
struct Hello {
    name: String,
}

#[async_trait::async_trait]
impl CommandHandler for Hello {
    async fn handle(&self, _session: &RpcSession, _data: Value) -> Result<Value, RpcError> {
        Ok(json!({ "hello": self.name }))
    }
}

/// Replies with the event names this peer wants forwarded.
struct Setup {
    events: Vec<String>,
}

#[async_trait::async_trait]
impl CommandHandler for Setup {
    async fn handle(&self, _session: &RpcSession, _data: Value) -> Result<Value, RpcError> {
        info!("🔧 Host ran our setup; subscribing to {:?}", self.events);
        Ok(json!({ "events": self.events }))
    }
}

/// Receives forwarded event envelopes.
struct EventSink;

#[async_trait::async_trait]
impl CommandHandler for EventSink {
    async fn handle(&self, _session: &RpcSession, data: Value) -> Result<Value, RpcError> {
        let name = data.get("t").and_then(Value::as_str).unwrap_or("?");
        let fields = data.get("d").cloned().unwrap_or(Value::Null);
        info!("📨 Event '{}': {}", name, fields);
        Ok(Value::Null)
    }
}

/// Acknowledges the host unloading us.
struct Teardown;

#[async_trait::async_trait]
impl CommandHandler for Teardown {
    async fn handle(&self, _session: &RpcSession, _data: Value) -> Result<Value, RpcError> {
        info!("📤 Host tore the module down");
        Ok(Value::Null)
    }
}

/// Exits when the announce connection to the host goes away.
struct HostGone;

#[async_trait::async_trait]
impl DisconnectListener for HostGone {
    async fn on_disconnect(&self, error: Option<String>) {
        match error {
            Some(e) => warn!("🔴 Lost connection to host: {}", e),
            None => info!("🔌 Host closed the connection"),
        }
        std::process::exit(0);
    }
}

fn split_host_port(addr: &str) -> Result<(String, u16), Box<dyn std::error::Error>> {
    let Some((host, port)) = addr.rsplit_once(':') else {
        return Err(format!("expected host:port, got '{addr}'").into());
    };
    Ok((host.to_string(), port.parse()?))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();
    let events: Vec<String> = args
        .events
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    info!("🚀 Starting remote module peer '{}'", args.name);

    // Serve the peer half of the protocol.
    let mut server = RpcServer::new();
    server.register(
        "hello",
        Arc::new(Hello {
            name: args.name.clone(),
        }),
    );
    server.register(
        "setup",
        Arc::new(Setup {
            events: events.clone(),
        }),
    );
    server.register("event", Arc::new(EventSink));
    server.register("teardown", Arc::new(Teardown));

    let local = server.bind(&format!("127.0.0.1:{}", args.listen)).await?;
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(server.serve(shutdown_rx));
    info!("🔌 Serving peer protocol on {}", local);

    // Announce ourselves to the host.
    let (host, port) = split_host_port(&args.connect)?;
    let session = connect(&host, port).await?;
    session.on_disconnect(Arc::new(HostGone)).await;

    let announce = session
        .invoke(
            "load_module",
            json!({
                "name": args.name,
                "host": "127.0.0.1",
                "port": local.port(),
            }),
        )
        .await;

    if let Err(e) = announce {
        error!("❌ Host rejected registration: {}", e);
        return Err(e.into());
    }
    info!("🎉 Registered with {} as module '{}'", args.connect, args.name);

    // Log records pushed here are re-logged by the host under our name.
    session.push(json!({ "level": "info", "message": "peer online" }))?;

    // Stay registered until interrupted; the host auto-unloads the module
    // when the announce connection drops.
    tokio::signal::ctrl_c().await?;
    info!("🛑 Interrupted; disconnecting from host");
    session.close();
    let _ = shutdown_tx.send(());

    Ok(())
}
