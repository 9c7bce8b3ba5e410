//! Nutrack Loopback - development backend speaking both transports.
//!
//! With `USE_ELECTRON_IPC=1` it answers request frames on stdin/stdout,
//! otherwise it serves HTTP and prints `BACKEND_PORT=<port>` once bound.
//! Every request is echoed back, apart from a few control endpoints:
//!
//! - `POST /broadcast` pushes `data.message` to every listener
//! - `/dropbox/upload-database`, `/dropbox/download-database` acknowledge
//! - `/fail` answers with a backend error
//! - `/slow/<ms>` answers after a delay
//! - `POST /exit` exits the process with `data.code` shortly after answering

use anyhow::Result;
use clap::Parser;
use nutrack_bridge::config::PipeConfig;
use nutrack_bridge::server::{
    start_http_server, BackendRequest, Broadcaster, Dispatch, SseBroadcaster, StdioServer,
};
use nutrack_bridge::BridgeError;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "nutrack-loopback")]
#[command(about = "Echo backend for exercising the Nutrack bridge")]
struct Args {
    /// Port to listen on in HTTP mode (0 = auto-assign)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Host to bind to in HTTP mode
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

/// Echo handlers plus the control endpoints.
#[derive(Default)]
struct Loopback {
    broadcaster: OnceLock<Arc<dyn Broadcaster>>,
}

impl Loopback {
    fn broadcast(&self, message: Value) -> Result<Value, BridgeError> {
        let broadcaster = self
            .broadcaster
            .get()
            .ok_or_else(|| BridgeError::remote("No broadcaster initialized"))?;
        broadcaster.broadcast(message.clone());
        Ok(json!({"broadcast": message}))
    }
}

#[async_trait::async_trait]
impl Dispatch for Loopback {
    async fn dispatch(&self, request: BackendRequest) -> nutrack_bridge::Result<Value> {
        match request.segments().as_slice() {
            ["broadcast"] => {
                let message = request.data.get("message").cloned().unwrap_or(Value::Null);
                self.broadcast(message)
            }
            ["dropbox", "upload-database"] => {
                Ok(json!({"message": "Database uploaded to Dropbox"}))
            }
            ["dropbox", "download-database"] => {
                Ok(json!({"message": "Database downloaded from Dropbox"}))
            }
            ["fail", ..] => Err(BridgeError::remote("Loopback failure requested")),
            ["slow", millis] => {
                let millis: u64 = millis
                    .parse()
                    .map_err(|_| BridgeError::remote("Invalid delay"))?;
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Ok(json!({"slept": millis}))
            }
            ["exit"] => {
                let code = request.data.get("code").and_then(Value::as_i64).unwrap_or(0) as i32;
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    info!("Exiting with code {}", code);
                    std::process::exit(code);
                });
                Ok(json!({"exiting": code}))
            }
            _ => Ok(json!({
                "method": request.method.as_str(),
                "path": request.path(),
                "data": request.data.clone(),
            })),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Stdout is reserved for protocol frames; logs go to stderr.
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    let use_pipe = std::env::var(PipeConfig::ENV_PIPE_MODE).as_deref() == Ok("1");
    if let Ok(dir) = std::env::var(PipeConfig::ENV_DATA_DIR) {
        info!("Data directory: {}", dir);
    }

    let loopback = Arc::new(Loopback::default());

    if use_pipe {
        info!("Initializing broadcaster with stdio");
        let server = StdioServer::new(loopback.clone(), tokio::io::stdout());
        let _ = loopback.broadcaster.set(Arc::new(server.broadcaster()));
        server.serve(tokio::io::stdin()).await?;
        return Ok(());
    }

    info!("Initializing broadcaster with SSE");
    let broadcaster = SseBroadcaster::new();
    let _ = loopback.broadcaster.set(Arc::new(broadcaster.clone()));

    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let actual_addr = start_http_server(loopback, broadcaster, addr).await?;

    // Print port for the host to read (intentional stdout)
    println!("BACKEND_PORT={}", actual_addr.port());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");
    Ok(())
}
