//! Nutrack Host - command-line shell around the bridge.
//!
//! Loads `config.json`, starts the bridge (spawning the backend in pipe
//! mode), then either issues one call or watches push events and answers
//! sync conflicts in the terminal.

mod prompt;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nutrack_bridge::config::PathsConfig;
use nutrack_bridge::{Bridge, BridgeSettings, LogicalRequest, Method};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// How long to wait for the backend after asking it to stop.
const EXIT_WAIT: Duration = Duration::from_secs(3);

#[derive(Parser, Debug)]
#[command(name = "nutrack-host")]
#[command(about = "Talk to the Nutrack backend over HTTP or its stdio pipe")]
struct Args {
    /// Path to config.json
    #[arg(short, long, default_value = PathsConfig::CONFIG_FILE_NAME)]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Force the HTTP transport
    #[arg(long, conflicts_with = "pipe")]
    http: bool,

    /// Force the pipe transport
    #[arg(long)]
    pipe: bool,

    /// Backend executable to spawn (pipe mode)
    #[arg(long)]
    backend: Option<PathBuf>,

    /// Backend base URL (HTTP mode)
    #[arg(long)]
    backend_url: Option<String>,

    /// Data directory handed to the backend
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Issue one call and print the JSON result
    Call {
        /// GET, POST, PUT or DELETE
        method: String,
        /// Endpoint path, e.g. /foodItems
        endpoint: String,
        /// Path segments (or query fragments for search endpoints)
        params: Vec<String>,
        /// JSON body
        #[arg(long)]
        body: Option<String>,
    },
    /// Print push events and prompt on sync conflicts until interrupted
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Stdout carries results; logs go to stderr.
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    let settings = settings_from_args(&args)?;
    info!(
        "Starting Nutrack host ({} transport)",
        if settings.use_pipe { "pipe" } else { "http" }
    );

    let bridge = Bridge::start(settings).context("Failed to start bridge")?;

    let outcome = match args.command {
        Command::Call {
            method,
            endpoint,
            params,
            body,
        } => run_call(&bridge, &method, endpoint, params, body).await,
        Command::Watch => run_watch(&bridge).await,
    };

    bridge.shutdown();
    if bridge.supervisor().is_some()
        && tokio::time::timeout(EXIT_WAIT, bridge.wait_for_backend_exit())
            .await
            .is_err()
    {
        warn!("Backend did not exit within {:?}", EXIT_WAIT);
    }

    outcome
}

fn settings_from_args(args: &Args) -> Result<BridgeSettings> {
    let mut settings = BridgeSettings::load(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;

    if args.http {
        settings = settings.with_pipe(false);
    }
    if args.pipe {
        settings = settings.with_pipe(true);
    }
    if let Some(url) = &args.backend_url {
        settings = settings.with_backend_url(url);
    }
    if let Some(path) = &args.backend {
        settings = settings.with_backend_executable(path);
    }
    if let Some(dir) = &args.data_dir {
        settings = settings.with_data_dir(dir);
    }

    settings.validate()?;
    Ok(settings)
}

async fn run_call(
    bridge: &Bridge,
    method: &str,
    endpoint: String,
    params: Vec<String>,
    body: Option<String>,
) -> Result<()> {
    let method: Method = method.parse()?;
    let mut request = LogicalRequest::new(method, endpoint).with_params(params);
    if let Some(body) = body {
        let body: Value = serde_json::from_str(&body).context("--body is not valid JSON")?;
        request = request.with_body(body);
    }

    let result = bridge.call(request).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn run_watch(bridge: &Bridge) -> Result<()> {
    let _events = bridge.subscribe(|event| {
        println!("{}", event);
    });
    let _conflicts = bridge.conflict_coordinator(Arc::new(prompt::TerminalSurface));

    let mut state = bridge.push().watch_state();
    let state_log = async {
        while state.changed().await.is_ok() {
            info!("Push channel: {:?}", *state.borrow());
        }
        std::future::pending::<()>().await
    };

    let backend_exit = async {
        match bridge.supervisor() {
            Some(supervisor) => supervisor.wait_for_exit().await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutdown signal received, exiting");
        }
        exit = backend_exit => {
            warn!("Backend exited ({:?}), stopping", exit);
        }
        _ = state_log => {}
    }

    Ok(())
}
