//! Tunnelgate node
//!
//! Serves HTTP on one address: tunnel handshakes on the configured WebSocket
//! path, and every other request is resolved to a target and relayed through
//! the tunnel to the peer node, which executes it and sends the answer back.
//! An optional second address accepts tunnel connections only.

mod config;
mod server;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use tunnelgate_control::{Hub, ReconnectSupervisor, TunnelContext};
use tunnelgate_crypto::Pipeline;
use tunnelgate_transport_websocket::WebSocketListener;

use crate::config::{FileConfig, NodeConfig, Overrides};

const STATS_INTERVAL: Duration = Duration::from_secs(10);
const LOG_FILE_PREFIX: &str = "tunnelgate.log";

/// Reverse-tunnel HTTP proxy node
#[derive(Parser, Debug)]
#[command(name = "tunnelgate")]
#[command(about = "Relay HTTP requests through an encrypted WebSocket tunnel")]
#[command(version)]
#[command(long_about = r#"
Tunnelgate relays HTTP requests between two nodes over a single encrypted
WebSocket connection. One node dials the other (set peer_addr); either side
can forward requests, and the other side executes them against the target.

EXAMPLES:
  # Accepting node
  tunnelgate --config gate.yaml

  # Initiating node, overriding the peer from the command line
  tunnelgate --config edge.yaml --peer-addr ws://gate.internal:8080/ws

ENVIRONMENT VARIABLES:
  TUNNELGATE_CONFIG      Configuration file path
  TUNNELGATE_SELF_ADDR   Listen address
  TUNNELGATE_PEER_ADDR   Peer to dial (ws://host:port/path)
  TUNNELGATE_TUNNEL_ADDR Extra listen address for tunnel connections only
  TUNNELGATE_LOG_LEVEL   Log filter
  TUNNELGATE_LOG_DIR     Directory for daily log files
"#)]
struct Args {
    /// Configuration file (YAML)
    #[arg(long, short = 'c', env = "TUNNELGATE_CONFIG", default_value = "tunnelgate.yaml")]
    config: PathBuf,

    /// HTTP and tunnel listen address (e.g., 0.0.0.0:8080)
    #[arg(long, env = "TUNNELGATE_SELF_ADDR")]
    self_addr: Option<String>,

    /// Peer to dial (e.g., ws://peer.example.com:8080/ws)
    #[arg(long, env = "TUNNELGATE_PEER_ADDR")]
    peer_addr: Option<String>,

    /// Dedicated tunnel listen address (e.g., 0.0.0.0:9443)
    #[arg(long, env = "TUNNELGATE_TUNNEL_ADDR")]
    tunnel_addr: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "TUNNELGATE_LOG_LEVEL")]
    log_level: Option<String>,

    /// Also write logs to daily files in this directory
    #[arg(long, env = "TUNNELGATE_LOG_DIR")]
    log_dir: Option<PathBuf>,
}

/// Daily rolling log file in `dir`, written from a background thread.
/// Buffered lines are flushed when the guard drops.
fn open_log_file(dir: &Path) -> Result<(NonBlocking, WorkerGuard)> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
    let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
    Ok(tracing_appender::non_blocking(appender))
}

/// Setup logging with the specified log level, to stdout and optionally to
/// files under `log_dir`
fn setup_logging(log_level: &str, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let (writer, guard) = open_log_file(dir)?;
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(file_layer)
        .with(filter)
        .init();

    Ok(guard)
}

async fn run(node: NodeConfig) -> Result<()> {
    let context = Arc::new(TunnelContext::new(Pipeline::new(node.key), node.settings));
    let hub = Hub::new(context).context("Failed to create tunnel hub")?;

    let shutdown = CancellationToken::new();
    let mut tasks = vec![
        tokio::spawn(Arc::clone(&hub).run(shutdown.clone())),
        tokio::spawn(Arc::clone(&hub).run_stats(STATS_INTERVAL, shutdown.clone())),
    ];

    match node.peer_url {
        Some(peer_url) => {
            info!(peer = %peer_url, "Dialing peer");
            let supervisor = ReconnectSupervisor::new(Arc::clone(&hub), peer_url);
            tasks.push(tokio::spawn(supervisor.run(shutdown.clone())));
        }
        None => info!("No peer configured, waiting for inbound tunnel connections"),
    }

    let listener = TcpListener::bind(node.self_addr)
        .await
        .with_context(|| format!("Failed to bind {}", node.self_addr))?;
    info!(
        "Listening on {} (tunnel path {}, {} proxy rules)",
        listener.local_addr()?,
        hub.context().settings().websocket.path,
        node.rules.len()
    );

    if let Some(tunnel_addr) = node.tunnel_addr {
        let websocket = Arc::new(hub.context().settings().websocket.clone());
        let tunnel_listener = WebSocketListener::bind(tunnel_addr, websocket)
            .await
            .with_context(|| format!("Failed to bind tunnel listener {}", tunnel_addr))?;
        tasks.push(tokio::spawn(server::accept_tunnels(
            tunnel_listener,
            Arc::clone(&hub),
            shutdown.clone(),
        )));
    }

    let app = server::router(Arc::clone(&hub), Arc::new(node.rules));

    let signal_token = shutdown.clone();
    let signal_hub = Arc::clone(&hub);
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received, stopping..."),
            Err(err) => error!("Error listening for shutdown signal: {}", err),
        }
        signal_token.cancel();
        // Fail in-flight forwards now instead of waiting out their deadlines
        signal_hub.close_all().await;
    });

    server::serve(listener, app, shutdown.clone()).await?;

    shutdown.cancel();
    hub.close_all().await;
    for task in tasks {
        let _ = task.await;
    }

    info!("Tunnelgate stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let node = FileConfig::load(&args.config)?
        .resolve(Overrides {
            self_addr: args.self_addr,
            peer_addr: args.peer_addr,
            tunnel_addr: args.tunnel_addr,
            log_level: args.log_level,
            log_dir: args.log_dir,
        })
        .context("Invalid configuration")?;

    let _log_guard = setup_logging(&node.log_level, node.log_dir.as_deref())?;

    info!("Tunnelgate starting...");

    run(node).await
}
