//! Forward HTTP/HTTPS proxy.
//!
//! ```text
//!   client ──▶ :8080 ──▶ Dispatcher ──┬── CONNECT ──▶ Relay ◀──▶ origin (opaque bytes)
//!                                     └── GET/POST/… ──▶ origin request ──▶ response streamed back
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;

use forward_proxy::config::{load_config, ProxyConfig, LISTEN_ADDRESS};
use forward_proxy::observability::{logging, metrics};
use forward_proxy::{ProxyServer, Shutdown};

/// How long shutdown waits for in-flight cycles.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "forward-proxy")]
#[command(about = "Forward HTTP proxy with CONNECT tunneling", long_about = None)]
struct Cli {
    /// Optional TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };

    logging::init_logging(&config.observability);
    tracing::info!("forward-proxy v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        config_file = ?cli.config,
        max_connections = config.listener.max_connections,
        chunk_size = config.relay.chunk_size,
        relay_timeout_secs = config.relay.timeout_secs,
        header_policy = ?config.upstream.header_policy,
        "Configuration loaded"
    );

    if let Some(addr) = &config.observability.metrics_address {
        // Validation already checked the address.
        metrics::init_metrics(addr.parse()?)?;
    }

    let listener = TcpListener::bind(LISTEN_ADDRESS).await?;
    tracing::info!(address = %listener.local_addr()?, "Proxy server running");

    let shutdown = Shutdown::new();
    let shutdown_rx = shutdown.subscribe();
    shutdown.trigger_on_ctrl_c();

    let server = ProxyServer::new(config);
    let tracker = server.tracker();
    server.run(listener, shutdown_rx).await?;

    if !tracker.wait_idle(DRAIN_TIMEOUT).await {
        tracing::warn!(
            active_connections = tracker.active_count(),
            "Drain timeout reached, exiting with open connections"
        );
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
