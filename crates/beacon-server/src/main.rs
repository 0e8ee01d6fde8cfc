//! Beacon pub/sub server - entry point.

use anyhow::Result;
use beacon_server::{Server, ServerConfig};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Real-time pub/sub WebSocket server
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via BEACON_CONFIG env var)
    #[arg(short, long)]
    config: Option<String>,

    /// Listen address, overriding `server.bind_addr`
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Config first: it carries the log filter.
    let config_path = ServerConfig::resolve_path(args.config);
    let mut config = ServerConfig::load(&config_path)?;
    if let Some(bind) = args.bind {
        config.server.bind_addr = bind;
    }

    beacon_telemetry::init_logging(&config.telemetry.log_filter)?;
    info!("Starting beacon v{}", env!("CARGO_PKG_VERSION"));
    info!(
        config_path = %config_path,
        bind_addr = %config.server.bind_addr,
        max_clients = config.server.max_clients,
        "Configuration loaded"
    );

    let server = Server::bind(config).await?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => signal.cancel(),
            Err(e) => error!(error = %e, "Failed to listen for Ctrl-C"),
        }
    });

    let summary = server.run(shutdown).await?;
    info!(
        uptime_secs = summary.uptime_secs,
        messages_total = summary.messages_total,
        "Server stopped"
    );
    Ok(())
}
