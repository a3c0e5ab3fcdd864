//! vless-proxy binary
//!
//! Usage: vless-proxy --config <FILE> [--listen-port <PORT>] [--verbose]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use vless_proxy::{Config, Dispatcher, TracingSink, WsConnector};

/// Local SOCKS5/HTTP proxy over VLESS-over-WebSocket.
#[derive(Parser, Debug)]
#[command(name = "vless-proxy", version, about)]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Override the configured listen port
    #[arg(short = 'p', long)]
    listen_port: Option<u16>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    let mut config = Config::from_file(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    if let Some(port) = args.listen_port {
        config.listen_port = port;
    }
    let config = Arc::new(config);

    tracing::info!(
        "Upstream {}:{} ({})",
        config.server,
        config.port,
        if config.uses_tls() { "tls" } else { "plain" }
    );

    let connector = Arc::new(WsConnector::new(Arc::clone(&config))?);
    let dispatcher = Dispatcher::bind(config, connector, Arc::new(TracingSink)).await?;

    dispatcher
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    Ok(())
}
