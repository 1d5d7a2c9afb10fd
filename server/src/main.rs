use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;
use tracing::info;

use confab_server::{Server, ServerConfig};

/// Encrypted chat relay server
#[derive(Parser, Debug)]
#[command(name = "confab-server", version, about)]
struct Cli {
    /// Host to bind, overriding CONFAB_HOST
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on, overriding CONFAB_PORT
    #[arg(long)]
    port: Option<u16>,

    /// Connection cap, overriding CONFAB_MAX_CONNECTIONS (0 = unlimited)
    #[arg(long)]
    max_connections: Option<usize>,

    /// Enable debug-level logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug {
        "confab_server=debug,confab_protocol=debug"
    } else {
        "confab_server=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    info!("starting confab server");

    let mut config = ServerConfig::from_env()?;
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(max) = cli.max_connections {
        config.max_connections = max;
    }

    let server = Server::bind(config).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received, draining connections");
        let _ = shutdown_tx.send(true);
    });

    server.run(shutdown_rx).await?;

    info!("server stopped cleanly");
    Ok(())
}
