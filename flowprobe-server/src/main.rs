//! flowprobe server - HTTP query API over a flow database

mod api;
mod config;

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// HTTP query API for the flowprobe flow database
#[derive(Debug, Parser)]
#[command(name = "flowprobe-server", version)]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = config::parse_file(&cli.config)?;

    init_logging(&config.logging)?;

    let addr: SocketAddr = format!("{}:{}", config.api.host, config.api.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid api listen address: {}", e))?;

    info!(db_path = %config.db.path.display(), "starting flowprobe server");

    let state = Arc::new(api::ApiState {
        db_path: config.db.path.clone(),
    });
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "flowprobe server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("graceful shut down completed");
    Ok(())
}

fn init_logging(logging: &config::LoggingConfig) -> anyhow::Result<()> {
    let level: tracing::Level = logging
        .level
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid log level '{}'", logging.level))?;

    let builder = tracing_subscriber::fmt().with_max_level(level);
    match logging.encoding.as_str() {
        "json" => builder.json().init(),
        _ => builder.init(),
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutting down gracefully");
}
