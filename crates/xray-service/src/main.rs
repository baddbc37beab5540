use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;
use xray_service::{app, ServiceState};
use xray_trace_api::TraceApi;

#[derive(Debug, Parser)]
#[command(name = "xray-service")]
#[command(about = "HTTP ingestion and query service for pipeline traces")]
struct Args {
    #[arg(long, default_value = "./xray.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:8000")]
    bind: SocketAddr,
    #[arg(long, default_value_t = 5000)]
    operation_timeout_ms: u64,
    /// Log filter directive; `RUST_LOG` wins when set.
    #[arg(long, default_value = "info")]
    log_filter: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_filter)),
        )
        .init();

    let api = TraceApi::new(args.db.clone());
    api.migrate()
        .with_context(|| format!("failed to prepare trace database at {}", args.db.display()))?;

    let state = ServiceState::new(api, Duration::from_millis(args.operation_timeout_ms));
    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    tracing::info!(bind = %args.bind, db = %args.db.display(), "xray service listening");

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("xray service stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
