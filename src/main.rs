//! polygate binary: load config, start the engine, serve.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use polygate::api::rest::{AppState, routes::build_router};
use polygate::engine::{Engine, EngineHandle};
use polygate::infra::metrics::{HistoryRing, MetricsRegistry};

/// Credential-rotating reverse proxy for upstream HTTP APIs.
#[derive(Parser, Debug)]
#[command(name = "polygate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "polygate.yaml")]
    config: PathBuf,

    /// Override the configured listen host.
    #[arg(long)]
    host: Option<String>,

    /// Override the configured listen port.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut snapshot = polygate::load_snapshot(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(host) = cli.host {
        snapshot.server.host = host;
    }
    if let Some(port) = cli.port {
        snapshot.server.port = port;
    }

    let registry = Arc::new(MetricsRegistry::new());
    let history = Arc::new(HistoryRing::new(snapshot.server.history_size));

    let bind_addr = format!("{}:{}", snapshot.server.host, snapshot.server.port);
    let drain = snapshot.server.drain;
    let metrics_interval = snapshot.server.metrics_log_interval;

    let engine = Engine::start(snapshot, Arc::clone(&registry), Arc::clone(&history))?;
    let handle = Arc::new(EngineHandle::new(
        engine,
        Arc::clone(&registry),
        Arc::clone(&history),
    ));

    if !metrics_interval.is_zero() {
        spawn_metrics_summary(Arc::clone(&registry), metrics_interval);
    }

    let state = AppState {
        handle: Arc::clone(&handle),
        config_path: Some(Arc::new(cli.config)),
    };
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding {bind_addr}"))?;
    info!(addr = %bind_addr, "polygate listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    info!("draining in-flight requests");
    handle.engine().drain(drain).await;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
    }
}

fn spawn_metrics_summary(registry: Arc<MetricsRegistry>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            info!(summary = %registry.summary(), "metrics summary");
        }
    });
}
