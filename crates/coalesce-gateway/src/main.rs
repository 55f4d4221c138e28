use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use coalesce_core::config::{CoalesceConfig, LogFormat};
use coalesce_debounce::{build_debouncer, Dispatcher};
use tracing::{info, warn};

mod app;
mod auth;
mod filter;
mod http;
mod ingress;
mod janitor;

const DEFAULT_LOG_FILTER: &str =
    "coalesce_gateway=info,coalesce_debounce=info,coalesce_store=info,tower_http=info";

#[derive(Debug, Parser)]
#[command(name = "coalesce-gateway", version, about = "Coalesces bursts of chat messages before forwarding them")]
struct Cli {
    /// Path to coalesce.toml (falls back to COALESCE_CONFIG, then ~/.coalesce/coalesce.toml).
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // load config: --config > COALESCE_CONFIG env > ~/.coalesce/coalesce.toml
    let config_path = cli
        .config
        .or_else(|| std::env::var("COALESCE_CONFIG").ok());
    let loaded = CoalesceConfig::load(config_path.as_deref());
    let format = loaded
        .as_ref()
        .map(|c| c.logging.format)
        .unwrap_or_default();
    init_tracing(format);

    let config = loaded.unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        CoalesceConfig::default()
    });
    for warning in config.validate() {
        warn!("config: {warning}");
    }

    let dispatcher = Dispatcher::from_config(&config.sink);
    let setup = build_debouncer(&config.debounce, &config.store, dispatcher.clone());

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    if let Some(store) = setup.store.clone() {
        tokio::spawn(janitor::run(store, janitor::SWEEP_INTERVAL, shutdown_rx));
    }

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    let state = Arc::new(app::AppState::new(config, setup, dispatcher));
    let router = app::build_router(Arc::clone(&state));

    info!(mode = state.debouncer.mode(), "coalesce gateway listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    let led = state.duties.drain().await;
    let drained = state.debouncer.drain().await;
    info!(led, drained, "coalesce gateway stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received, draining");
}
