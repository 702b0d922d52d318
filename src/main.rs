mod config;
mod error;
mod git;
mod health;
mod http;
mod metrics;
mod mirror;
mod protocol;
mod proxy;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::git::{GitBinary, GitCli, VersionControl};
use crate::metrics::MetricsRegistry;
use crate::proxy::MirrorProxy;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "mirrorcache", about = "Read-through caching proxy for git repositories")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(
        short,
        long,
        env = "MIRRORCACHE_CONFIG",
        default_value = "/etc/mirrorcache/config.yaml"
    )]
    config: String,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub metrics: MetricsRegistry,
    pub vcs: Arc<dyn VersionControl>,
    pub proxy: Arc<MirrorProxy>,
}

impl AppState {
    pub fn new(config: Arc<Config>, vcs: Arc<dyn VersionControl>) -> Result<Self> {
        let metrics = MetricsRegistry::new();
        let proxy = MirrorProxy::from_config(&config, Arc::clone(&vcs), Arc::clone(&metrics.metrics))
            .context("failed to build mirror proxy")?;
        Ok(Self {
            config,
            metrics,
            vcs,
            proxy: Arc::new(proxy),
        })
    }
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: AppState) -> Result<()> {
    let listen_addr: std::net::SocketAddr = state
        .config
        .proxy
        .http_listen
        .parse()
        .context("invalid http_listen address")?;

    let app = http::handler::create_router(Arc::new(state));

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    // ---- Config ----
    let config = Arc::new(config::load_config(&cli.config)?);

    tracing::info!(
        config_path = %cli.config,
        namespaces = config.namespaces.len(),
        data_root = %config.storage.local.path,
        "starting mirrorcache"
    );

    // ---- Ensure data root exists ----
    tokio::fs::create_dir_all(&config.storage.local.path)
        .await
        .with_context(|| {
            format!(
                "failed to create mirror data root: {}",
                config.storage.local.path
            )
        })?;

    // ---- git ----
    let git = GitBinary::from_config(&config.git);
    let vcs: Arc<dyn VersionControl> = Arc::new(GitCli::new(git));
    match vcs.version().await {
        Ok(version) => tracing::info!(%version, "git binary available"),
        Err(e) => tracing::warn!(error = %e, "git binary check failed"),
    }

    // ---- App state ----
    let state = AppState::new(Arc::clone(&config), vcs)?;

    run_http_server(state).await?;

    tracing::info!("mirrorcache shut down cleanly");
    Ok(())
}
