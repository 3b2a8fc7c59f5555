mod cache;
mod config;
mod git;
mod health;
mod http;
mod recipe;
mod rpc;
mod runner;
mod store;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::cache::PackageCache;
use crate::config::Config;
use crate::store::MetadataStore;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "aurcache", about = "Caching Git proxy for the AUR")]
struct Cli {
    /// Path to the YAML configuration file. Built-in defaults apply when the
    /// file does not exist.
    #[arg(short, long, default_value = "aurcache.yaml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers.
///
/// There is exactly one metadata-store handle and one owner of the cache
/// root; every lane borrows them through this struct.
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<MetadataStore>,
    pub cache: Arc<PackageCache>,
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
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
        .with(tracing_subscriber::fmt::layer())
        .init();

    // ---- Config ----
    let config = config::load_config(&cli.config)?;
    let config = Arc::new(config);

    tracing::info!(config_path = %cli.config, port = config.server.port, "starting aurcache");

    // ---- Ensure cache directory exists ----
    tokio::fs::create_dir_all(&config.cache.path)
        .await
        .with_context(|| format!("failed to create cache dir: {}", config.cache.path))?;

    // ---- Metadata store ----
    // Initialization failure is fatal: every lane assumes the relations
    // exist and the counters have been repaired.
    let store = Arc::new(
        MetadataStore::open(std::path::Path::new(&config.cache.path))
            .context("failed to initialize metadata store")?,
    );

    // ---- Package cache ----
    let package_cache = Arc::new(PackageCache::new(&config, Arc::clone(&store)));

    // ---- App state ----
    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        store,
        cache: package_cache,
    });

    // ---- HTTP server ----
    let app = http::handler::create_router(Arc::clone(&state));

    let listen_addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, cache_dir = %config.cache.path, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    tracing::info!("aurcache shut down cleanly");
    Ok(())
}
