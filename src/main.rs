// src/main.rs
// loremwatch server entrypoint

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tokio::net::TcpListener;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use loremwatch::api;
use loremwatch::broadcast::Broadcaster;
use loremwatch::config::Config;
use loremwatch::metrics::MetricsEngine;
use loremwatch::orchestrator::OrchestratorDeps;
use loremwatch::perf::PerformanceTracker;
use loremwatch::session::SessionManager;
use loremwatch::state::AppState;
use loremwatch::store::{ObservationStore, SqliteObservationStore};
use loremwatch::vector_sync::{NoopVectorIndexSync, QdrantVectorIndexSync, VectorIndexSync};

/// loremwatch: watches a coding assistant's tool activity and serves
/// distilled observations and token-economics metrics to a viewer UI.
#[derive(Parser, Debug)]
#[command(name = "loremwatch")]
#[command(author = "ConaryLabs")]
#[command(version)]
#[command(about = "Session Orchestrator and Token Metrics Engine", long_about = None)]
struct CliArgs {
    /// Bind host, overrides LOREMWATCH_HOST
    #[arg(long)]
    host: Option<String>,

    /// Bind port, overrides LOREMWATCH_PORT
    #[arg(long)]
    port: Option<u16>,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let default_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_env("LOREMWATCH_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config = Config::from_env();
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    info!("starting loremwatch");

    let connect_options: SqliteConnectOptions = config
        .database
        .url
        .parse::<SqliteConnectOptions>()
        .context("invalid database url")?
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect_with(connect_options)
        .await
        .context("failed to connect to database")?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;
    info!("database ready at {}", config.database.url);

    let store: Arc<dyn ObservationStore> = Arc::new(SqliteObservationStore::new(pool));
    let broadcaster = Broadcaster::new();
    let metrics = Arc::new(MetricsEngine::new(
        store.clone(),
        broadcaster.clone(),
        config.metrics.clone(),
    ));
    let perf = Arc::new(PerformanceTracker::new());

    let vector_sync: Arc<dyn VectorIndexSync> = match QdrantVectorIndexSync::connect(&config.vector_index).await {
        Ok(sync) => {
            info!("vector index connected");
            Arc::new(sync)
        }
        Err(e) => {
            warn!("vector index disabled: {:?}", e);
            Arc::new(NoopVectorIndexSync)
        }
    };

    let deps = OrchestratorDeps {
        analyzer: Arc::new(config.analyzer.clone()),
        metrics: metrics.clone(),
        perf: perf.clone(),
        vector_sync,
        keep_processed: config.queue.keep_processed,
    };
    let sessions = SessionManager::new(store.clone(), broadcaster.clone(), deps);

    let state = AppState {
        store,
        broadcaster,
        metrics,
        perf,
        sessions: sessions.clone(),
    };

    let router = api::router(state);
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(sessions))
        .await
        .context("server error")?;

    Ok(())
}

/// Waits for ctrl-c, then cancels every active session and gives its
/// orchestrator up to 5s to drain before the process exits.
async fn shutdown_signal(sessions: SessionManager) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received, draining {} active session(s)", sessions.active_count());
    sessions.shutdown(Duration::from_secs(5)).await;
}
