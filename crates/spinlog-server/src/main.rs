//! Spinlog Server - Main entry point

use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde_json::json;
use spinlog_common::logging::{init_logging, LogConfig};
use sqlx::postgres::PgPoolOptions;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::signal;
use tower_http::compression::CompressionLayer;
use tracing::info;

use spinlog_server::{
    config::Config,
    dumps::{
        BatchStore, BroadcastPublisher, DumpDownloader, DumpOrchestrator, DumpProcessor,
        DumpScheduler, DumpsConfig, ProgressPublisher,
    },
    features, middleware,
    store::{DumpStore, StoreConfig},
};

/// Application state shared across handlers
#[derive(Clone)]
struct AppState {
    db: sqlx::PgPool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging with configuration from environment
    let log_config = LogConfig::builder()
        .log_file_prefix("spinlog-server")
        .filter_directives("spinlog_server=debug,tower_http=debug,sqlx=info")
        .build();

    // Environment variables take precedence over the built-in defaults
    let log_config = LogConfig::from_env().unwrap_or(log_config);

    init_logging(&log_config)?;

    info!("Starting Spinlog Server");

    // Load configuration
    let config = Config::load()?;
    info!(
        "Configuration loaded - server will bind to {}:{}",
        config.server.host, config.server.port
    );

    // Initialize database connection pool
    let db_pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .acquire_timeout(Duration::from_secs(config.database.connect_timeout_secs))
        .idle_timeout(Duration::from_secs(config.database.idle_timeout_secs))
        .connect(&config.database.url)
        .await?;

    info!("Database connection pool established");

    // Run migrations
    sqlx::migrate!("../../migrations")
        .run(&db_pool)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to run migrations: {}", e))?;

    info!("Database migrations completed");

    // Initialize the dump store and pipeline
    let store = DumpStore::create(StoreConfig::from_env()?).await?;
    let dumps_config = DumpsConfig::from_env()?;

    let publisher: Arc<dyn ProgressPublisher> = Arc::new(BroadcastPublisher::default());
    let batch_store = BatchStore::new(db_pool.clone());
    let downloader = Arc::new(DumpDownloader::new(dumps_config.clone())?);
    let processor = DumpProcessor::new(
        db_pool.clone(),
        store.clone(),
        batch_store.clone(),
        Arc::clone(&publisher),
        dumps_config.batch_size,
    );
    let orchestrator = Arc::new(DumpOrchestrator::new(
        batch_store.clone(),
        store,
        downloader,
        processor,
        publisher,
    ));

    // Start the dump scheduler if enabled
    let _scheduler_handle = if dumps_config.enabled {
        info!("Dump ingestion is enabled, starting scheduler");
        let scheduler = DumpScheduler::new(
            (*orchestrator).clone(),
            batch_store,
            dumps_config.check_interval(),
        );
        Some(scheduler.start())
    } else {
        info!("Dump ingestion scheduler is disabled (DUMPS_ENABLED=false)");
        None
    };

    // Create application state
    let state = AppState { db: db_pool.clone() };

    // Build the application router
    let app = create_router(state, orchestrator, &config);

    // Create socket address
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Server listening on {}", addr);

    // Create TCP listener
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Start server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(config.server.shutdown_timeout_secs))
        .await?;

    info!("Server shut down gracefully");

    Ok(())
}

/// Create the application router with all routes and middleware
fn create_router(state: AppState, orchestrator: Arc<DumpOrchestrator>, config: &Config) -> Router {
    let feature_state = features::FeatureState {
        db: state.db.clone(),
        orchestrator,
    };

    let feature_routes = features::router(feature_state);

    Router::new()
        .route("/health", get(health_check))
        .with_state(state)
        .merge(feature_routes)
        // Apply layers from innermost to outermost
        .layer(CompressionLayer::new())
        .layer(middleware::tracing_layer())
        .layer(middleware::cors_layer(&config.cors))
}

/// Health check handler
async fn health_check(State(state): State<AppState>) -> Result<impl IntoResponse, StatusCode> {
    match sqlx::query("SELECT 1").fetch_one(&state.db).await {
        Ok(_) => Ok((
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "database": "connected"
            })),
        )),
        Err(e) => {
            tracing::error!("Database health check failed: {:?}", e);
            Err(StatusCode::SERVICE_UNAVAILABLE)
        },
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal(timeout_secs: u64) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        },
    }

    // Give ongoing requests time to complete
    info!("Waiting up to {} seconds for connections to close", timeout_secs);
    tokio::time::sleep(Duration::from_secs(timeout_secs.min(5))).await;
}
