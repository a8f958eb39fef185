//! Feature modules implementing the Spinlog API
//!
//! Feature slices follow the CQRS (Command Query Responsibility
//! Segregation) pattern: each feature owns its commands (writes), queries
//! (reads), and routes.
//!
//! # Features
//!
//! - **admin_downloads**: Admin control surface for the dump ingestion
//!   pipeline (trigger / reprocess / reset / status)

pub mod admin_downloads;

use axum::Router;
use std::sync::Arc;

use crate::dumps::DumpOrchestrator;

/// Shared state for all feature routes
#[derive(Clone)]
pub struct FeatureState {
    /// PostgreSQL connection pool for database operations
    pub db: sqlx::PgPool,
    /// Entry points into the dump ingestion pipeline
    pub orchestrator: Arc<DumpOrchestrator>,
}

/// Creates the main API router with all feature routes mounted
pub fn router(state: FeatureState) -> Router<()> {
    Router::new().nest(
        "/admin/downloads",
        admin_downloads::admin_downloads_routes().with_state(
            admin_downloads::AdminDownloadsState {
                orchestrator: state.orchestrator,
            },
        ),
    )
}
