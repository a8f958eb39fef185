//! Admin download routes
//!
//! REST surface consumed by the external admin UI:
//!
//! - `GET  /admin/downloads/status` - full batch state (`{}` if none)
//! - `POST /admin/downloads/trigger` - 409 while a batch is active
//! - `POST /admin/downloads/reprocess` - 400 unless files are downloaded
//! - `POST /admin/downloads/reset` - 400 unless the batch is resettable
//!
//! Error detail stays server-side; responses carry only the coarse status
//! and message mapped by [`AppError`].

use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;

use crate::dumps::DumpOrchestrator;
use crate::error::AppError;

use super::commands::{
    reprocess::handle as handle_reprocess, reset::handle as handle_reset,
    trigger::handle as handle_trigger, ReprocessCommand, ResetCommand, TriggerDownloadCommand,
};
use super::queries::{get_status::handle as handle_get_status, GetDownloadStatusQuery};

/// State shared by the admin download routes
#[derive(Clone)]
pub struct AdminDownloadsState {
    pub orchestrator: Arc<DumpOrchestrator>,
}

/// Create admin download routes
pub fn admin_downloads_routes() -> Router<AdminDownloadsState> {
    Router::new()
        .route("/status", get(get_download_status))
        .route("/trigger", post(trigger_download))
        .route("/reprocess", post(reprocess))
        .route("/reset", post(reset))
}

/// Full batch status
///
/// GET /admin/downloads/status?year_month=2024-06
async fn get_download_status(
    State(state): State<AdminDownloadsState>,
    Query(query): Query<GetDownloadStatusQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    match handle_get_status(&state.orchestrator, query).await? {
        Some(batch) => Ok(Json(json!(batch))),
        None => Ok(Json(json!({}))),
    }
}

/// Trigger a dump download
///
/// POST /admin/downloads/trigger
async fn trigger_download(
    State(state): State<AdminDownloadsState>,
    body: Option<Json<TriggerDownloadCommand>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let command = body.map(|Json(command)| command).unwrap_or_default();
    let response = handle_trigger(&state.orchestrator, command).await?;
    Ok(Json(json!(response)))
}

/// Reprocess already-downloaded files
///
/// POST /admin/downloads/reprocess
async fn reprocess(
    State(state): State<AdminDownloadsState>,
    body: Option<Json<ReprocessCommand>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let command = body.map(|Json(command)| command).unwrap_or_default();
    let response = handle_reprocess(&state.orchestrator, command).await?;
    Ok(Json(json!(response)))
}

/// Reset a stuck or failed batch
///
/// POST /admin/downloads/reset
async fn reset(
    State(state): State<AdminDownloadsState>,
    body: Option<Json<ResetCommand>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let command = body.map(|Json(command)| command).unwrap_or_default();
    let response = handle_reset(&state.orchestrator, command).await?;
    Ok(Json(json!(response)))
}
