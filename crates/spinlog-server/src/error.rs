//! Server-specific error types

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::dumps::DumpError;

/// Result type alias for server operations
pub type AppResult<T> = std::result::Result<T, AppError>;

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Spinlog error: {0}")]
    Common(#[from] spinlog_common::SpinlogError),

    #[error(transparent)]
    Dump(#[from] DumpError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::Database(ref e) => {
                tracing::error!("Database error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "A database error occurred".to_string())
            },
            AppError::NotFound(ref message) => (StatusCode::NOT_FOUND, message.clone()),
            AppError::Validation(ref message) => (StatusCode::BAD_REQUEST, message.clone()),
            AppError::Internal(ref message) => {
                tracing::error!("Internal error: {}", message);
                (StatusCode::INTERNAL_SERVER_ERROR, "An internal error occurred".to_string())
            },
            AppError::Config(ref message) => {
                tracing::error!("Configuration error: {}", message);
                (StatusCode::INTERNAL_SERVER_ERROR, "Server configuration error".to_string())
            },
            AppError::Io(ref e) => {
                tracing::error!("IO error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "An IO error occurred".to_string())
            },
            AppError::Common(ref e) => {
                tracing::error!("Error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "An internal error occurred".to_string())
            },
            AppError::Dump(ref e) => dump_error_response(e),
        };

        let body = Json(json!({
            "error": {
                "message": error_message,
                "status": status.as_u16(),
            }
        }));

        (status, body).into_response()
    }
}

/// Map dump pipeline errors onto the coarse admin-facing HTTP contract
///
/// Conflicts (a batch is already active) map to 409 and precondition
/// violations to 400; everything else is an opaque 500 with the detail kept
/// server-side in logs and the persisted batch record.
fn dump_error_response(err: &DumpError) -> (StatusCode, String) {
    match err {
        DumpError::Conflict => (StatusCode::CONFLICT, err.to_string()),
        DumpError::Precondition(message) => (StatusCode::BAD_REQUEST, message.clone()),
        other => {
            tracing::error!("Dump pipeline error: {:?}", other);
            (StatusCode::INTERNAL_SERVER_ERROR, "An internal error occurred".to_string())
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_maps_to_409() {
        let (status, message) = dump_error_response(&DumpError::Conflict);
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(message, "download already in progress");
    }

    #[test]
    fn test_precondition_maps_to_400() {
        let err = DumpError::Precondition("dump files must be downloaded before reprocessing".into());
        let (status, message) = dump_error_response(&err);
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(message.contains("before reprocessing"));
    }

    #[test]
    fn test_other_dump_errors_are_opaque_500() {
        let err = DumpError::Network("connection refused".into());
        let (status, message) = dump_error_response(&err);
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!message.contains("connection refused"));
    }
}
