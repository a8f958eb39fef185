//! Reprocess command
//!
//! Re-runs the processing pipeline over already-downloaded dump files.
//! Valid only once the batch's files are on disk (`ready_for_processing`,
//! `completed`, or `failed`); never re-downloads.

use mediator::Request;
use serde::{Deserialize, Serialize};
use spinlog_common::YearMonth;

use crate::dumps::{BatchStatus, DumpError, DumpOrchestrator};

/// Command to reprocess a dump batch
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReprocessCommand {
    /// Batch to reprocess; defaults to the most recent batch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year_month: Option<YearMonth>,
}

/// Response for a successful reprocess trigger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReprocessResponse {
    pub year_month: YearMonth,
    pub status: BatchStatus,
}

impl Request<Result<ReprocessResponse, DumpError>> for ReprocessCommand {}

pub async fn handle(
    orchestrator: &DumpOrchestrator,
    command: ReprocessCommand,
) -> Result<ReprocessResponse, DumpError> {
    let year_month = match command.year_month {
        Some(year_month) => year_month,
        None => orchestrator
            .batch_store()
            .latest_batch()
            .await?
            .ok_or_else(|| DumpError::Precondition("no dump batch exists".to_string()))?,
    };

    orchestrator.trigger_reprocess(year_month).await?;

    Ok(ReprocessResponse {
        year_month,
        status: BatchStatus::Processing,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_deserializes_year_month() {
        let command: ReprocessCommand =
            serde_json::from_str(r#"{"year_month": "2024-05"}"#).unwrap();
        assert_eq!(command.year_month, Some("2024-05".parse().unwrap()));
    }

    #[test]
    fn test_command_rejects_malformed_year_month() {
        let result = serde_json::from_str::<ReprocessCommand>(r#"{"year_month": "junk"}"#);
        assert!(result.is_err());
    }
}
