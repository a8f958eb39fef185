//! Reset command
//!
//! Cancels any in-flight work for a stuck or failed batch, deletes its
//! downloaded artifacts, and returns it to `not_started`. Valid only for
//! `downloading`, `processing`, or `failed` batches.

use mediator::Request;
use serde::{Deserialize, Serialize};
use spinlog_common::YearMonth;

use crate::dumps::{BatchStatus, DumpError, DumpOrchestrator};

/// Command to reset a stuck dump batch
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResetCommand {
    /// Batch to reset; defaults to the most recent batch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year_month: Option<YearMonth>,
}

/// Response for a successful reset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetResponse {
    pub year_month: YearMonth,
    pub status: BatchStatus,
}

impl Request<Result<ResetResponse, DumpError>> for ResetCommand {}

pub async fn handle(
    orchestrator: &DumpOrchestrator,
    command: ResetCommand,
) -> Result<ResetResponse, DumpError> {
    let year_month = match command.year_month {
        Some(year_month) => year_month,
        None => orchestrator
            .batch_store()
            .latest_batch()
            .await?
            .ok_or_else(|| DumpError::Precondition("no dump batch exists".to_string()))?,
    };

    orchestrator.reset(year_month).await?;

    Ok(ResetResponse {
        year_month,
        status: BatchStatus::NotStarted,
    })
}
