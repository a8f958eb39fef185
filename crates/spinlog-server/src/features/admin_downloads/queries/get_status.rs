//! Get download status query
//!
//! Returns the full persisted batch aggregate (batch + files + steps), not
//! a diff, so a late subscriber can resynchronize without replaying events.

use mediator::Request;
use serde::{Deserialize, Serialize};
use spinlog_common::YearMonth;

use crate::dumps::{DumpBatch, DumpError, DumpOrchestrator};

/// Query for a batch's full status
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetDownloadStatusQuery {
    /// Batch to inspect; defaults to the most recent batch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year_month: Option<YearMonth>,
}

impl Request<Result<Option<DumpBatch>, DumpError>> for GetDownloadStatusQuery {}

pub async fn handle(
    orchestrator: &DumpOrchestrator,
    query: GetDownloadStatusQuery,
) -> Result<Option<DumpBatch>, DumpError> {
    let year_month = match query.year_month {
        Some(year_month) => Some(year_month),
        None => orchestrator.batch_store().latest_batch().await?,
    };

    let Some(year_month) = year_month else {
        return Ok(None);
    };

    orchestrator.get_status(year_month).await
}
