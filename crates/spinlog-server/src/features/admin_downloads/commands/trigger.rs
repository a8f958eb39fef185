//! Trigger download command
//!
//! Starts the download of a monthly dump batch. Defaults to the current
//! calendar month when no `year_month` is given.

use mediator::Request;
use serde::{Deserialize, Serialize};
use spinlog_common::YearMonth;

use crate::dumps::{BatchStatus, DumpError, DumpOrchestrator};

/// Command to trigger a dump download
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerDownloadCommand {
    /// Batch to download; defaults to the current month
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year_month: Option<YearMonth>,
}

/// Response for a successful trigger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerDownloadResponse {
    pub year_month: YearMonth,
    pub status: BatchStatus,
}

impl Request<Result<TriggerDownloadResponse, DumpError>> for TriggerDownloadCommand {}

pub async fn handle(
    orchestrator: &DumpOrchestrator,
    command: TriggerDownloadCommand,
) -> Result<TriggerDownloadResponse, DumpError> {
    let year_month = command.year_month.unwrap_or_else(YearMonth::current);

    orchestrator.trigger_download(year_month).await?;

    Ok(TriggerDownloadResponse {
        year_month,
        status: BatchStatus::Downloading,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_defaults_to_no_month() {
        let command = TriggerDownloadCommand::default();
        assert!(command.year_month.is_none());
    }

    #[test]
    fn test_command_deserializes_from_empty_object() {
        let command: TriggerDownloadCommand = serde_json::from_str("{}").unwrap();
        assert!(command.year_month.is_none());
    }

    #[test]
    fn test_command_deserializes_year_month() {
        let command: TriggerDownloadCommand =
            serde_json::from_str(r#"{"year_month": "2024-06"}"#).unwrap();
        assert_eq!(command.year_month, Some("2024-06".parse().unwrap()));
    }

    #[test]
    fn test_response_serializes_status() {
        let response = TriggerDownloadResponse {
            year_month: "2024-06".parse().unwrap(),
            status: BatchStatus::Downloading,
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["year_month"], "2024-06");
        assert_eq!(json["status"], "downloading");
    }
}
