//! Core types for dump batch tracking

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use spinlog_common::YearMonth;
use std::collections::BTreeMap;
use std::fmt;

use super::steps::ProcessingStep;

/// The four dump file kinds published per monthly snapshot
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DumpKind {
    Artists,
    Labels,
    Masters,
    Releases,
}

impl DumpKind {
    pub const ALL: [DumpKind; 4] = [
        DumpKind::Artists,
        DumpKind::Labels,
        DumpKind::Masters,
        DumpKind::Releases,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DumpKind::Artists => "artists",
            DumpKind::Labels => "labels",
            DumpKind::Masters => "masters",
            DumpKind::Releases => "releases",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "artists" => Some(DumpKind::Artists),
            "labels" => Some(DumpKind::Labels),
            "masters" => Some(DumpKind::Masters),
            "releases" => Some(DumpKind::Releases),
            _ => None,
        }
    }

    /// Provider file name for a monthly snapshot,
    /// e.g. `discogs_20240601_artists.xml.gz`
    pub fn file_name(&self, year_month: YearMonth) -> String {
        format!(
            "discogs_{}_{}.xml.gz",
            year_month.first_day_compact(),
            self.as_str()
        )
    }
}

impl fmt::Display for DumpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Batch lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    NotStarted,
    Downloading,
    ReadyForProcessing,
    Processing,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::NotStarted => "not_started",
            BatchStatus::Downloading => "downloading",
            BatchStatus::ReadyForProcessing => "ready_for_processing",
            BatchStatus::Processing => "processing",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "not_started" => Some(BatchStatus::NotStarted),
            "downloading" => Some(BatchStatus::Downloading),
            "ready_for_processing" => Some(BatchStatus::ReadyForProcessing),
            "processing" => Some(BatchStatus::Processing),
            "completed" => Some(BatchStatus::Completed),
            "failed" => Some(BatchStatus::Failed),
            _ => None,
        }
    }

    /// Whether the batch holds the system-wide active slot
    pub fn is_active(&self) -> bool {
        matches!(self, BatchStatus::Downloading | BatchStatus::Processing)
    }

    /// Statuses from which `reprocess` is allowed
    pub fn allows_reprocess(&self) -> bool {
        matches!(
            self,
            BatchStatus::ReadyForProcessing | BatchStatus::Completed | BatchStatus::Failed
        )
    }

    /// Statuses from which `reset` is allowed
    pub fn allows_reset(&self) -> bool {
        matches!(
            self,
            BatchStatus::Downloading | BatchStatus::Processing | BatchStatus::Failed
        )
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-file download status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    NotStarted,
    Downloading,
    Failed,
    Validated,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::NotStarted => "not_started",
            FileStatus::Downloading => "downloading",
            FileStatus::Failed => "failed",
            FileStatus::Validated => "validated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "not_started" => Some(FileStatus::NotStarted),
            "downloading" => Some(FileStatus::Downloading),
            "failed" => Some(FileStatus::Failed),
            "validated" => Some(FileStatus::Validated),
            _ => None,
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Download state of a single dump file (maps to `dump_batch_files`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpFileInfo {
    pub status: FileStatus,
    pub downloaded: bool,
    pub validated: bool,
    pub size_bytes: i64,
    pub expected_checksum: Option<String>,
    pub computed_checksum: Option<String>,
    pub downloaded_at: Option<DateTime<Utc>>,
    pub validated_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Completion state of a single processing step (maps to `dump_batch_steps`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepStatus {
    pub completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub records_count: i64,
    pub duration_ms: i64,
}

/// Full persisted state of one monthly batch
///
/// This is the aggregate returned by the status endpoint: the batch row
/// joined with its file and step rows. Absent map entries mean the file or
/// step has not been touched yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpBatch {
    pub year_month: YearMonth,
    pub status: BatchStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub download_completed_at: Option<DateTime<Utc>>,
    pub processing_completed_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub error_message: Option<String>,
    pub files: BTreeMap<DumpKind, DumpFileInfo>,
    pub steps: BTreeMap<ProcessingStep, StepStatus>,
}

impl DumpBatch {
    /// Whether every dump file has been validated
    pub fn all_files_validated(&self) -> bool {
        DumpKind::ALL
            .iter()
            .all(|kind| self.files.get(kind).map(|f| f.validated).unwrap_or(false))
    }

    /// Completed-step fraction as a percentage
    pub fn processing_percentage(&self) -> f64 {
        let completed = self.steps.values().filter(|s| s.completed).count();
        (completed as f64 / ProcessingStep::ALL.len() as f64) * 100.0
    }
}
