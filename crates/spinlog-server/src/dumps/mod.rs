//! Bulk catalog-dump ingestion
//!
//! Once a month the catalog provider publishes four gzipped XML dumps
//! (artists, labels, masters, releases). This module downloads them,
//! validates their checksums, and runs a 13-step dependency-ordered ETL
//! into the catalog schema.
//!
//! # Architecture
//!
//! - **config**: `DUMPS_*` environment configuration
//! - **types**: batch/file/step state (closed enums + row structs)
//! - **steps**: the 13 processing steps and their dependency table
//! - **graph**: generic topological step executor (fail-fast, resumable)
//! - **batch_store**: persisted batch state, guarded transitions
//! - **downloader**: streaming HTTP downloads with retry and checksums
//! - **parser**: streaming XML parsers for the four dump kinds
//! - **processor**: the ETL steps themselves (idempotent upserts)
//! - **orchestrator**: trigger/reprocess/reset entry points + task registry
//! - **progress**: progress event contract and publisher seam
//! - **scheduler**: optional monthly auto-trigger loop
//!
//! Admin REST endpoints live in `features::admin_downloads`; they only
//! enqueue work or read state and never block on the pipeline.

use thiserror::Error;

pub mod batch_store;
pub mod config;
pub mod downloader;
pub mod graph;
pub mod models;
pub mod orchestrator;
pub mod parser;
pub mod processor;
pub mod progress;
pub mod scheduler;
pub mod steps;
pub mod types;

pub use batch_store::BatchStore;
pub use config::DumpsConfig;
pub use downloader::DumpDownloader;
pub use graph::{StepExecutor, StepGraph, StepRunner};
pub use orchestrator::DumpOrchestrator;
pub use processor::DumpProcessor;
pub use progress::{BroadcastPublisher, ProgressEvent, ProgressPublisher};
pub use scheduler::DumpScheduler;
pub use steps::ProcessingStep;
pub use types::{BatchStatus, DumpBatch, DumpKind, FileStatus};

/// Result type alias for dump pipeline operations
pub type Result<T> = std::result::Result<T, DumpError>;

/// Errors raised by the dump pipeline
#[derive(Error, Debug)]
pub enum DumpError {
    /// Another batch is already downloading or processing
    #[error("download already in progress")]
    Conflict,

    /// A control operation is invalid for the batch's current status
    #[error("{0}")]
    Precondition(String),

    /// Retryable transport failure while fetching a dump
    #[error("Network error: {0}")]
    Network(String),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Dump store I/O failure; fatal for the current run
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    /// The batch's work was cancelled by a reset
    #[error("operation cancelled")]
    Cancelled,

    /// A step was scheduled before its prerequisites completed. The
    /// executor makes this structurally unreachable; seeing it is a bug.
    #[error("dependency not met for step {0}")]
    DependencyNotMet(steps::ProcessingStep),
}

impl From<spinlog_common::SpinlogError> for DumpError {
    fn from(err: spinlog_common::SpinlogError) -> Self {
        use spinlog_common::SpinlogError;
        match err {
            SpinlogError::ChecksumMismatch { expected, actual } => {
                DumpError::ChecksumMismatch { expected, actual }
            },
            SpinlogError::Network(msg) => DumpError::Network(msg),
            SpinlogError::Parse(msg) => DumpError::Parse(msg),
            SpinlogError::Io(e) => DumpError::Storage(e.to_string()),
            other => DumpError::Storage(other.to_string()),
        }
    }
}
