//! Persisted dump batch state
//!
//! Single source of truth for batch, file, and step state, keyed by
//! `year_month`. Two rules keep concurrent writers safe:
//!
//! - Control-plane transitions (trigger, reprocess, reset) run inside a
//!   transaction that first locks any active batch row `FOR UPDATE`, which
//!   enforces the one-active-batch invariant across server instances.
//! - Data-plane updates (file bytes, step completions) are single-statement
//!   upserts scoped to one row, so concurrently completing downloads or
//!   steps never read-modify-write each other's fields.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

use spinlog_common::YearMonth;

use super::steps::ProcessingStep;
use super::types::{BatchStatus, DumpBatch, DumpFileInfo, DumpKind, FileStatus, StepStatus};
use super::{DumpError, Result};

/// Store for `dump_batches` / `dump_batch_files` / `dump_batch_steps`
#[derive(Clone)]
pub struct BatchStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct BatchRow {
    year_month: String,
    status: String,
    started_at: Option<DateTime<Utc>>,
    download_completed_at: Option<DateTime<Utc>>,
    processing_completed_at: Option<DateTime<Utc>>,
    retry_count: i32,
    error_message: Option<String>,
}

#[derive(sqlx::FromRow)]
struct FileRow {
    kind: String,
    status: String,
    downloaded: bool,
    validated: bool,
    size_bytes: i64,
    expected_checksum: Option<String>,
    computed_checksum: Option<String>,
    downloaded_at: Option<DateTime<Utc>>,
    validated_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
}

#[derive(sqlx::FromRow)]
struct StepRow {
    step: String,
    completed: bool,
    completed_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    records_count: i64,
    duration_ms: i64,
}

impl BatchStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Full aggregate for one batch: batch row plus file and step rows
    pub async fn get_batch(&self, year_month: YearMonth) -> Result<Option<DumpBatch>> {
        let key = year_month.to_string();

        let Some(batch) = sqlx::query_as::<_, BatchRow>(
            r#"
            SELECT year_month, status, started_at, download_completed_at,
                   processing_completed_at, retry_count, error_message
            FROM dump_batches
            WHERE year_month = $1
            "#,
        )
        .bind(&key)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let files = sqlx::query_as::<_, FileRow>(
            r#"
            SELECT kind, status, downloaded, validated, size_bytes,
                   expected_checksum, computed_checksum,
                   downloaded_at, validated_at, error_message
            FROM dump_batch_files
            WHERE year_month = $1
            "#,
        )
        .bind(&key)
        .fetch_all(&self.pool)
        .await?;

        let steps = sqlx::query_as::<_, StepRow>(
            r#"
            SELECT step, completed, completed_at, error_message,
                   records_count, duration_ms
            FROM dump_batch_steps
            WHERE year_month = $1
            "#,
        )
        .bind(&key)
        .fetch_all(&self.pool)
        .await?;

        let mut file_map = BTreeMap::new();
        for row in files {
            if let Some(kind) = DumpKind::parse(&row.kind) {
                file_map.insert(
                    kind,
                    DumpFileInfo {
                        status: FileStatus::parse(&row.status).unwrap_or(FileStatus::NotStarted),
                        downloaded: row.downloaded,
                        validated: row.validated,
                        size_bytes: row.size_bytes,
                        expected_checksum: row.expected_checksum,
                        computed_checksum: row.computed_checksum,
                        downloaded_at: row.downloaded_at,
                        validated_at: row.validated_at,
                        error_message: row.error_message,
                    },
                );
            }
        }

        let mut step_map = BTreeMap::new();
        for row in steps {
            if let Some(step) = ProcessingStep::parse(&row.step) {
                step_map.insert(
                    step,
                    StepStatus {
                        completed: row.completed,
                        completed_at: row.completed_at,
                        error_message: row.error_message,
                        records_count: row.records_count,
                        duration_ms: row.duration_ms,
                    },
                );
            }
        }

        Ok(Some(DumpBatch {
            year_month: batch.year_month.parse().map_err(|_| {
                DumpError::Storage(format!("corrupt year_month key: {}", batch.year_month))
            })?,
            status: BatchStatus::parse(&batch.status).unwrap_or(BatchStatus::NotStarted),
            started_at: batch.started_at,
            download_completed_at: batch.download_completed_at,
            processing_completed_at: batch.processing_completed_at,
            retry_count: batch.retry_count,
            error_message: batch.error_message,
            files: file_map,
            steps: step_map,
        }))
    }

    /// The most recent batch on record
    pub async fn latest_batch(&self) -> Result<Option<YearMonth>> {
        let key: Option<String> = sqlx::query_scalar(
            "SELECT year_month FROM dump_batches ORDER BY year_month DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        match key {
            Some(key) => Ok(Some(key.parse().map_err(|_| {
                DumpError::Storage(format!("corrupt year_month key: {key}"))
            })?)),
            None => Ok(None),
        }
    }

    /// Current status of one batch
    pub async fn batch_status(&self, year_month: YearMonth) -> Result<Option<BatchStatus>> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM dump_batches WHERE year_month = $1")
                .bind(year_month.to_string())
                .fetch_optional(&self.pool)
                .await?;

        Ok(status.map(|s| BatchStatus::parse(&s).unwrap_or(BatchStatus::NotStarted)))
    }

    /// Steps already completed for a batch (executor seed for resume/reprocess)
    pub async fn completed_steps(&self, year_month: YearMonth) -> Result<HashSet<ProcessingStep>> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT step FROM dump_batch_steps WHERE year_month = $1 AND completed = TRUE",
        )
        .bind(year_month.to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().filter_map(|s| ProcessingStep::parse(s)).collect())
    }

    // ------------------------------------------------------------------
    // Control-plane transitions (guarded, transactional)
    // ------------------------------------------------------------------

    /// Claim the active slot and move a batch to `downloading`
    ///
    /// Fails with `Conflict` while any batch is downloading or processing.
    /// Re-triggering a previously failed batch increments `retry_count`.
    pub async fn begin_download(&self, year_month: YearMonth) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let active: Option<String> = sqlx::query_scalar(
            r#"
            SELECT year_month FROM dump_batches
            WHERE status IN ('downloading', 'processing')
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(active) = active {
            debug!("Trigger rejected, batch {} is active", active);
            return Err(DumpError::Conflict);
        }

        sqlx::query(
            r#"
            INSERT INTO dump_batches (year_month, status, started_at)
            VALUES ($1, 'downloading', NOW())
            ON CONFLICT (year_month) DO UPDATE SET
                status = 'downloading',
                started_at = NOW(),
                error_message = NULL,
                download_completed_at = NULL,
                retry_count = dump_batches.retry_count
                    + CASE WHEN dump_batches.status = 'failed' THEN 1 ELSE 0 END,
                updated_at = NOW()
            "#,
        )
        .bind(year_month.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Validate preconditions and move a batch to `processing` for a rerun
    ///
    /// Clears all step rows and `processing_completed_at`; never touches
    /// file rows.
    pub async fn begin_reprocess(&self, year_month: YearMonth) -> Result<()> {
        let key = year_month.to_string();
        let mut tx = self.pool.begin().await?;

        let other_active: Option<String> = sqlx::query_scalar(
            r#"
            SELECT year_month FROM dump_batches
            WHERE status IN ('downloading', 'processing') AND year_month <> $1
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(&key)
        .fetch_optional(&mut *tx)
        .await?;

        if other_active.is_some() {
            return Err(DumpError::Conflict);
        }

        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM dump_batches WHERE year_month = $1 FOR UPDATE")
                .bind(&key)
                .fetch_optional(&mut *tx)
                .await?;

        let status = status
            .as_deref()
            .and_then(BatchStatus::parse)
            .ok_or_else(|| {
                DumpError::Precondition(format!("no dump batch exists for {year_month}"))
            })?;

        if !status.allows_reprocess() {
            return Err(DumpError::Precondition(
                "dump files must be downloaded before reprocessing".to_string(),
            ));
        }

        sqlx::query("DELETE FROM dump_batch_steps WHERE year_month = $1")
            .bind(&key)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            UPDATE dump_batches
            SET status = 'processing',
                processing_completed_at = NULL,
                error_message = NULL,
                updated_at = NOW()
            WHERE year_month = $1
            "#,
        )
        .bind(&key)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Check that a batch may be reset from its current status
    pub async fn check_reset_allowed(&self, year_month: YearMonth) -> Result<()> {
        let status = self.batch_status(year_month).await?.ok_or_else(|| {
            DumpError::Precondition(format!("no dump batch exists for {year_month}"))
        })?;

        if !status.allows_reset() {
            return Err(DumpError::Precondition(format!(
                "batch {year_month} is {status}; only downloading, processing, or failed batches can be reset"
            )));
        }
        Ok(())
    }

    /// Clear all file and step rows and return the batch to `not_started`
    pub async fn clear_batch(&self, year_month: YearMonth) -> Result<()> {
        let key = year_month.to_string();
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM dump_batch_files WHERE year_month = $1")
            .bind(&key)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM dump_batch_steps WHERE year_month = $1")
            .bind(&key)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            UPDATE dump_batches
            SET status = 'not_started',
                started_at = NULL,
                download_completed_at = NULL,
                processing_completed_at = NULL,
                error_message = NULL,
                updated_at = NOW()
            WHERE year_month = $1
            "#,
        )
        .bind(&key)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Batch status updates (single-statement, status-guarded)
    // ------------------------------------------------------------------

    /// `downloading` -> `ready_for_processing` once all files validated
    ///
    /// Returns false when the batch left `downloading` in the meantime
    /// (e.g. a concurrent reset), in which case nothing was written.
    pub async fn finish_download(&self, year_month: YearMonth) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE dump_batches
            SET status = 'ready_for_processing',
                download_completed_at = NOW(),
                updated_at = NOW()
            WHERE year_month = $1 AND status = 'downloading'
            "#,
        )
        .bind(year_month.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// `ready_for_processing` -> `processing`
    pub async fn start_processing(&self, year_month: YearMonth) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE dump_batches
            SET status = 'processing', updated_at = NOW()
            WHERE year_month = $1 AND status = 'ready_for_processing'
            "#,
        )
        .bind(year_month.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Mark an active batch `failed` with a human-readable cause
    pub async fn fail_batch(&self, year_month: YearMonth, error_message: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE dump_batches
            SET status = 'failed', error_message = $2, updated_at = NOW()
            WHERE year_month = $1 AND status IN ('downloading', 'processing')
            "#,
        )
        .bind(year_month.to_string())
        .bind(error_message)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// `processing` -> `completed`
    pub async fn complete_batch(&self, year_month: YearMonth) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE dump_batches
            SET status = 'completed',
                processing_completed_at = NOW(),
                error_message = NULL,
                updated_at = NOW()
            WHERE year_month = $1 AND status = 'processing'
            "#,
        )
        .bind(year_month.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    // ------------------------------------------------------------------
    // File row updates (single-statement upserts)
    // ------------------------------------------------------------------

    /// A download task claimed this file
    pub async fn set_file_downloading(
        &self,
        year_month: YearMonth,
        kind: DumpKind,
        expected_checksum: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dump_batch_files (year_month, kind, status, expected_checksum)
            VALUES ($1, $2, 'downloading', $3)
            ON CONFLICT (year_month, kind) DO UPDATE SET
                status = 'downloading',
                downloaded = FALSE,
                validated = FALSE,
                size_bytes = 0,
                expected_checksum = EXCLUDED.expected_checksum,
                computed_checksum = NULL,
                downloaded_at = NULL,
                validated_at = NULL,
                error_message = NULL
            "#,
        )
        .bind(year_month.to_string())
        .bind(kind.as_str())
        .bind(expected_checksum)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// A file downloaded and its checksum matched
    pub async fn set_file_validated(
        &self,
        year_month: YearMonth,
        kind: DumpKind,
        computed_checksum: &str,
        size_bytes: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE dump_batch_files
            SET status = 'validated',
                downloaded = TRUE,
                validated = TRUE,
                size_bytes = $3,
                computed_checksum = $4,
                downloaded_at = NOW(),
                validated_at = NOW(),
                error_message = NULL
            WHERE year_month = $1 AND kind = $2
            "#,
        )
        .bind(year_month.to_string())
        .bind(kind.as_str())
        .bind(size_bytes)
        .bind(computed_checksum)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// A file failed to download or validate
    ///
    /// `downloaded` stays true for checksum mismatches (the bytes arrived,
    /// they were just wrong) and false for transport failures.
    pub async fn set_file_failed(
        &self,
        year_month: YearMonth,
        kind: DumpKind,
        downloaded: bool,
        computed_checksum: Option<&str>,
        error_message: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE dump_batch_files
            SET status = 'failed',
                downloaded = $3,
                validated = FALSE,
                computed_checksum = COALESCE($4, computed_checksum),
                downloaded_at = CASE WHEN $3 THEN NOW() ELSE downloaded_at END,
                error_message = $5
            WHERE year_month = $1 AND kind = $2
            "#,
        )
        .bind(year_month.to_string())
        .bind(kind.as_str())
        .bind(downloaded)
        .bind(computed_checksum)
        .bind(error_message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Step row updates (single-statement upserts)
    // ------------------------------------------------------------------

    /// Record a step as durably completed
    pub async fn record_step_completed(
        &self,
        year_month: YearMonth,
        step: ProcessingStep,
        records_count: i64,
        duration_ms: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dump_batch_steps
                (year_month, step, completed, completed_at, records_count, duration_ms)
            VALUES ($1, $2, TRUE, NOW(), $3, $4)
            ON CONFLICT (year_month, step) DO UPDATE SET
                completed = TRUE,
                completed_at = NOW(),
                records_count = EXCLUDED.records_count,
                duration_ms = EXCLUDED.duration_ms,
                error_message = NULL
            "#,
        )
        .bind(year_month.to_string())
        .bind(step.as_str())
        .bind(records_count)
        .bind(duration_ms)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record a step failure
    pub async fn record_step_failed(
        &self,
        year_month: YearMonth,
        step: ProcessingStep,
        error_message: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dump_batch_steps (year_month, step, completed, error_message)
            VALUES ($1, $2, FALSE, $3)
            ON CONFLICT (year_month, step) DO UPDATE SET
                completed = FALSE,
                completed_at = NULL,
                error_message = EXCLUDED.error_message
            "#,
        )
        .bind(year_month.to_string())
        .bind(step.as_str())
        .bind(error_message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
