//! Batch orchestration: trigger, reprocess, reset
//!
//! The orchestrator owns the entry points the admin API calls. Each entry
//! point performs its guarded state transition synchronously (so callers
//! get Conflict/Precondition errors immediately) and then spawns the actual
//! work as a background task registered in the active-run map, where reset
//! can find it to cancel and await it.
//!
//! After all four files validate, processing starts automatically; a
//! separate reprocess trigger exists only for re-running the pipeline over
//! already-downloaded files.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use spinlog_common::YearMonth;

use crate::store::{DumpStore, StoredDump};

use super::batch_store::BatchStore;
use super::downloader::DumpDownloader;
use super::processor::DumpProcessor;
use super::progress::{DownloadProgressTracker, ProgressEvent, ProgressPublisher};
use super::types::{DumpBatch, DumpKind};
use super::{DumpError, Result};

/// An in-flight batch run that reset can cancel and await
struct ActiveRun {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Entry points for the dump pipeline
#[derive(Clone)]
pub struct DumpOrchestrator {
    batch_store: BatchStore,
    store: DumpStore,
    downloader: Arc<DumpDownloader>,
    processor: DumpProcessor,
    publisher: Arc<dyn ProgressPublisher>,
    active: Arc<Mutex<HashMap<YearMonth, ActiveRun>>>,
}

impl DumpOrchestrator {
    pub fn new(
        batch_store: BatchStore,
        store: DumpStore,
        downloader: Arc<DumpDownloader>,
        processor: DumpProcessor,
        publisher: Arc<dyn ProgressPublisher>,
    ) -> Self {
        Self {
            batch_store,
            store,
            downloader,
            processor,
            publisher,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Access to the persisted batch state (status queries)
    pub fn batch_store(&self) -> &BatchStore {
        &self.batch_store
    }

    /// Full batch aggregate for the status endpoint
    pub async fn get_status(&self, year_month: YearMonth) -> Result<Option<DumpBatch>> {
        self.batch_store.get_batch(year_month).await
    }

    /// Start downloading a monthly batch
    ///
    /// Fails with `Conflict` while any batch is downloading or processing.
    /// On success the download (and, once the files validate, processing)
    /// continues in the background.
    pub async fn trigger_download(&self, year_month: YearMonth) -> Result<()> {
        self.batch_store.begin_download(year_month).await?;
        info!("Dump download triggered for {}", year_month);

        let token = CancellationToken::new();
        let this = self.clone();
        let run_token = token.clone();
        let handle = tokio::spawn(async move {
            this.run_download(year_month, run_token).await;
            this.active.lock().unwrap().remove(&year_month);
        });

        self.register_run(year_month, token, handle);
        Ok(())
    }

    /// Re-run the processing pipeline over already-downloaded files
    ///
    /// Valid only for `ready_for_processing`, `completed`, or `failed`
    /// batches; clears all step state, never re-downloads.
    pub async fn trigger_reprocess(&self, year_month: YearMonth) -> Result<()> {
        self.batch_store.begin_reprocess(year_month).await?;
        info!("Dump reprocess triggered for {}", year_month);

        let token = CancellationToken::new();
        let this = self.clone();
        let run_token = token.clone();
        let handle = tokio::spawn(async move {
            this.execute_pipeline(year_month, run_token).await;
            this.active.lock().unwrap().remove(&year_month);
        });

        self.register_run(year_month, token, handle);
        Ok(())
    }

    /// Cancel any in-flight work for a batch and wipe its state
    ///
    /// Valid only for `downloading`, `processing`, or `failed` batches.
    /// Cancellation is acknowledged (the task has fully stopped) before any
    /// state is cleared, so no writes for the batch can land afterwards.
    pub async fn reset(&self, year_month: YearMonth) -> Result<()> {
        self.batch_store.check_reset_allowed(year_month).await?;

        let run = self.active.lock().unwrap().remove(&year_month);
        if let Some(run) = run {
            info!("Cancelling in-flight work for {}", year_month);
            run.token.cancel();
            if let Err(e) = run.handle.await {
                warn!("Cancelled batch task for {} did not join cleanly: {}", year_month, e);
            }
        }

        self.store.delete_batch(year_month).await?;
        self.batch_store.clear_batch(year_month).await?;

        info!("Dump batch {} reset to not_started", year_month);
        Ok(())
    }

    fn register_run(&self, year_month: YearMonth, token: CancellationToken, handle: JoinHandle<()>) {
        let mut active = self.active.lock().unwrap();
        active.retain(|_, run| !run.handle.is_finished());
        active.insert(year_month, ActiveRun { token, handle });
    }

    /// Download all four files concurrently, then hand over to processing
    async fn run_download(&self, year_month: YearMonth, cancel: CancellationToken) {
        let checksums = match self.downloader.fetch_checksums(year_month).await {
            Ok(checksums) => checksums,
            Err(e) => {
                self.fail_batch(year_month, &format!("checksum manifest fetch failed: {e}"))
                    .await;
                return;
            },
        };

        let tracker = Arc::new(DownloadProgressTracker::new());
        let mut tasks: JoinSet<(DumpKind, Result<StoredDump>)> = JoinSet::new();

        for kind in DumpKind::ALL {
            let expected = checksums.get(&kind).cloned();
            if let Err(e) = self
                .batch_store
                .set_file_downloading(year_month, kind, expected.as_deref())
                .await
            {
                self.fail_batch(year_month, &format!("failed to record file state: {e}"))
                    .await;
                return;
            }

            let downloader = Arc::clone(&self.downloader);
            let store = self.store.clone();
            let publisher = Arc::clone(&self.publisher);
            let tracker = Arc::clone(&tracker);
            let token = cancel.clone();

            tasks.spawn(async move {
                let result = downloader
                    .download_file(
                        year_month,
                        kind,
                        expected.as_deref(),
                        &store,
                        &token,
                        &tracker,
                        publisher.as_ref(),
                    )
                    .await;
                (kind, result)
            });
        }

        let mut first_error: Option<String> = None;
        let mut validated: u32 = 0;

        while let Some(joined) = tasks.join_next().await {
            let Ok((kind, result)) = joined else {
                first_error.get_or_insert_with(|| "download task panicked".to_string());
                continue;
            };

            // Once the batch is cancelled, state belongs to the reset flow.
            if cancel.is_cancelled() {
                continue;
            }

            match result {
                Ok(stored) => {
                    validated += 1;
                    if let Err(e) = self
                        .batch_store
                        .set_file_validated(year_month, kind, &stored.sha256, stored.size_bytes)
                        .await
                    {
                        first_error.get_or_insert_with(|| e.to_string());
                        continue;
                    }
                    self.publisher.publish(ProgressEvent::file_validated(
                        kind,
                        tracker.percentage(),
                        validated,
                    ));
                },
                Err(DumpError::Cancelled) => {},
                Err(e) => {
                    let downloaded = matches!(e, DumpError::ChecksumMismatch { .. });
                    let computed = match &e {
                        DumpError::ChecksumMismatch { actual, .. } => Some(actual.clone()),
                        _ => None,
                    };
                    let message = format!("{kind} download failed: {e}");

                    if let Err(store_err) = self
                        .batch_store
                        .set_file_failed(
                            year_month,
                            kind,
                            downloaded,
                            computed.as_deref(),
                            &message,
                        )
                        .await
                    {
                        error!("Failed to record file failure for {}: {}", kind, store_err);
                    }
                    self.publisher.publish(ProgressEvent::file_failed(
                        kind,
                        tracker.percentage(),
                        message.clone(),
                    ));
                    first_error.get_or_insert(message);
                },
            }
        }

        if cancel.is_cancelled() {
            info!("Download for {} cancelled", year_month);
            return;
        }

        if let Some(message) = first_error {
            self.fail_batch(year_month, &message).await;
            return;
        }

        match self.batch_store.finish_download(year_month).await {
            Ok(true) => {
                info!("All dump files for {} validated", year_month);
            },
            Ok(false) => {
                warn!("Batch {} left downloading state mid-run, not advancing", year_month);
                return;
            },
            Err(e) => {
                error!("Failed to finish download for {}: {}", year_month, e);
                return;
            },
        }

        // Processing auto-starts once the files are validated
        match self.batch_store.start_processing(year_month).await {
            Ok(true) => self.execute_pipeline(year_month, cancel).await,
            Ok(false) => warn!("Batch {} was not ready for processing", year_month),
            Err(e) => error!("Failed to start processing for {}: {}", year_month, e),
        }
    }

    /// Run the pipeline and record the terminal batch state
    async fn execute_pipeline(&self, year_month: YearMonth, cancel: CancellationToken) {
        match self.processor.run_pipeline(year_month, cancel.clone()).await {
            Ok(()) => match self.batch_store.complete_batch(year_month).await {
                Ok(true) => info!("Dump batch {} completed", year_month),
                Ok(false) => warn!("Batch {} left processing state mid-run", year_month),
                Err(e) => error!("Failed to complete batch {}: {}", year_month, e),
            },
            Err(DumpError::Cancelled) => {
                info!("Processing for {} cancelled", year_month);
            },
            Err(e) => {
                if !cancel.is_cancelled() {
                    self.fail_batch(year_month, &e.to_string()).await;
                }
            },
        }
    }

    async fn fail_batch(&self, year_month: YearMonth, message: &str) {
        error!("Dump batch {} failed: {}", year_month, message);
        if let Err(e) = self.batch_store.fail_batch(year_month, message).await {
            error!("Failed to record batch failure for {}: {}", year_month, e);
        }
    }
}

// End-to-end tests below need a live PostgreSQL with migrations applied;
// run them with `cargo test -- --ignored` and DATABASE_URL set.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::dumps::config::DumpsConfig;
    use crate::dumps::progress::BroadcastPublisher;
    use crate::dumps::types::BatchStatus;
    use crate::store::StoreConfig;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use sha2::{Digest, Sha256};
    use sqlx::PgPool;
    use std::io::Write;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gzip(data: &str) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data.as_bytes()).unwrap();
        encoder.finish().unwrap()
    }

    async fn mount_dump(server: &MockServer, file_name: &str, body: Vec<u8>) {
        Mock::given(method("GET"))
            .and(path(format!("/2033/{file_name}")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(server)
            .await;
    }

    async fn orchestrator_with_mock(
        server: &MockServer,
        pool: PgPool,
        dir: &tempfile::TempDir,
    ) -> DumpOrchestrator {
        let store = DumpStore::create(StoreConfig {
            root_dir: dir.path().join("dumps"),
        })
        .await
        .unwrap();

        let config = DumpsConfig {
            base_url: server.uri(),
            max_retries: 2,
            ..Default::default()
        };
        let downloader = Arc::new(DumpDownloader::new(config).unwrap());
        let publisher: Arc<dyn ProgressPublisher> = Arc::new(BroadcastPublisher::default());
        let batch_store = BatchStore::new(pool.clone());
        let processor = DumpProcessor::new(
            pool,
            store.clone(),
            batch_store.clone(),
            Arc::clone(&publisher),
            100,
        );

        DumpOrchestrator::new(batch_store, store, downloader, processor, publisher)
    }

    async fn wait_for_terminal(
        orchestrator: &DumpOrchestrator,
        year_month: YearMonth,
    ) -> BatchStatus {
        for _ in 0..200 {
            let status = orchestrator
                .batch_store()
                .batch_status(year_month)
                .await
                .unwrap()
                .unwrap();
            if !status.is_active() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("batch never reached a terminal status");
    }

    #[tokio::test]
    #[ignore] // requires a live database
    async fn test_trigger_downloads_processes_and_completes() {
        let year_month: YearMonth = "2033-01".parse().unwrap();
        let server = MockServer::start().await;

        let dumps = [
            (DumpKind::Artists, "<artists><artist><id>1</id><name>A</name></artist></artists>"),
            (DumpKind::Labels, "<labels><label><id>2</id><name>L</name></label></labels>"),
            (
                DumpKind::Masters,
                "<masters><master id=\"3\"><title>M</title><genres><genre>Rock</genre></genres></master></masters>",
            ),
            (
                DumpKind::Releases,
                "<releases><release id=\"4\"><title>R</title><genres><genre>Rock</genre></genres></release></releases>",
            ),
        ];

        let mut manifest = String::new();
        for (kind, xml) in dumps {
            let body = gzip(xml);
            manifest.push_str(&format!(
                "{} {}\n",
                hex::encode(Sha256::digest(&body)),
                kind.file_name(year_month)
            ));
            mount_dump(&server, &kind.file_name(year_month), body).await;
        }

        Mock::given(method("GET"))
            .and(path("/2033/discogs_20330101_CHECKSUM.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_string(manifest))
            .mount(&server)
            .await;

        let url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgresql://localhost/spinlog_test".to_string());
        let pool = PgPool::connect(&url).await.expect("test database");
        sqlx::migrate!("../../migrations").run(&pool).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator_with_mock(&server, pool, &dir).await;
        orchestrator.batch_store().clear_batch(year_month).await.ok();

        orchestrator.trigger_download(year_month).await.unwrap();

        // A second trigger while active must conflict and change nothing
        let err = orchestrator.trigger_download(year_month).await.unwrap_err();
        assert!(matches!(err, DumpError::Conflict));

        let status = wait_for_terminal(&orchestrator, year_month).await;
        assert_eq!(status, BatchStatus::Completed);

        let batch = orchestrator.get_status(year_month).await.unwrap().unwrap();
        assert!(batch.all_files_validated());
        assert_eq!(batch.steps.len(), 13);
        assert!(batch.steps.values().all(|s| s.completed));
        assert!(batch.download_completed_at.is_some());
        assert!(batch.processing_completed_at.is_some());
    }

    #[tokio::test]
    #[ignore] // requires a live database
    async fn test_checksum_mismatch_fails_batch_but_keeps_sibling_state() {
        let year_month: YearMonth = "2033-02".parse().unwrap();
        let server = MockServer::start().await;

        let good = [
            (DumpKind::Artists, "<artists><artist><id>1</id><name>A</name></artist></artists>"),
            (DumpKind::Labels, "<labels><label><id>2</id><name>L</name></label></labels>"),
            (DumpKind::Masters, "<masters><master id=\"3\"><title>M</title></master></masters>"),
        ];

        let mut manifest = String::new();
        for (kind, xml) in good {
            let body = gzip(xml);
            manifest.push_str(&format!(
                "{} {}\n",
                hex::encode(Sha256::digest(&body)),
                kind.file_name(year_month)
            ));
            mount_dump(&server, &kind.file_name(year_month), body).await;
        }

        // Releases body will not match its manifest entry
        manifest.push_str(&format!(
            "{} {}\n",
            "0".repeat(64),
            DumpKind::Releases.file_name(year_month)
        ));
        mount_dump(
            &server,
            &DumpKind::Releases.file_name(year_month),
            gzip("<releases></releases>"),
        )
        .await;

        Mock::given(method("GET"))
            .and(path("/2033/discogs_20330201_CHECKSUM.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_string(manifest))
            .mount(&server)
            .await;

        let url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgresql://localhost/spinlog_test".to_string());
        let pool = PgPool::connect(&url).await.expect("test database");
        sqlx::migrate!("../../migrations").run(&pool).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator_with_mock(&server, pool, &dir).await;
        orchestrator.batch_store().clear_batch(year_month).await.ok();

        orchestrator.trigger_download(year_month).await.unwrap();
        let status = wait_for_terminal(&orchestrator, year_month).await;
        assert_eq!(status, BatchStatus::Failed);

        let batch = orchestrator.get_status(year_month).await.unwrap().unwrap();
        assert!(batch.error_message.unwrap().contains("releases"));
        // Sibling files keep their validated state, not wiped by the failure
        assert!(batch.files[&DumpKind::Artists].validated);
        assert!(batch.files[&DumpKind::Labels].validated);
        assert!(batch.files[&DumpKind::Masters].validated);
        assert!(!batch.files[&DumpKind::Releases].validated);

        // Reset clears everything back to not_started
        orchestrator.reset(year_month).await.unwrap();
        let batch = orchestrator.get_status(year_month).await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::NotStarted);
        assert!(batch.files.is_empty());
        assert!(batch.steps.is_empty());
    }
}
