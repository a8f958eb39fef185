//! Streaming dump downloads
//!
//! One downloader instance serves all four file kinds. Bytes stream
//! straight into the dump store writer (which hashes them en route) while
//! byte-level progress events go out through the publisher seam. Network
//! failures retry with exponential backoff up to the configured attempt
//! count; a checksum mismatch is fatal for the file and never retried.

use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use spinlog_common::checksum::verify_checksum;
use spinlog_common::YearMonth;

use crate::store::{DumpStore, StoredDump};

use super::config::DumpsConfig;
use super::progress::{DownloadProgressTracker, ProgressEvent, ProgressPublisher};
use super::types::DumpKind;
use super::{DumpError, Result};

/// HTTP client for the provider's dump mirror
pub struct DumpDownloader {
    client: reqwest::Client,
    config: DumpsConfig,
}

impl DumpDownloader {
    /// Create a new downloader with the given configuration
    pub fn new(config: DumpsConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .user_agent("spinlog-dumps/0.1")
            .build()
            .map_err(|e| DumpError::Network(e.to_string()))?;

        Ok(Self { client, config })
    }

    /// Fetch and parse the monthly checksum manifest
    ///
    /// Returns the expected SHA-256 per file kind; kinds missing from the
    /// manifest are simply absent (their download then skips validation).
    pub async fn fetch_checksums(&self, year_month: YearMonth) -> Result<HashMap<DumpKind, String>> {
        let url = self.config.checksum_url(year_month);
        info!("Fetching checksum manifest from {}", url);

        let mut last_error = None;
        for attempt in 1..=self.config.max_retries {
            match self.get_text(&url).await {
                Ok(text) => return Ok(parse_checksum_manifest(&text, year_month)),
                Err(e) => {
                    warn!(
                        "Checksum manifest attempt {}/{} failed: {}",
                        attempt, self.config.max_retries, e
                    );
                    last_error = Some(e);
                    if attempt < self.config.max_retries {
                        tokio::time::sleep(backoff_delay(attempt)).await;
                    }
                },
            }
        }

        Err(last_error.unwrap_or_else(|| DumpError::Network("manifest fetch failed".into())))
    }

    async fn get_text(&self, url: &str) -> Result<String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| DumpError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(DumpError::Network(format!(
                "HTTP {} for {}",
                response.status(),
                url
            )));
        }

        response
            .text()
            .await
            .map_err(|e| DumpError::Network(e.to_string()))
    }

    /// Download one dump file into the store and validate its checksum
    ///
    /// Network failures retry with exponential backoff; checksum mismatches
    /// fail immediately. Cancellation aborts the in-flight write and
    /// removes the partial artifact.
    #[allow(clippy::too_many_arguments)]
    pub async fn download_file(
        &self,
        year_month: YearMonth,
        kind: DumpKind,
        expected_checksum: Option<&str>,
        store: &DumpStore,
        cancel: &CancellationToken,
        tracker: &DownloadProgressTracker,
        publisher: &dyn ProgressPublisher,
    ) -> Result<StoredDump> {
        let mut last_error = None;

        for attempt in 1..=self.config.max_retries {
            match self
                .stream_to_store(year_month, kind, store, cancel, tracker, publisher)
                .await
            {
                Ok(stored) => {
                    if let Some(expected) = expected_checksum {
                        verify_checksum(expected, &stored.sha256)?;
                    }
                    info!(
                        kind = %kind,
                        bytes = stored.size_bytes,
                        "Dump file downloaded and validated"
                    );
                    return Ok(stored);
                },
                Err(DumpError::Network(message)) => {
                    warn!(
                        kind = %kind,
                        "Download attempt {}/{} failed: {}",
                        attempt, self.config.max_retries, message
                    );
                    last_error = Some(DumpError::Network(message));

                    if attempt < self.config.max_retries {
                        let delay = backoff_delay(attempt);
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(DumpError::Cancelled),
                            _ = tokio::time::sleep(delay) => {},
                        }
                    }
                },
                // Checksum mismatches, storage failures, and cancellation
                // are not retryable at this layer.
                Err(other) => return Err(other),
            }
        }

        Err(last_error.unwrap_or_else(|| DumpError::Network("download failed".into())))
    }

    /// One streaming attempt: HTTP body -> store writer, hashing en route
    async fn stream_to_store(
        &self,
        year_month: YearMonth,
        kind: DumpKind,
        store: &DumpStore,
        cancel: &CancellationToken,
        tracker: &DownloadProgressTracker,
        publisher: &dyn ProgressPublisher,
    ) -> Result<StoredDump> {
        let url = self.config.file_url(year_month, kind);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| DumpError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(DumpError::Network(format!(
                "HTTP {} for {}",
                response.status(),
                url
            )));
        }

        if let Some(len) = response.content_length() {
            tracker.set_total(kind, len);
        }

        let mut writer = store.writer(year_month, kind).await?;
        let mut stream = response.bytes_stream();
        let mut last_published = -1.0f64;

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    writer.abort().await.ok();
                    return Err(DumpError::Cancelled);
                },
                chunk = stream.next() => chunk,
            };

            let Some(chunk) = chunk else { break };
            let chunk = chunk.map_err(|e| DumpError::Network(e.to_string()))?;

            writer.write_chunk(&chunk).await?;

            let percentage = tracker.record(kind, writer.bytes_written() as u64);
            // Throttle to whole-percent changes; dumps are gigabytes and
            // chunk-level events would swamp subscribers.
            if percentage - last_published >= 1.0 {
                publisher.publish(ProgressEvent::file_progress(kind, percentage));
                last_published = percentage;
            }
        }

        Ok(writer.finish().await?)
    }
}

/// Exponential backoff: 2^attempt seconds
fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(2u64.pow(attempt))
}

/// Parse a checksum manifest: one `<sha256> <filename>` pair per line
fn parse_checksum_manifest(text: &str, year_month: YearMonth) -> HashMap<DumpKind, String> {
    let mut checksums = HashMap::new();

    for line in text.lines() {
        let mut parts = line.split_whitespace();
        let (Some(hash), Some(file_name)) = (parts.next(), parts.next_back()) else {
            continue;
        };

        for kind in DumpKind::ALL {
            if file_name == kind.file_name(year_month) {
                checksums.insert(kind, hash.to_string());
            }
        }
    }

    checksums
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dumps::progress::NullPublisher;
    use crate::store::StoreConfig;
    use sha2::{Digest, Sha256};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ym() -> YearMonth {
        "2024-06".parse().unwrap()
    }

    fn config_for(server: &MockServer, max_retries: u32) -> DumpsConfig {
        DumpsConfig {
            base_url: server.uri(),
            max_retries,
            ..Default::default()
        }
    }

    async fn temp_store() -> (tempfile::TempDir, DumpStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DumpStore::create(StoreConfig {
            root_dir: dir.path().join("dumps"),
        })
        .await
        .unwrap();
        (dir, store)
    }

    fn sha256_hex(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    #[tokio::test]
    async fn test_download_streams_and_validates() {
        let server = MockServer::start().await;
        let body = b"<artists></artists>".to_vec();
        let expected = sha256_hex(&body);

        Mock::given(method("GET"))
            .and(path("/2024/discogs_20240601_artists.xml.gz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .expect(1)
            .mount(&server)
            .await;

        let downloader = DumpDownloader::new(config_for(&server, 3)).unwrap();
        let (_tmp, store) = temp_store().await;
        let tracker = DownloadProgressTracker::new();

        let stored = downloader
            .download_file(
                ym(),
                DumpKind::Artists,
                Some(&expected),
                &store,
                &CancellationToken::new(),
                &tracker,
                &NullPublisher,
            )
            .await
            .unwrap();

        assert_eq!(stored.sha256, expected);
        assert_eq!(stored.size_bytes, body.len() as i64);
        assert_eq!(tracker.percentage(), 100.0);
        assert!(store.exists(ym(), DumpKind::Artists).await);
    }

    #[tokio::test]
    async fn test_network_error_retries_then_succeeds() {
        let server = MockServer::start().await;
        let body = b"dump bytes".to_vec();

        Mock::given(method("GET"))
            .and(path("/2024/discogs_20240601_labels.xml.gz"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/2024/discogs_20240601_labels.xml.gz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .expect(1)
            .mount(&server)
            .await;

        let downloader = DumpDownloader::new(config_for(&server, 2)).unwrap();
        let (_tmp, store) = temp_store().await;

        let stored = downloader
            .download_file(
                ym(),
                DumpKind::Labels,
                None,
                &store,
                &CancellationToken::new(),
                &DownloadProgressTracker::new(),
                &NullPublisher,
            )
            .await
            .unwrap();

        assert_eq!(stored.sha256, sha256_hex(&body));
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_with_network_error() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/2024/discogs_20240601_masters.xml.gz"))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&server)
            .await;

        let downloader = DumpDownloader::new(config_for(&server, 2)).unwrap();
        let (_tmp, store) = temp_store().await;

        let err = downloader
            .download_file(
                ym(),
                DumpKind::Masters,
                None,
                &store,
                &CancellationToken::new(),
                &DownloadProgressTracker::new(),
                &NullPublisher,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, DumpError::Network(_)));
    }

    #[tokio::test]
    async fn test_checksum_mismatch_is_not_retried() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/2024/discogs_20240601_releases.xml.gz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"corrupt".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let downloader = DumpDownloader::new(config_for(&server, 3)).unwrap();
        let (_tmp, store) = temp_store().await;

        let err = downloader
            .download_file(
                ym(),
                DumpKind::Releases,
                Some("0000000000000000000000000000000000000000000000000000000000000000"),
                &store,
                &CancellationToken::new(),
                &DownloadProgressTracker::new(),
                &NullPublisher,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, DumpError::ChecksumMismatch { .. }));
    }

    #[tokio::test]
    async fn test_pre_cancelled_download_aborts() {
        let server = MockServer::start().await;
        let body = vec![0u8; 64 * 1024];

        Mock::given(method("GET"))
            .and(path("/2024/discogs_20240601_artists.xml.gz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(&server)
            .await;

        let downloader = DumpDownloader::new(config_for(&server, 1)).unwrap();
        let (_tmp, store) = temp_store().await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = downloader
            .download_file(
                ym(),
                DumpKind::Artists,
                None,
                &store,
                &cancel,
                &DownloadProgressTracker::new(),
                &NullPublisher,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, DumpError::Cancelled));
        assert!(!store.exists(ym(), DumpKind::Artists).await);
    }

    #[tokio::test]
    async fn test_fetch_checksums() {
        let server = MockServer::start().await;
        let manifest = "\
aaaa discogs_20240601_artists.xml.gz
bbbb discogs_20240601_labels.xml.gz
cccc discogs_20240601_masters.xml.gz
dddd discogs_20240601_releases.xml.gz
";

        Mock::given(method("GET"))
            .and(path("/2024/discogs_20240601_CHECKSUM.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_string(manifest))
            .mount(&server)
            .await;

        let downloader = DumpDownloader::new(config_for(&server, 1)).unwrap();
        let checksums = downloader.fetch_checksums(ym()).await.unwrap();

        assert_eq!(checksums.len(), 4);
        assert_eq!(checksums[&DumpKind::Artists], "aaaa");
        assert_eq!(checksums[&DumpKind::Releases], "dddd");
    }

    #[test]
    fn test_parse_manifest_ignores_unknown_lines() {
        let text = "\
aaaa discogs_20240601_artists.xml.gz
not-a-manifest-line
bbbb some_other_file.txt
";
        let checksums = parse_checksum_manifest(text, ym());
        assert_eq!(checksums.len(), 1);
        assert_eq!(checksums[&DumpKind::Artists], "aaaa");
    }
}
