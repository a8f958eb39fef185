//! Dump ingestion configuration
//!
//! Everything the pipeline needs to find, fetch, and process the provider's
//! monthly dumps, loaded from `DUMPS_*` environment variables.

use serde::{Deserialize, Serialize};
use spinlog_common::YearMonth;
use std::time::Duration;

use super::types::DumpKind;

/// Default base URL of the provider's dump mirror.
pub const DEFAULT_BASE_URL: &str = "https://data.discogs.com/data";

/// Default number of download attempts per file before it is marked failed.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default per-request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Default scheduler check interval in seconds (6 hours).
pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 21_600;

/// Default number of records per parse/upsert batch.
pub const DEFAULT_BATCH_SIZE: usize = 1_000;

/// Configuration for the dump ingestion pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpsConfig {
    /// Whether the background scheduler auto-triggers the current month
    pub enabled: bool,
    /// Base URL of the dump mirror; files live under `<base>/<year>/`
    pub base_url: String,
    /// Download attempts per file before marking it failed
    pub max_retries: u32,
    /// Per-request timeout in seconds
    pub timeout_secs: u64,
    /// Scheduler check interval in seconds
    pub check_interval_secs: u64,
    /// Records per parse/upsert batch
    pub batch_size: usize,
}

impl DumpsConfig {
    /// Load dump configuration from environment variables
    ///
    /// Environment variables:
    /// - `DUMPS_ENABLED`: Auto-trigger the current month (default: false)
    /// - `DUMPS_BASE_URL`: Base URL of the dump mirror
    /// - `DUMPS_MAX_RETRIES`: Download attempts per file
    /// - `DUMPS_TIMEOUT_SECS`: Per-request timeout
    /// - `DUMPS_CHECK_INTERVAL_SECS`: Scheduler check interval
    /// - `DUMPS_BATCH_SIZE`: Records per parse/upsert batch
    pub fn from_env() -> anyhow::Result<Self> {
        let config = Self {
            enabled: std::env::var("DUMPS_ENABLED")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .unwrap_or(false),
            base_url: std::env::var("DUMPS_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
            max_retries: std::env::var("DUMPS_MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_MAX_RETRIES),
            timeout_secs: std::env::var("DUMPS_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_TIMEOUT_SECS),
            check_interval_secs: std::env::var("DUMPS_CHECK_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_CHECK_INTERVAL_SECS),
            batch_size: std::env::var("DUMPS_BATCH_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_BATCH_SIZE),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.base_url.is_empty() {
            anyhow::bail!("DUMPS_BASE_URL cannot be empty");
        }
        if self.max_retries == 0 {
            anyhow::bail!("DUMPS_MAX_RETRIES must be greater than 0");
        }
        if self.timeout_secs == 0 {
            anyhow::bail!("DUMPS_TIMEOUT_SECS must be greater than 0");
        }
        if self.batch_size == 0 {
            anyhow::bail!("DUMPS_BATCH_SIZE must be greater than 0");
        }
        if self.enabled && self.check_interval_secs == 0 {
            anyhow::bail!("DUMPS_CHECK_INTERVAL_SECS must be greater than 0");
        }
        Ok(())
    }

    /// URL of one dump file for a monthly snapshot
    pub fn file_url(&self, year_month: YearMonth, kind: DumpKind) -> String {
        format!(
            "{}/{}/{}",
            self.base_url.trim_end_matches('/'),
            year_month.year(),
            kind.file_name(year_month)
        )
    }

    /// URL of the checksum manifest for a monthly snapshot
    pub fn checksum_url(&self, year_month: YearMonth) -> String {
        format!(
            "{}/{}/discogs_{}_CHECKSUM.txt",
            self.base_url.trim_end_matches('/'),
            year_month.year(),
            year_month.first_day_compact()
        )
    }

    /// Per-request timeout as a Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Scheduler check interval as a Duration
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

impl Default for DumpsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: DEFAULT_BASE_URL.to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            check_interval_secs: DEFAULT_CHECK_INTERVAL_SECS,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}
