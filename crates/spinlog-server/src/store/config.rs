//! Dump store configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default root directory for downloaded dump artifacts.
pub const DEFAULT_DUMPS_DIR: &str = "./data/dumps";

/// Configuration for the on-disk dump store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Root directory; one subdirectory is created per `year_month`
    pub root_dir: PathBuf,
}

impl StoreConfig {
    /// Load store configuration from environment variables
    ///
    /// Environment variables:
    /// - `DUMPS_STORE_DIR`: Root directory for dump artifacts
    pub fn from_env() -> anyhow::Result<Self> {
        let root_dir = std::env::var("DUMPS_STORE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_DUMPS_DIR));

        let config = Self { root_dir };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.root_dir.as_os_str().is_empty() {
            anyhow::bail!("DUMPS_STORE_DIR cannot be empty");
        }
        Ok(())
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from(DEFAULT_DUMPS_DIR),
        }
    }
}
