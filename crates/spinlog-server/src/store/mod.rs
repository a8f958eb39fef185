//! Disk-backed store for downloaded dump artifacts
//!
//! Download tasks stream bytes through [`DumpWriter`], which hashes while it
//! writes so validation never re-reads multi-gigabyte files. The processing
//! pipeline reads artifacts back by path, and `Reset` deletes them through
//! the same interface.

use spinlog_common::checksum::StreamingChecksum;
use spinlog_common::{Result, YearMonth};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

pub mod config;

use crate::dumps::types::DumpKind;
pub use config::StoreConfig;

/// A fully written dump artifact
#[derive(Debug, Clone)]
pub struct StoredDump {
    pub path: PathBuf,
    pub sha256: String,
    pub size_bytes: i64,
}

/// Disk-backed dump store
///
/// Artifacts live at `<root>/<year_month>/<file_name>`, one directory per
/// batch so a whole batch can be deleted in one call.
#[derive(Clone)]
pub struct DumpStore {
    root: PathBuf,
}

impl DumpStore {
    /// Create the store, ensuring the root directory exists
    pub async fn create(config: StoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.root_dir).await?;
        info!("Dump store initialized at {}", config.root_dir.display());
        Ok(Self {
            root: config.root_dir,
        })
    }

    /// Path of the artifact for a given batch and file kind
    pub fn path(&self, year_month: YearMonth, kind: DumpKind) -> PathBuf {
        self.batch_dir(year_month).join(kind.file_name(year_month))
    }

    fn batch_dir(&self, year_month: YearMonth) -> PathBuf {
        self.root.join(year_month.to_string())
    }

    /// Whether an artifact exists on disk
    pub async fn exists(&self, year_month: YearMonth, kind: DumpKind) -> bool {
        fs::try_exists(self.path(year_month, kind)).await.unwrap_or(false)
    }

    /// Open a streaming writer for an artifact
    ///
    /// Any existing artifact for the same batch/kind is overwritten.
    pub async fn writer(&self, year_month: YearMonth, kind: DumpKind) -> Result<DumpWriter> {
        let dir = self.batch_dir(year_month);
        fs::create_dir_all(&dir).await?;

        let path = self.path(year_month, kind);
        let file = File::create(&path).await?;
        debug!("Opened dump writer at {}", path.display());

        Ok(DumpWriter {
            file,
            path,
            hasher: StreamingChecksum::new(),
            bytes_written: 0,
        })
    }

    /// Delete a single artifact; missing files are not an error
    pub async fn delete(&self, year_month: YearMonth, kind: DumpKind) -> Result<()> {
        remove_if_exists(&self.path(year_month, kind)).await
    }

    /// Delete every artifact belonging to a batch
    pub async fn delete_batch(&self, year_month: YearMonth) -> Result<()> {
        let dir = self.batch_dir(year_month);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!("Deleted dump artifacts for {}", year_month);
                Ok(())
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Streaming artifact writer that hashes while writing
pub struct DumpWriter {
    file: File,
    path: PathBuf,
    hasher: StreamingChecksum,
    bytes_written: i64,
}

impl DumpWriter {
    /// Append a chunk, updating the running checksum
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.file.write_all(chunk).await?;
        self.hasher.update(chunk);
        self.bytes_written += chunk.len() as i64;
        Ok(())
    }

    /// Bytes written so far
    pub fn bytes_written(&self) -> i64 {
        self.bytes_written
    }

    /// Flush and return the finished artifact with its checksum
    pub async fn finish(mut self) -> Result<StoredDump> {
        self.file.flush().await?;
        self.file.sync_all().await?;

        Ok(StoredDump {
            path: self.path,
            sha256: self.hasher.finalize(),
            size_bytes: self.bytes_written,
        })
    }

    /// Abandon the write and remove the partial file
    pub async fn abort(self) -> Result<()> {
        drop(self.file);
        remove_if_exists(&self.path).await
    }
}
