//! Spinlog Server Library
//!
//! HTTP server for the Spinlog vinyl-collection tracker. The user-facing
//! collection features live elsewhere; this crate carries the bulk
//! catalog-dump ingestion subsystem and its admin control surface:
//!
//! - **dumps**: download orchestration, checksum validation, and the
//!   13-step dependency-ordered ETL that loads monthly provider dumps into
//!   the catalog schema
//! - **store**: disk-backed artifact store for downloaded dump files
//! - **features**: admin REST API (trigger / reprocess / reset / status)
//!   organized as CQRS feature slices
//! - **config / middleware / error**: environment configuration, tower
//!   layers, and HTTP error mapping
//!
//! # Architecture
//!
//! Admin commands only enqueue or query state; the pipeline itself runs as
//! background tasks. Batch state is persisted per `year_month` and every
//! file/step mutation is a single atomic statement, so the pipeline can
//! resume across restarts and concurrent completions cannot lose updates.

pub mod config;
pub mod dumps;
pub mod error;
pub mod features;
pub mod middleware;
pub mod store;

// Re-export commonly used types
pub use error::{AppError, AppResult};
