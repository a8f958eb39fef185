//! Admin control surface for the dump ingestion pipeline
//!
//! Thin routes over command/query handlers; all state transitions happen
//! behind the orchestrator's guarded paths, so these endpoints only enqueue
//! work or read state and return immediately.

pub mod commands;
pub mod queries;
pub mod routes;

pub use routes::{admin_downloads_routes, AdminDownloadsState};
