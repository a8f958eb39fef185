//! Spinlog Common Library
//!
//! Shared building blocks used by the Spinlog server:
//!
//! - **error**: Common error taxonomy (`SpinlogError`)
//! - **checksum**: SHA-256 utilities, including an incremental hasher for
//!   verifying files while they are being written
//! - **logging**: Centralized tracing setup (console/file, text/JSON)
//! - **types**: Small value types such as [`types::YearMonth`]

pub mod checksum;
pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{Result, SpinlogError};
pub use types::YearMonth;
