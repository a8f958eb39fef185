//! Write operations for the admin downloads feature

pub mod reprocess;
pub mod reset;
pub mod trigger;

pub use reprocess::ReprocessCommand;
pub use reset::ResetCommand;
pub use trigger::TriggerDownloadCommand;
