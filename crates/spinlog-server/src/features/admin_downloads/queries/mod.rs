//! Read operations for the admin downloads feature

pub mod get_status;

pub use get_status::GetDownloadStatusQuery;
