//! Progress event contract and publisher seam
//!
//! Every file/step state change publishes a [`ProgressEvent`]. The pipeline
//! only knows the one-method [`ProgressPublisher`] trait; the transport that
//! fans events out to admin clients (WebSocket or otherwise) subscribes to
//! the broadcast implementation from the outside.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::trace;

use super::steps::ProcessingStep;
use super::types::DumpKind;

/// What a progress event refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressKind {
    File,
    Step,
}

/// A single progress update, serialized camelCase for the admin UI
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub kind: ProgressKind,
    pub identifier: String,
    pub percentage: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files_processed: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_files: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ProgressEvent {
    /// Byte-level download progress for one file, with the aggregate percentage
    pub fn file_progress(kind: DumpKind, percentage: f64) -> Self {
        Self {
            kind: ProgressKind::File,
            identifier: kind.as_str().to_string(),
            percentage,
            files_processed: None,
            total_files: None,
            error_message: None,
        }
    }

    /// A file finished validating
    pub fn file_validated(kind: DumpKind, percentage: f64, files_processed: u32) -> Self {
        Self {
            kind: ProgressKind::File,
            identifier: kind.as_str().to_string(),
            percentage,
            files_processed: Some(files_processed),
            total_files: Some(DumpKind::ALL.len() as u32),
            error_message: None,
        }
    }

    /// A file failed to download or validate
    pub fn file_failed(kind: DumpKind, percentage: f64, error_message: String) -> Self {
        Self {
            kind: ProgressKind::File,
            identifier: kind.as_str().to_string(),
            percentage,
            files_processed: None,
            total_files: Some(DumpKind::ALL.len() as u32),
            error_message: Some(error_message),
        }
    }

    /// A processing step completed, with steps-completed percentage
    pub fn step_completed(step: ProcessingStep, percentage: f64) -> Self {
        Self {
            kind: ProgressKind::Step,
            identifier: step.as_str().to_string(),
            percentage,
            files_processed: None,
            total_files: None,
            error_message: None,
        }
    }

    /// A processing step failed
    pub fn step_failed(step: ProcessingStep, percentage: f64, error_message: String) -> Self {
        Self {
            kind: ProgressKind::Step,
            identifier: step.as_str().to_string(),
            percentage,
            files_processed: None,
            total_files: None,
            error_message: Some(error_message),
        }
    }
}

/// Narrow publish seam between the pipeline and any transport
pub trait ProgressPublisher: Send + Sync {
    fn publish(&self, event: ProgressEvent);
}

/// Default publisher backed by a tokio broadcast channel
///
/// Publishing never blocks and never fails: with no subscribers the event
/// is simply dropped.
pub struct BroadcastPublisher {
    tx: broadcast::Sender<ProgressEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe a new consumer (e.g. a WebSocket fan-out task)
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(256)
    }
}

impl ProgressPublisher for BroadcastPublisher {
    fn publish(&self, event: ProgressEvent) {
        trace!(identifier = %event.identifier, percentage = event.percentage, "progress");
        let _ = self.tx.send(event);
    }
}

/// Publisher that drops everything (tests)
pub struct NullPublisher;

impl ProgressPublisher for NullPublisher {
    fn publish(&self, _event: ProgressEvent) {}
}

/// Aggregates per-file byte counts into one download percentage
///
/// The admin UI shows a single bar for the whole batch, so percentage is
/// total bytes transferred over total expected bytes across all four files.
/// Files without a known content length contribute only after completion.
#[derive(Default)]
pub struct DownloadProgressTracker {
    slots: Mutex<HashMap<DumpKind, (u64, u64)>>,
}

impl DownloadProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the expected size of one file
    pub fn set_total(&self, kind: DumpKind, total_bytes: u64) {
        let mut slots = self.slots.lock().unwrap();
        let entry = slots.entry(kind).or_insert((0, 0));
        entry.1 = total_bytes;
    }

    /// Record transferred bytes for one file and return the aggregate percentage
    pub fn record(&self, kind: DumpKind, transferred_bytes: u64) -> f64 {
        let mut slots = self.slots.lock().unwrap();
        let entry = slots.entry(kind).or_insert((0, 0));
        entry.0 = transferred_bytes;
        Self::percentage_locked(&slots)
    }

    /// Current aggregate percentage
    pub fn percentage(&self) -> f64 {
        let slots = self.slots.lock().unwrap();
        Self::percentage_locked(&slots)
    }

    fn percentage_locked(slots: &HashMap<DumpKind, (u64, u64)>) -> f64 {
        let (transferred, total) = slots
            .values()
            .fold((0u64, 0u64), |(t, s), (tr, to)| (t + tr, s + to));
        if total == 0 {
            return 0.0;
        }
        (transferred as f64 / total as f64) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_camel_case_and_skips_none() {
        let event = ProgressEvent::file_progress(DumpKind::Artists, 12.5);
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["kind"], "file");
        assert_eq!(json["identifier"], "artists");
        assert_eq!(json["percentage"], 12.5);
        assert!(json.get("filesProcessed").is_none());
        assert!(json.get("errorMessage").is_none());
    }

    #[test]
    fn test_validated_event_carries_file_counts() {
        let event = ProgressEvent::file_validated(DumpKind::Masters, 75.0, 3);
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["filesProcessed"], 3);
        assert_eq!(json["totalFiles"], 4);
    }

    #[test]
    fn test_step_failed_event() {
        let event = ProgressEvent::step_failed(
            ProcessingStep::MastersProcessing,
            30.0,
            "bad gzip".to_string(),
        );
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["kind"], "step");
        assert_eq!(json["identifier"], "masters_processing");
        assert_eq!(json["errorMessage"], "bad gzip");
    }

    #[tokio::test]
    async fn test_broadcast_publisher_delivers_to_subscribers() {
        let publisher = BroadcastPublisher::new(8);
        let mut rx = publisher.subscribe();

        let event = ProgressEvent::file_progress(DumpKind::Labels, 50.0);
        publisher.publish(event.clone());

        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let publisher = BroadcastPublisher::new(8);
        publisher.publish(ProgressEvent::file_progress(DumpKind::Labels, 1.0));
    }

    #[test]
    fn test_download_tracker_aggregates_across_files() {
        let tracker = DownloadProgressTracker::new();
        for kind in DumpKind::ALL {
            tracker.set_total(kind, 100);
        }

        assert_eq!(tracker.record(DumpKind::Artists, 100), 25.0);
        assert_eq!(tracker.record(DumpKind::Labels, 50), 37.5);
        tracker.record(DumpKind::Masters, 100);
        assert_eq!(tracker.record(DumpKind::Releases, 150), 100.0);
    }

    #[test]
    fn test_download_tracker_with_no_totals() {
        let tracker = DownloadProgressTracker::new();
        assert_eq!(tracker.percentage(), 0.0);
        assert_eq!(tracker.record(DumpKind::Artists, 10), 0.0);
    }
}
