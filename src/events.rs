//! Callbacks the core uses to report what it is doing.
//!
//! Front-ends implement [`EventListener`] and hand an `Arc` of it to pages and queues. The
//! core never calls presentation code in any other way. All methods have to be thread-safe,
//! jobs report from their own tasks.
use std::fmt::Debug;
use std::sync::Arc;

use crate::page::PageStatus;
use crate::queue::job::DownloadJob;
use crate::queue::summary::BatchSummary;

/// Type of log event, used for styling or filtering messages in the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogType {
    /// General informational message.
    Info,
    /// File was skipped (e.g., duplicate, remote error).
    Skip,
    /// File was copied or moved from a previous download.
    Relocate,
    /// File was removed (e.g., MD5 mismatch before redownload).
    Remove,
    Success,
    /// A non-critical issue or warning.
    Warning,
    /// An error occurred for a specific item/file being processed.
    Error,
}

pub trait EventListener: Send + Sync + Debug {
    fn on_page_state_changed(&self, page: &PageStatus);

    fn on_job_state_changed(&self, job: &DownloadJob);

    /// Called once the queue drained all the jobs it was given.
    fn on_batch_summary(&self, summary: &BatchSummary);

    /// Byte level progress of an active job.
    fn on_job_progress(&self, _job_id: u64, _downloaded: u64, _total: Option<u64>) {}

    /// Logs a categorized event message.
    ///
    /// # Arguments
    /// * `log_type`: The category of the log message (e.g., Skip, Relocate, Error).
    /// * `target`: A string identifying the subject of the log (e.g., filename, post ID).
    /// * `message`: The descriptive message content.
    fn log_event(&self, _log_type: LogType, _target: &str, _message: &str) {}
}

/// A no-operation implementation of `EventListener`.
/// Used as a default when no actual reporting is needed by the library consumer.
#[derive(Debug, Clone)]
pub struct NoOpEventListener;

impl EventListener for NoOpEventListener {
    fn on_page_state_changed(&self, _page: &PageStatus) {}
    fn on_job_state_changed(&self, _job: &DownloadJob) {}
    fn on_batch_summary(&self, _summary: &BatchSummary) {}
}

/// Convenience type alias for a shared, thread-safe listener.
pub type SharedEventListener = Arc<dyn EventListener>;

/// Returns a shared instance of a `NoOpEventListener`.
pub fn no_op_event_listener() -> SharedEventListener {
    Arc::new(NoOpEventListener)
}
