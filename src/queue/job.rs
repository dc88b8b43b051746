use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::record::ImageRecord;

/// `Queued -> Active -> Saving -> Done`, or one of the other terminal states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Active,
    /// Bytes are in, the file is being finalized
    Saving,
    Done,
    Failed(String),
    Skipped(String),
    Cancelled,
}

impl JobStatus {
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Done | Self::Failed(_) | Self::Skipped(_) | Self::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadJob {
    pub id: u64,
    pub record: ImageRecord,
    /// Tags of the search the record came from, for `%search%`
    pub search: Vec<String>,
    /// Absolute destinations, empty until the job is admitted
    pub targets: Vec<PathBuf>,
    pub status: JobStatus,
    /// Transfer attempts made after the first one
    pub retries: u32,
    pub bytes: u64,
    pub total: Option<u64>,
}

impl DownloadJob {
    pub fn new(id: u64, record: ImageRecord, search: Vec<String>) -> Self {
        Self {
            id,
            record,
            search,
            targets: Vec::new(),
            status: JobStatus::Queued,
            retries: 0,
            bytes: 0,
            total: None,
        }
    }

    /// Name used in log events.
    pub fn label(&self) -> String {
        self.targets.first().map_or_else(
            || format!("{} #{}", self.record.site, self.record.id),
            |p| p.display().to_string(),
        )
    }
}
