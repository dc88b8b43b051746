use std::io;

use thiserror::Error;

use crate::filename::validate::ValidationIssue;
use crate::filename::FilenameError;

#[allow(clippy::enum_variant_names)]
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Failed to access file: {source}")]
    IOError {
        #[from]
        source: io::Error,
    },

    /// The destination ran out of space. Admissions stay halted until this is resolved.
    #[error("Disk error: {message}")]
    DiskError { message: String },

    #[error("Invalid filename rules: {}", join_issues(.issues))]
    Validation { issues: Vec<ValidationIssue> },

    #[error("Invalid filename rules: {source}")]
    InvalidRules {
        #[from]
        source: FilenameError,
    },

    #[error("Failed to serialize session snapshot: {error}")]
    SnapshotSerializeFail { error: String },

    #[error("Failed to deserialize session snapshot: {error}")]
    SnapshotDeserializeFail { error: String },

    #[error("Corrupted md5 ledger entry at line {line}: {error}")]
    LedgerCorrupted { line: usize, error: String },
}

fn join_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Whether an IO error means the destination is full.
pub fn is_disk_full(error: &io::Error) -> bool {
    // ENOSPC
    error.kind() == io::ErrorKind::StorageFull || error.raw_os_error() == Some(28)
}

impl QueueError {
    /// Wraps an IO error, singling out a full disk.
    pub fn from_io(error: io::Error) -> Self {
        if is_disk_full(&error) {
            Self::DiskError {
                message: error.to_string(),
            }
        } else {
            Self::IOError { source: error }
        }
    }
}
