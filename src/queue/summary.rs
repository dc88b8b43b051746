use std::path::{Path, PathBuf};

use bincode::{deserialize, serialize};
use chrono::{serde::ts_seconds, DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{from_slice, to_string_pretty};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use zstd::{decode_all, encode_all};

use super::error::QueueError;
use super::job::DownloadJob;

/// Counters reported once the queue drains.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    /// Transferred and saved
    pub downloaded: u64,
    /// Already in the ledger and left alone
    pub ignored: u64,
    /// Already on disk, copied or moved into place
    pub already_existing: u64,
    pub not_found: u64,
    /// Skipped by the user or by a filename rule
    pub skipped: u64,
    pub errored: u64,
    pub cancelled: u64,
}

impl BatchSummary {
    pub const fn total(&self) -> u64 {
        self.downloaded
            + self.ignored
            + self.already_existing
            + self.not_found
            + self.skipped
            + self.errored
            + self.cancelled
    }
}

/// The snapshot can be saved in two formats:
/// - As a ZSTD-compressed bincode file
/// - As a generic JSON file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotFormat {
    ZSTDBincode,
    JSON,
}

/// A search being paged through when the snapshot was taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPage {
    pub site: String,
    pub tags: Vec<String>,
    pub index: u32,
}

/// Work left over at the end of a session, to be picked up by the next one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    #[serde(with = "ts_seconds")]
    pub saved_at: DateTime<Utc>,
    pub pages: Vec<PendingPage>,
    pub jobs: Vec<DownloadJob>,
}

impl SessionSnapshot {
    pub fn new(pages: Vec<PendingPage>, jobs: Vec<DownloadJob>) -> Self {
        Self {
            saved_at: Utc::now(),
            pages,
            jobs: jobs
                .into_iter()
                .filter(|j| !j.status.is_terminal())
                .collect(),
        }
    }

    /// Writes the snapshot to a sibling temp file and renames it over `path`, so readers
    /// never see a half written snapshot.
    pub async fn write(&self, path: &Path, format: SnapshotFormat) -> Result<(), QueueError> {
        let data = match format {
            SnapshotFormat::ZSTDBincode => self.to_bincode()?,
            SnapshotFormat::JSON => self.to_json()?.into_bytes(),
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = temp_path(path);
        let mut file = File::create(&tmp).await.map_err(QueueError::from_io)?;
        file.write_all(&data).await.map_err(QueueError::from_io)?;
        file.sync_all().await.map_err(QueueError::from_io)?;
        drop(file);
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    pub async fn read(path: &Path, format: SnapshotFormat) -> Result<Self, QueueError> {
        let raw_data = fs::read(path).await?;
        match format {
            SnapshotFormat::ZSTDBincode => Self::from_bincode(&raw_data),
            SnapshotFormat::JSON => Self::from_json_slice(&raw_data),
        }
    }

    #[inline]
    pub fn from_bincode(slice: &[u8]) -> Result<Self, QueueError> {
        deserialize::<Self>(&decode_all(slice)?).map_err(|err| {
            QueueError::SnapshotDeserializeFail {
                error: err.to_string(),
            }
        })
    }

    #[inline]
    pub fn from_json_slice(slice: &[u8]) -> Result<Self, QueueError> {
        from_slice::<Self>(slice).map_err(|error| QueueError::SnapshotDeserializeFail {
            error: error.to_string(),
        })
    }

    #[inline]
    pub fn to_json(&self) -> Result<String, QueueError> {
        to_string_pretty(self).map_err(|err| QueueError::SnapshotSerializeFail {
            error: err.to_string(),
        })
    }

    #[inline]
    pub fn to_bincode(&self) -> Result<Vec<u8>, QueueError> {
        match serialize(&self) {
            Ok(data) => Ok(encode_all(&*data, 9)?),
            Err(err) => Err(QueueError::SnapshotSerializeFail {
                error: err.to_string(),
            }),
        }
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod test {
    use tempdir::TempDir;

    use super::*;
    use crate::filter::test::record;
    use crate::queue::job::JobStatus;

    fn snapshot() -> SessionSnapshot {
        let mut done = DownloadJob::new(1, record(1, "a", "s"), vec![]);
        done.status = JobStatus::Done;
        let pending = DownloadJob::new(2, record(2, "b c", "e"), vec!["b".into()]);
        SessionSnapshot::new(
            vec![PendingPage {
                site: "testbooru".into(),
                tags: vec!["b".into()],
                index: 3,
            }],
            vec![done, pending],
        )
    }

    #[tokio::test]
    async fn round_trip_both_formats() {
        let dir = TempDir::new("snapshot").unwrap();
        for format in [SnapshotFormat::ZSTDBincode, SnapshotFormat::JSON] {
            let path = dir.path().join(format!("{:?}", format)).join("session.bin");
            snapshot().write(&path, format).await.unwrap();
            assert!(!temp_path(&path).exists());

            let read = SessionSnapshot::read(&path, format).await.unwrap();
            assert_eq!(read.jobs.len(), 1);
            assert_eq!(read.jobs[0].record.id, 2);
            assert_eq!(read.jobs[0].search, vec!["b"]);
            assert_eq!(read.pages[0].index, 3);
        }
    }

    #[tokio::test]
    async fn garbage_is_rejected() {
        let dir = TempDir::new("snapshot").unwrap();
        let path = dir.path().join("session.json");
        fs::write(&path, b"{not json").await.unwrap();
        assert!(matches!(
            SessionSnapshot::read(&path, SnapshotFormat::JSON).await,
            Err(QueueError::SnapshotDeserializeFail { .. })
        ));
    }

    #[test]
    fn summary_total() {
        let summary = BatchSummary {
            downloaded: 2,
            ignored: 1,
            errored: 1,
            ..Default::default()
        };
        assert_eq!(summary.total(), 4);
    }
}
