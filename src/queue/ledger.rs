//! Append-only record of every file saved, keyed by content hash.
//!
//! Each line of the ledger file is a JSON object `{"hash": .., "path": .., "deleted": ..}`.
//! Later lines override earlier ones, a `deleted` line forgets the hash.
//!
//! Queues never own a ledger directly. They hold a [`SharedLedger`], and every queue opened
//! on the same file gets the same one.
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use ahash::AHashMap;
use log::{debug, warn};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};

use super::error::QueueError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub hash: String,
    pub path: PathBuf,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Default)]
pub struct Md5Ledger {
    entries: AHashMap<String, PathBuf>,
    file: Option<File>,
}

/// Result of looking a hash up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerHit {
    /// Saved before and still on disk
    Present(PathBuf),
    /// Saved before, the file is gone but the hash is kept
    Missing(PathBuf),
}

impl Md5Ledger {
    /// A ledger that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Loads the ledger at `path`, creating it if needed. New entries are appended to it.
    pub async fn open(path: &Path) -> Result<Self, QueueError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut entries = AHashMap::new();
        if path.exists() {
            let content = fs::read_to_string(path).await?;
            for (index, line) in content.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let entry: LedgerEntry = match serde_json::from_str(line) {
                    Ok(entry) => entry,
                    // A crash can leave a torn last line behind
                    Err(e) if index + 1 == content.lines().count() => {
                        warn!("Ignoring truncated md5 ledger line {}: {}", index + 1, e);
                        continue;
                    }
                    Err(e) => {
                        return Err(QueueError::LedgerCorrupted {
                            line: index + 1,
                            error: e.to_string(),
                        })
                    }
                };
                if entry.deleted {
                    entries.remove(&entry.hash);
                } else {
                    entries.insert(entry.hash, entry.path);
                }
            }
        }
        debug!("Md5 ledger loaded with {} entries", entries.len());

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            entries,
            file: Some(file),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, hash: &str) -> Option<&Path> {
        self.entries.get(hash).map(PathBuf::as_path)
    }

    async fn append(&mut self, entry: &LedgerEntry) -> Result<(), QueueError> {
        if let Some(file) = self.file.as_mut() {
            let mut line = serde_json::to_vec(entry).map_err(|e| QueueError::SnapshotSerializeFail {
                error: e.to_string(),
            })?;
            line.push(b'\n');
            file.write_all(&line).await.map_err(QueueError::from_io)?;
            file.flush().await.map_err(QueueError::from_io)?;
        }
        Ok(())
    }

    /// Remembers that `hash` was saved to `path`.
    pub async fn record(&mut self, hash: &str, path: &Path) -> Result<(), QueueError> {
        let entry = LedgerEntry {
            hash: hash.to_lowercase(),
            path: path.to_path_buf(),
            deleted: false,
        };
        self.append(&entry).await?;
        self.entries.insert(entry.hash, entry.path);
        Ok(())
    }

    pub async fn forget(&mut self, hash: &str) -> Result<(), QueueError> {
        let Some(path) = self.entries.remove(hash) else {
            return Ok(());
        };
        self.append(&LedgerEntry {
            hash: hash.to_string(),
            path,
            deleted: true,
        })
        .await
    }

    /// Looks `hash` up. When its file disappeared the hash is either kept (`keep_deleted`) or
    /// forgotten, in which case the record counts as never downloaded.
    pub async fn lookup(
        &mut self,
        hash: &str,
        keep_deleted: bool,
    ) -> Result<Option<LedgerHit>, QueueError> {
        let Some(path) = self.entries.get(hash).cloned() else {
            return Ok(None);
        };
        if fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(Some(LedgerHit::Present(path)));
        }
        if keep_deleted {
            return Ok(Some(LedgerHit::Missing(path)));
        }
        debug!("{} was deleted from {}, forgetting it", hash, path.display());
        self.forget(hash).await?;
        Ok(None)
    }
}

/// Ledgers currently open, by canonical file path.
static OPEN_LEDGERS: Lazy<AsyncMutex<AHashMap<PathBuf, Weak<SharedLedger>>>> =
    Lazy::new(|| AsyncMutex::new(AHashMap::new()));

/// A ledger together with the per-hash locks of every queue using it.
#[derive(Debug, Default)]
pub struct SharedLedger {
    ledger: AsyncMutex<Md5Ledger>,
    hash_locks: Mutex<AHashMap<String, Arc<AsyncMutex<()>>>>,
}

impl SharedLedger {
    pub fn new(ledger: Md5Ledger) -> Arc<Self> {
        Arc::new(Self {
            ledger: AsyncMutex::new(ledger),
            hash_locks: Mutex::new(AHashMap::new()),
        })
    }

    /// Opens the ledger at `path`, or hands out the one already open there.
    pub async fn open(path: &Path) -> Result<Arc<Self>, QueueError> {
        let key = canonical_key(path).await?;
        let mut open = OPEN_LEDGERS.lock().await;
        if let Some(shared) = open.get(&key).and_then(Weak::upgrade) {
            debug!("Reusing md5 ledger {}", key.display());
            return Ok(shared);
        }

        let shared = Self::new(Md5Ledger::open(path).await?);
        open.retain(|_, ledger| ledger.strong_count() > 0);
        open.insert(key, Arc::downgrade(&shared));
        Ok(shared)
    }

    pub async fn lock(&self) -> MutexGuard<'_, Md5Ledger> {
        self.ledger.lock().await
    }

    /// Lock serializing the jobs that handle `hash`, across every queue.
    pub fn hash_lock(&self, hash: &str) -> Arc<AsyncMutex<()>> {
        self.hash_locks
            .lock()
            .entry(hash.to_string())
            .or_default()
            .clone()
    }

    /// Drops the lock of `hash` once nobody holds or waits on it.
    pub fn release(&self, hash: &str) {
        let mut locks = self.hash_locks.lock();
        if locks.get(hash).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(hash);
        }
    }
}

async fn canonical_key(path: &Path) -> Result<PathBuf, QueueError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).await?;
    Ok(match path.file_name() {
        Some(name) => fs::canonicalize(parent).await?.join(name),
        None => path.to_path_buf(),
    })
}

#[cfg(test)]
mod test {
    use tempdir::TempDir;

    use super::*;

    #[tokio::test]
    async fn persists_and_replays() {
        let dir = TempDir::new("ledger").unwrap();
        let ledger_path = dir.path().join("state").join("md5.jsonl");
        let image = dir.path().join("a.png");
        fs::write(&image, b"x").await.unwrap();

        let mut ledger = Md5Ledger::open(&ledger_path).await.unwrap();
        ledger.record("ABC", &image).await.unwrap();
        ledger.record("def", &dir.path().join("gone.png")).await.unwrap();
        ledger.forget("def").await.unwrap();
        drop(ledger);

        let content = fs::read_to_string(&ledger_path).await.unwrap();
        assert_eq!(content.lines().count(), 3);

        let mut ledger = Md5Ledger::open(&ledger_path).await.unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(
            ledger.lookup("abc", false).await.unwrap(),
            Some(LedgerHit::Present(image))
        );
        assert_eq!(ledger.lookup("def", false).await.unwrap(), None);
    }

    #[tokio::test]
    async fn deleted_files() {
        let dir = TempDir::new("ledger").unwrap();
        let gone = dir.path().join("gone.png");
        let mut ledger = Md5Ledger::in_memory();
        ledger.record("h1", &gone).await.unwrap();

        assert_eq!(
            ledger.lookup("h1", true).await.unwrap(),
            Some(LedgerHit::Missing(gone))
        );
        assert_eq!(ledger.lookup("h1", false).await.unwrap(), None);
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn torn_last_line_is_ignored() {
        let dir = TempDir::new("ledger").unwrap();
        let path = dir.path().join("md5.jsonl");
        fs::write(&path, "{\"hash\":\"a\",\"path\":\"/x\"}\n{\"hash\":\"b\",\"pa")
            .await
            .unwrap();
        assert_eq!(Md5Ledger::open(&path).await.unwrap().len(), 1);

        fs::write(&path, "garbage\n{\"hash\":\"a\",\"path\":\"/x\"}\n").await.unwrap();
        assert!(matches!(
            Md5Ledger::open(&path).await,
            Err(QueueError::LedgerCorrupted { line: 1, .. })
        ));
    }

    #[tokio::test]
    async fn same_file_same_ledger() {
        let dir = TempDir::new("ledger").unwrap();
        let path = dir.path().join("md5.jsonl");
        let image = dir.path().join("a.png");
        fs::write(&image, b"x").await.unwrap();

        let first = SharedLedger::open(&path).await.unwrap();
        let second = SharedLedger::open(&dir.path().join(".").join("md5.jsonl"))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        first.lock().await.record("abc", &image).await.unwrap();
        assert_eq!(second.lock().await.get("abc"), Some(image.as_path()));
        assert!(Arc::ptr_eq(&first.hash_lock("abc"), &second.hash_lock("abc")));

        drop(first);
        drop(second);
        let reopened = SharedLedger::open(&path).await.unwrap();
        assert_eq!(reopened.lock().await.len(), 1);
    }
}
