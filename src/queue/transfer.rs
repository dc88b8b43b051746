//! Moving bytes to disk: existing file checks, streaming downloads and relocations.
use std::path::{Path, PathBuf};

use futures::StreamExt;
use log::debug;
use md5::{compute, Context};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;

use super::error::QueueError;
use crate::events::{LogType, SharedEventListener};
use crate::sites::transport::{HttpResponse, TransportError};

/// What was found at the destination before downloading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Existing {
    Nothing,
    /// Same content already there
    Identical,
    /// Different content was there and got removed
    Removed,
}

async fn file_md5(path: &Path) -> Result<String, QueueError> {
    let content = fs::read(path).await?;
    Ok(format!("{:x}", compute(content)))
}

/// Checks `target` against the expected hash. A mismatching file is removed so it can be
/// downloaded again.
pub(crate) async fn check_existing(
    target: &Path,
    md5: Option<&str>,
    label: &str,
    listener: &SharedEventListener,
) -> Result<Existing, QueueError> {
    if !fs::try_exists(target).await.unwrap_or(false) {
        return Ok(Existing::Nothing);
    }
    let Some(expected) = md5 else {
        // Without a hash there is nothing to compare against, keep the file
        listener.log_event(LogType::Skip, label, "already exists");
        return Ok(Existing::Identical);
    };

    if file_md5(target).await? == expected {
        listener.log_event(
            LogType::Skip,
            label,
            "already exists and is identical (MD5 match)",
        );
        return Ok(Existing::Identical);
    }
    fs::remove_file(target).await?;
    listener.log_event(
        LogType::Remove,
        label,
        "removed existing file (MD5 mismatch), will redownload",
    );
    Ok(Existing::Removed)
}

#[derive(Debug)]
pub(crate) enum TransferError {
    /// The body stream broke or the content didn't match its hash
    Network(String),
    Io(QueueError),
    Cancelled,
}

impl From<std::io::Error> for TransferError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(QueueError::from_io(e))
    }
}

impl From<TransportError> for TransferError {
    fn from(e: TransportError) -> Self {
        Self::Network(e.to_string())
    }
}

async fn create_parent(path: &Path) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    Ok(())
}

/// Streams `response` into `out_path`, returning the hash of what was written.
///
/// The file is removed again on any failure or cancellation.
pub(crate) async fn stream_to_file(
    response: HttpResponse,
    out_path: &Path,
    cancel: &CancellationToken,
    mut progress: impl FnMut(u64, Option<u64>),
) -> Result<String, TransferError> {
    let result = write_stream(response, out_path, cancel, &mut progress).await;
    if result.is_err() {
        debug!("Removing partial file {}", out_path.display());
        let _ = fs::remove_file(out_path).await;
    }
    result
}

async fn write_stream(
    response: HttpResponse,
    out_path: &Path,
    cancel: &CancellationToken,
    progress: &mut impl FnMut(u64, Option<u64>),
) -> Result<String, TransferError> {
    create_parent(out_path).await?;
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(out_path)
        .await?;
    let mut bw = BufWriter::new(file);
    let mut hasher = Context::new();
    let total = response.content_length;
    let mut downloaded = 0;
    let mut stream = response.body;

    loop {
        let item = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(TransferError::Cancelled),
            item = stream.next() => item,
        };
        let Some(chunk) = item else { break };
        let mut chunk = chunk?;
        downloaded += chunk.len() as u64;
        hasher.consume(&chunk);
        bw.write_all_buf(&mut chunk).await?;
        progress(downloaded, total);
    }
    bw.flush().await?;

    Ok(format!("{:x}", hasher.compute()))
}

/// Copies `source` to every path of `targets`.
pub(crate) async fn copy_to(source: &Path, targets: &[PathBuf]) -> Result<(), QueueError> {
    for target in targets.iter().filter(|t| t.as_path() != source) {
        create_parent(target).await.map_err(QueueError::from_io)?;
        fs::copy(source, target).await.map_err(QueueError::from_io)?;
    }
    Ok(())
}

/// Moves `source` to `target`, copying across filesystems when a rename isn't possible.
pub(crate) async fn move_to(source: &Path, target: &Path) -> Result<(), QueueError> {
    if source == target {
        return Ok(());
    }
    create_parent(target).await.map_err(QueueError::from_io)?;
    if fs::rename(source, target).await.is_err() {
        fs::copy(source, target).await.map_err(QueueError::from_io)?;
        fs::remove_file(source).await?;
    }
    Ok(())
}
