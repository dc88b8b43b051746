//! Provides the asynchronous download queue.
//!
//! Records are sent to the queue through a channel (or handed over in bulk with
//! [`DownloadQueue::download_all`]) and each one becomes a [`DownloadJob`]:
//!
//! 1. **Admission**: the filename rules name the job. Rules are validated once, when they
//!    are set.
//! 2. **Dedup**: a hash found in the [`Md5Ledger`] is resolved through the
//!    [`DuplicatePolicy`] without downloading anything. Jobs sharing a hash are serialized,
//!    so only one of them can ever be transferring. Queues opened on the same ledger file
//!    share it, along with these locks. Records without a hash are checked once their
//!    bytes are on disk.
//! 3. **Transfer**: at most `max_simultaneous_downloads` jobs of a site (and optionally of all
//!    sites together) are active. The image is streamed to disk, checked against its hash and
//!    recorded in the ledger.
//!
//! Network trouble is retried, a full disk halts every admission until
//! [`QueueHandle::resolve_halt`] is called. Anything else fails the job alone.
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use futures::{Stream, StreamExt};
use log::{debug, error, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::events::{LogType, SharedEventListener};
use crate::filename::validate::{has_errors, validate, TargetFs, ValidationIssue};
use crate::filename::{FilenameBuilder, FilenameRules, Resolution};
use crate::filter::FilterContext;
use crate::record::ImageRecord;
use crate::sites::adapter::SourceAdapter;
use crate::sites::error::ExtractorError;
use crate::sites::Purpose;

pub mod error;
pub mod job;
pub mod ledger;
pub mod summary;
mod transfer;

use error::QueueError;
use job::{DownloadJob, JobStatus};
use ledger::{LedgerHit, Md5Ledger, SharedLedger};
use summary::{BatchSummary, PendingPage, SessionSnapshot};
use transfer::{check_existing, copy_to, move_to, stream_to_file, Existing, TransferError};

/// Jobs admitted at once. The semaphores decide how many of them are active.
const MAX_PENDING_JOBS: usize = 256;

/// What to do with a record whose hash is already in the ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Download it again
    Save,
    /// Copy the saved file to the new destination
    Copy,
    /// Move the saved file to the new destination
    Move,
    #[default]
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    pub output_dir: PathBuf,
    pub rules: FilenameRules,
    pub duplicate_policy: DuplicatePolicy,
    /// Keep ledger hashes whose file was deleted, so the record is never downloaded again
    pub keep_deleted_md5: bool,
    /// Extra transfer attempts after a network failure
    pub retries: u32,
    /// Cap on active jobs across all sites
    pub global_limit: Option<usize>,
    /// Ledger file, kept in memory only when unset
    pub ledger_path: Option<PathBuf>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("downloads"),
            rules: FilenameRules::default(),
            duplicate_policy: DuplicatePolicy::default(),
            keep_deleted_md5: false,
            retries: 0,
            global_limit: None,
            ledger_path: None,
        }
    }
}

/// A record to download, with the search it came from.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub record: ImageRecord,
    pub search: Vec<String>,
}

impl DownloadRequest {
    pub fn new(record: ImageRecord, search: &[String]) -> Self {
        Self {
            record,
            search: search.to_vec(),
        }
    }
}

/// Whether new jobs may become active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Gate {
    Open,
    Paused,
    /// Stopped by a disk error
    Halted(String),
}

#[derive(Debug)]
struct Control {
    gate: watch::Sender<Gate>,
    cancel: Mutex<CancellationToken>,
    jobs: Mutex<AHashMap<u64, CancellationToken>>,
}

impl Control {
    fn halt(&self, reason: &str) {
        error!("Halting the download queue: {}", reason);
        self.gate.send_replace(Gate::Halted(reason.to_string()));
    }

    fn swap_gate(&self, from: impl Fn(&Gate) -> bool, to: Gate) {
        self.gate.send_if_modified(|gate| {
            if from(gate) {
                *gate = to;
                true
            } else {
                false
            }
        });
    }
}

/// Controls a running queue from anywhere.
#[derive(Debug, Clone)]
pub struct QueueHandle {
    control: Arc<Control>,
}

impl QueueHandle {
    /// Stops activating jobs. Transfers already running carry on.
    pub fn pause(&self) {
        self.control
            .swap_gate(|g| *g == Gate::Open, Gate::Paused);
    }

    pub fn resume(&self) {
        self.control
            .swap_gate(|g| *g == Gate::Paused, Gate::Open);
    }

    /// Reopens a queue halted by a disk error.
    pub fn resolve_halt(&self) {
        self.control
            .swap_gate(|g| matches!(g, Gate::Halted(_)), Gate::Open);
    }

    pub fn gate(&self) -> Gate {
        self.control.gate.borrow().clone()
    }

    /// Skips one job, aborting its transfer. Returns `false` when the job is not running.
    pub fn skip(&self, job_id: u64) -> bool {
        match self.control.jobs.lock().get(&job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Aborts every job of the current batch. Partial files are deleted.
    pub fn cancel_all(&self) {
        self.control.cancel.lock().cancel();
    }
}

#[derive(Debug)]
struct NamingState {
    rules: FilenameRules,
    builder: Arc<FilenameBuilder>,
    issues: Vec<ValidationIssue>,
}

/// How a job ended, for the batch summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Downloaded,
    Ignored,
    AlreadyExisting,
    NotFound,
    Skipped,
    Errored,
    Cancelled,
}

impl Outcome {
    fn count(self, summary: &mut BatchSummary) {
        let counter = match self {
            Self::Downloaded => &mut summary.downloaded,
            Self::Ignored => &mut summary.ignored,
            Self::AlreadyExisting => &mut summary.already_existing,
            Self::NotFound => &mut summary.not_found,
            Self::Skipped => &mut summary.skipped,
            Self::Errored => &mut summary.errored,
            Self::Cancelled => &mut summary.cancelled,
        };
        *counter += 1;
    }
}

enum JobError {
    NotFound,
    Retryable(String),
    Fatal(String),
    Disk(String),
    Cancelled,
}

async fn cancellable<T>(token: &CancellationToken, fut: impl Future<Output = T>) -> Option<T> {
    tokio::select! {
        biased;
        () = token.cancelled() => None,
        value = fut => Some(value),
    }
}

pub struct DownloadQueue {
    adapter: Arc<SourceAdapter>,
    options: QueueOptions,
    naming: RwLock<NamingState>,
    filter_context: FilterContext,
    ledger: Arc<SharedLedger>,
    listener: SharedEventListener,
    site_slots: Mutex<AHashMap<String, Arc<Semaphore>>>,
    global_slots: Option<Arc<Semaphore>>,
    pending: Mutex<AHashMap<u64, DownloadJob>>,
    control: Arc<Control>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for DownloadQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadQueue")
            .field("options", &self.options)
            .field("gate", &*self.control.gate.borrow())
            .finish_non_exhaustive()
    }
}

impl DownloadQueue {
    /// Sets up the queue, loading the ledger and validating the filename rules.
    pub async fn new(
        adapter: Arc<SourceAdapter>,
        options: QueueOptions,
        listener: SharedEventListener,
    ) -> Result<Self, QueueError> {
        let ledger = match &options.ledger_path {
            Some(path) => SharedLedger::open(path).await?,
            None => SharedLedger::new(Md5Ledger::in_memory()),
        };
        let issues = validate(&options.rules, TargetFs::current());
        if has_errors(&issues) {
            return Err(QueueError::Validation { issues });
        }
        let builder = FilenameBuilder::new(&options.rules)?;
        let global_slots = options.global_limit.map(|n| Arc::new(Semaphore::new(n.max(1))));

        Ok(Self {
            adapter,
            naming: RwLock::new(NamingState {
                rules: options.rules.clone(),
                builder: Arc::new(builder),
                issues,
            }),
            options,
            filter_context: FilterContext::default(),
            ledger,
            listener,
            site_slots: Mutex::new(AHashMap::new()),
            global_slots,
            pending: Mutex::new(AHashMap::new()),
            control: Arc::new(Control {
                gate: watch::Sender::new(Gate::Open),
                cancel: Mutex::new(CancellationToken::new()),
                jobs: Mutex::new(AHashMap::new()),
            }),
            next_id: AtomicU64::new(1),
        })
    }

    /// Custom tokens available to filename conditions.
    pub fn with_filter_context(mut self, context: FilterContext) -> Self {
        {
            let mut naming = self.naming.write();
            let builder = (*naming.builder).clone().with_context(context.clone());
            naming.builder = Arc::new(builder);
        }
        self.filter_context = context;
        self
    }

    /// Uses `ledger` instead of the one given by [`QueueOptions::ledger_path`].
    pub fn with_ledger(mut self, ledger: Arc<SharedLedger>) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn ledger(&self) -> Arc<SharedLedger> {
        self.ledger.clone()
    }

    pub fn handle(&self) -> QueueHandle {
        QueueHandle {
            control: self.control.clone(),
        }
    }

    /// Warnings of the current filename rules.
    pub fn rule_issues(&self) -> Vec<ValidationIssue> {
        self.naming.read().issues.clone()
    }

    /// Replaces the filename rules. They are only validated when they actually changed, and
    /// rules with errors are refused.
    pub fn set_rules(&self, rules: FilenameRules) -> Result<Vec<ValidationIssue>, QueueError> {
        {
            let naming = self.naming.read();
            if naming.rules == rules {
                return Ok(naming.issues.clone());
            }
        }
        let issues = validate(&rules, TargetFs::current());
        if has_errors(&issues) {
            return Err(QueueError::Validation { issues });
        }
        let builder = FilenameBuilder::new(&rules)?.with_context(self.filter_context.clone());
        debug!("Filename rules updated, {} warnings", issues.len());
        *self.naming.write() = NamingState {
            rules,
            builder: Arc::new(builder),
            issues: issues.clone(),
        };
        Ok(issues)
    }

    /// Jobs not finished yet, with pages the caller is still walking, for the next session.
    pub fn snapshot(&self, pages: Vec<PendingPage>) -> SessionSnapshot {
        let mut jobs: Vec<DownloadJob> = self.pending.lock().values().cloned().collect();
        jobs.sort_by_key(|j| j.id);
        SessionSnapshot::new(pages, jobs)
    }

    /// Spawns the task draining `channel_rx`. It resolves to the batch summary once the
    /// sender is dropped and every job has ended.
    pub fn setup_async_downloader(
        self: Arc<Self>,
        channel_rx: UnboundedReceiver<DownloadRequest>,
    ) -> JoinHandle<BatchSummary> {
        tokio::spawn(async move {
            debug!("Async Downloader thread initialized");
            self.drain(UnboundedReceiverStream::new(channel_rx)).await
        })
    }

    pub async fn download_all(
        self: &Arc<Self>,
        records: Vec<ImageRecord>,
        search: &[String],
    ) -> BatchSummary {
        let requests = records
            .into_iter()
            .map(|r| DownloadRequest::new(r, search))
            .collect::<Vec<_>>();
        self.clone().drain(futures::stream::iter(requests)).await
    }

    async fn drain(self: Arc<Self>, requests: impl Stream<Item = DownloadRequest>) -> BatchSummary {
        let run_token = {
            let mut token = self.control.cancel.lock();
            if token.is_cancelled() {
                *token = CancellationToken::new();
            }
            token.clone()
        };

        let summary = requests
            .map(|request| {
                let queue = self.clone();
                let run_token = run_token.clone();
                tokio::spawn(async move { queue.process(request, run_token).await })
            })
            .buffer_unordered(MAX_PENDING_JOBS)
            .fold(BatchSummary::default(), |mut summary, joined| async move {
                match joined {
                    Ok(outcome) => outcome.count(&mut summary),
                    Err(join_error) => {
                        warn!("Download task failed to execute: {}", join_error);
                        summary.errored += 1;
                    }
                }
                summary
            })
            .await;

        debug!("Download batch finished: {:?}", summary);
        self.listener.on_batch_summary(&summary);
        summary
    }

    async fn process(&self, request: DownloadRequest, run_token: CancellationToken) -> Outcome {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut job = DownloadJob::new(id, request.record, request.search);
        let token = run_token.child_token();
        self.control.jobs.lock().insert(id, token.clone());

        let outcome = self.run_job(&mut job, &token, &run_token).await;

        self.control.jobs.lock().remove(&id);
        if let Some(hash) = &job.record.md5 {
            self.ledger.release(hash);
        }
        outcome
    }

    fn notify(&self, job: &DownloadJob) {
        {
            let mut pending = self.pending.lock();
            if job.status.is_terminal() {
                pending.remove(&job.id);
            } else {
                pending.insert(job.id, job.clone());
            }
        }
        self.listener.on_job_state_changed(job);
    }

    fn finish(&self, job: &mut DownloadJob, status: JobStatus, outcome: Outcome) -> Outcome {
        match &status {
            JobStatus::Failed(message) => self.listener.log_event(LogType::Error, &job.label(), message),
            // Relocations and existing files were reported when they were found
            JobStatus::Skipped(message) if outcome != Outcome::AlreadyExisting => {
                self.listener.log_event(LogType::Skip, &job.label(), message)
            }
            JobStatus::Done => self.listener.log_event(LogType::Success, &job.label(), "downloaded"),
            _ => {}
        }
        job.status = status;
        self.notify(job);
        outcome
    }

    fn fail(&self, job: &mut DownloadJob, error: QueueError) -> Outcome {
        if let QueueError::DiskError { message } = &error {
            self.control.halt(message);
        }
        self.finish(job, JobStatus::Failed(error.to_string()), Outcome::Errored)
    }

    /// Ends a job whose token fired, telling a user skip from a batch cancel.
    fn interrupted(&self, job: &mut DownloadJob, run_token: &CancellationToken) -> Outcome {
        if run_token.is_cancelled() {
            self.finish(job, JobStatus::Cancelled, Outcome::Cancelled)
        } else {
            self.finish(
                job,
                JobStatus::Skipped("skipped by user".to_string()),
                Outcome::Skipped,
            )
        }
    }

    /// Waits for the gate to open. `false` when the job got cancelled meanwhile.
    async fn wait_gate(&self, token: &CancellationToken) -> bool {
        let mut rx = self.control.gate.subscribe();
        loop {
            if *rx.borrow_and_update() == Gate::Open {
                return true;
            }
            match cancellable(token, rx.changed()).await {
                Some(Ok(())) => {}
                _ => return false,
            }
        }
    }

    fn site_slots(&self, site: &str) -> Result<Arc<Semaphore>, ExtractorError> {
        let mut slots = self.site_slots.lock();
        if let Some(slot) = slots.get(site) {
            return Ok(slot.clone());
        }
        let config = self.adapter.site(site)?;
        let slot = Arc::new(Semaphore::new(config.max_simultaneous_downloads.max(1)));
        slots.insert(site.to_string(), slot.clone());
        Ok(slot)
    }

    async fn run_job(
        &self,
        job: &mut DownloadJob,
        token: &CancellationToken,
        run_token: &CancellationToken,
    ) -> Outcome {
        let builder = self.naming.read().builder.clone();
        match builder.resolve(&job.record, &job.search) {
            Ok(Resolution::Paths(paths)) => {
                job.targets = paths
                    .into_iter()
                    .map(|p| self.options.output_dir.join(p))
                    .collect();
            }
            Ok(Resolution::Skip(reason)) => {
                return self.finish(job, JobStatus::Skipped(reason), Outcome::Skipped)
            }
            Err(e) => return self.finish(job, JobStatus::Failed(e.to_string()), Outcome::Errored),
        }
        self.notify(job);

        if !self.wait_gate(token).await {
            return self.interrupted(job, run_token);
        }

        // Jobs sharing a hash run one after the other, the later ones find the ledger entry
        let md5 = job.record.md5.clone();
        let _md5_guard = match &md5 {
            Some(hash) => match cancellable(token, self.ledger.hash_lock(hash).lock_owned()).await {
                Some(guard) => Some(guard),
                None => return self.interrupted(job, run_token),
            },
            None => None,
        };

        if let Some(hash) = &md5 {
            if self.options.duplicate_policy != DuplicatePolicy::Save {
                let hit = self
                    .ledger
                    .lock()
                    .await
                    .lookup(hash, self.options.keep_deleted_md5)
                    .await;
                match hit {
                    Ok(Some(hit)) => return self.resolve_duplicate(job, hash, hit).await,
                    Ok(None) => {}
                    Err(e) => return self.fail(job, e),
                }
            }
        }

        let site_slots = match self.site_slots(&job.record.site) {
            Ok(slots) => slots,
            Err(e) => return self.finish(job, JobStatus::Failed(e.to_string()), Outcome::Errored),
        };
        let _global_permit = match &self.global_slots {
            Some(slots) => match cancellable(token, slots.clone().acquire_owned()).await {
                Some(permit) => permit.ok(),
                None => return self.interrupted(job, run_token),
            },
            None => None,
        };
        let _site_permit = match cancellable(token, site_slots.acquire_owned()).await {
            Some(permit) => permit.ok(),
            None => return self.interrupted(job, run_token),
        };
        // Paused while waiting for a slot
        if !self.wait_gate(token).await {
            return self.interrupted(job, run_token);
        }

        job.status = JobStatus::Active;
        self.notify(job);

        let target = job.targets[0].clone();
        let label = job.label();
        match check_existing(&target, md5.as_deref(), &label, &self.listener).await {
            Ok(Existing::Identical) => {
                if let Err(e) = self.save_copies(job, md5.as_deref()).await {
                    return self.fail(job, e);
                }
                return self.finish(
                    job,
                    JobStatus::Skipped("already exists".to_string()),
                    Outcome::AlreadyExisting,
                );
            }
            Ok(Existing::Nothing | Existing::Removed) => {}
            Err(e) => return self.fail(job, e),
        }

        let hash = loop {
            match self.transfer(job, token).await {
                Ok(hash) => break hash,
                Err(JobError::NotFound) => {
                    return self.finish(
                        job,
                        JobStatus::Failed("remote file not found".to_string()),
                        Outcome::NotFound,
                    )
                }
                Err(JobError::Retryable(message)) if job.retries < self.options.retries => {
                    job.retries += 1;
                    warn!(
                        "Download of {} failed ({}), retry {}/{}",
                        label, message, job.retries, self.options.retries
                    );
                    self.listener.log_event(LogType::Warning, &label, &message);
                    self.adapter.limiter().backoff(&job.record.site).await;
                }
                Err(JobError::Retryable(message) | JobError::Fatal(message)) => {
                    return self.finish(job, JobStatus::Failed(message), Outcome::Errored)
                }
                Err(JobError::Disk(message)) => {
                    return self.fail(job, QueueError::DiskError { message })
                }
                Err(JobError::Cancelled) => return self.interrupted(job, run_token),
            }
        };

        if md5.is_some() || self.options.duplicate_policy == DuplicatePolicy::Save {
            return self.save(job, &hash).await;
        }

        // The hash is only known now, so identical records are serialized from here on
        let lock = self.ledger.hash_lock(&hash);
        let Some(hash_guard) = cancellable(token, lock.lock_owned()).await else {
            let _ = tokio::fs::remove_file(&target).await;
            self.ledger.release(&hash);
            return self.interrupted(job, run_token);
        };
        let hit = self
            .ledger
            .lock()
            .await
            .lookup(&hash, self.options.keep_deleted_md5)
            .await;
        let outcome = match hit {
            Ok(Some(LedgerHit::Present(path))) if path == target => self.save(job, &hash).await,
            Ok(Some(hit)) => match tokio::fs::remove_file(&target).await {
                Ok(()) => self.resolve_duplicate(job, &hash, hit).await,
                Err(e) => self.fail(job, QueueError::from_io(e)),
            },
            Ok(None) => self.save(job, &hash).await,
            Err(e) => self.fail(job, e),
        };
        drop(hash_guard);
        self.ledger.release(&hash);
        outcome
    }

    async fn save(&self, job: &mut DownloadJob, hash: &str) -> Outcome {
        job.status = JobStatus::Saving;
        self.notify(job);
        if let Err(e) = self.save_copies(job, Some(hash)).await {
            return self.fail(job, e);
        }
        self.finish(job, JobStatus::Done, Outcome::Downloaded)
    }

    /// Copies the first target to the others and records it in the ledger.
    async fn save_copies(&self, job: &DownloadJob, hash: Option<&str>) -> Result<(), QueueError> {
        let target = &job.targets[0];
        copy_to(target, &job.targets[1..]).await?;
        if let Some(hash) = hash {
            self.ledger.lock().await.record(hash, target).await?;
        }
        Ok(())
    }

    async fn resolve_duplicate(&self, job: &mut DownloadJob, hash: &str, hit: LedgerHit) -> Outcome {
        let (existing, present) = match hit {
            LedgerHit::Present(path) => (path, true),
            LedgerHit::Missing(path) => (path, false),
        };
        let target = job.targets[0].clone();
        let label = job.label();

        let result = match (self.options.duplicate_policy, present) {
            (DuplicatePolicy::Skip | DuplicatePolicy::Save, _) | (_, false) => {
                let reason = format!("already downloaded as {}", existing.display());
                return self.finish(job, JobStatus::Skipped(reason), Outcome::Ignored);
            }
            (DuplicatePolicy::Copy, true) => copy_to(&existing, &job.targets).await.map(|()| "copied"),
            (DuplicatePolicy::Move, true) => {
                let moved = async {
                    move_to(&existing, &target).await?;
                    copy_to(&target, &job.targets[1..]).await?;
                    self.ledger.lock().await.record(hash, &target).await
                };
                moved.await.map(|()| "moved")
            }
        };

        match result {
            Ok(action) => {
                let message = format!("{} from {}", action, existing.display());
                self.listener.log_event(LogType::Relocate, &label, &message);
                self.finish(job, JobStatus::Skipped(message), Outcome::AlreadyExisting)
            }
            Err(e) => self.fail(job, e),
        }
    }

    async fn transfer(&self, job: &mut DownloadJob, token: &CancellationToken) -> Result<String, JobError> {
        let response = match cancellable(token, self.adapter.download(Purpose::Image, &job.record)).await {
            None => return Err(JobError::Cancelled),
            Some(Ok(response)) => response,
            Some(Err(ExtractorError::NotFound { .. })) => return Err(JobError::NotFound),
            Some(Err(e)) if e.is_transient() => return Err(JobError::Retryable(e.to_string())),
            Some(Err(e)) => return Err(JobError::Fatal(e.to_string())),
        };

        job.total = response.content_length;
        let target = job.targets[0].clone();
        let listener = self.listener.clone();
        let id = job.id;
        let mut bytes = 0;
        let result = stream_to_file(response, &target, token, |downloaded, total| {
            bytes = downloaded;
            listener.on_job_progress(id, downloaded, total);
        })
        .await;
        job.bytes = bytes;

        match result {
            Ok(hash) => match &job.record.md5 {
                Some(expected) if *expected != hash => {
                    let _ = tokio::fs::remove_file(&target).await;
                    Err(JobError::Retryable(format!(
                        "md5 mismatch, expected {} but got {}",
                        expected, hash
                    )))
                }
                _ => Ok(hash),
            },
            Err(TransferError::Network(message)) => Err(JobError::Retryable(message)),
            Err(TransferError::Io(QueueError::DiskError { message })) => Err(JobError::Disk(message)),
            Err(TransferError::Io(e)) => Err(JobError::Fatal(e.to_string())),
            Err(TransferError::Cancelled) => Err(JobError::Cancelled),
        }
    }
}

#[cfg(test)]
mod test {
    use std::path::Path;
    use std::time::Duration;

    use md5::compute;
    use tempdir::TempDir;
    use tokio::fs;

    use super::*;
    use crate::events::recorder::Recorder;
    use crate::filename::ScriptErrorPolicy;
    use crate::record::RecordDraft;
    use crate::sites::adapter::test::{adapter, json_source, test_site};
    use crate::sites::transport::fake::{FakeTransport, Reply};

    fn hash(body: &[u8]) -> String {
        format!("{:x}", compute(body))
    }

    fn image(id: u64, body: &[u8], tags: &str) -> ImageRecord {
        let mut draft = RecordDraft::new();
        draft.set("id", id.to_string());
        draft.set("md5", hash(body));
        draft.set("file_url", format!("https://cdn.test/{}.png", id));
        draft.set("tags_character", tags);
        ImageRecord::from_draft("testbooru", "https://test.booru", draft).unwrap()
    }

    async fn setup(
        transport: Arc<FakeTransport>,
        dir: &Path,
        tweak: impl FnOnce(&mut QueueOptions),
    ) -> (Arc<DownloadQueue>, Arc<Recorder>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut options = QueueOptions {
            output_dir: dir.join("out"),
            ledger_path: Some(dir.join("md5.jsonl")),
            ..Default::default()
        };
        tweak(&mut options);
        let recorder = Arc::new(Recorder::default());
        let adapter = Arc::new(adapter(transport, test_site(vec![json_source("https://one/")])));
        let queue = DownloadQueue::new(adapter, options, recorder.clone())
            .await
            .unwrap();
        (Arc::new(queue), recorder)
    }

    fn out(dir: &Path, body: &[u8]) -> PathBuf {
        dir.join("out").join(format!("{}.png", hash(body)))
    }

    #[tokio::test]
    async fn downloads_and_records() {
        let dir = TempDir::new("queue").unwrap();
        let transport = Arc::new(
            FakeTransport::new()
                .ok("https://cdn.test/1.png", "one")
                .ok("https://cdn.test/2.png", "two"),
        );
        let (queue, recorder) = setup(transport, dir.path(), |_| {}).await;

        let summary = queue
            .download_all(vec![image(1, b"one", ""), image(2, b"two", "")], &[])
            .await;
        assert_eq!(summary.downloaded, 2);
        assert_eq!(fs::read(out(dir.path(), b"one")).await.unwrap(), b"one");
        assert_eq!(fs::read(out(dir.path(), b"two")).await.unwrap(), b"two");

        let statuses = recorder.statuses_of(1);
        assert_eq!(
            statuses,
            vec![JobStatus::Queued, JobStatus::Active, JobStatus::Saving, JobStatus::Done]
        );
        assert_eq!(*recorder.summaries.lock(), vec![summary]);
        assert_eq!(queue.ledger.lock().await.len(), 2);
        assert!(queue.snapshot(vec![]).jobs.is_empty());
    }

    #[tokio::test]
    async fn shared_md5_transfers_once() {
        let dir = TempDir::new("queue").unwrap();
        let transport = Arc::new(FakeTransport::new().route(
            "https://cdn.test/",
            vec![Reply::Slow(Duration::from_millis(20), vec![b"sa".to_vec(), b"me".to_vec()])],
        ));
        let (queue, recorder) = setup(transport.clone(), dir.path(), |_| {}).await;

        let summary = queue
            .download_all(
                vec![image(1, b"same", ""), image(2, b"same", ""), image(3, b"same", "")],
                &[],
            )
            .await;
        assert_eq!(summary.downloaded, 1);
        assert_eq!(summary.ignored, 2);
        assert_eq!(transport.calls_to("https://cdn.test/"), 1);

        let actives = recorder
            .jobs
            .lock()
            .iter()
            .filter(|(_, s)| *s == JobStatus::Active)
            .count();
        assert_eq!(actives, 1);
    }

    #[tokio::test]
    async fn queues_on_one_ledger_file_share_it() {
        let dir = TempDir::new("queue").unwrap();
        let transport = Arc::new(FakeTransport::new().route(
            "https://cdn.test/",
            vec![Reply::Slow(Duration::from_millis(20), vec![b"sa".to_vec(), b"me".to_vec()])],
        ));
        let by_id = |o: &mut QueueOptions| o.rules.template = "%id%.%ext%".into();
        let (first, _) = setup(transport.clone(), dir.path(), by_id).await;
        let (second, _) = setup(transport.clone(), dir.path(), by_id).await;
        assert!(Arc::ptr_eq(&first.ledger(), &second.ledger()));

        let (a, b) = tokio::join!(
            first.download_all(vec![image(1, b"same", "")], &[]),
            second.download_all(vec![image(2, b"same", "")], &[]),
        );
        assert_eq!(a.downloaded + b.downloaded, 1);
        assert_eq!(a.ignored + b.ignored, 1);
        assert_eq!(transport.calls_to("https://cdn.test/"), 1);

        let saved = [1, 2]
            .iter()
            .filter(|id| dir.path().join(format!("out/{}.png", id)).exists())
            .count();
        assert_eq!(saved, 1);
    }

    fn unhashed(id: u64) -> ImageRecord {
        let mut draft = RecordDraft::new();
        draft.set("id", id.to_string());
        draft.set("file_url", format!("https://cdn.test/{}.png", id));
        ImageRecord::from_draft("testbooru", "https://test.booru", draft).unwrap()
    }

    #[tokio::test]
    async fn unhashed_duplicates_are_caught_after_download() {
        let dir = TempDir::new("queue").unwrap();
        let transport = Arc::new(FakeTransport::new().ok("https://cdn.test/", "same body"));
        let (queue, recorder) = setup(transport.clone(), dir.path(), |o| {
            o.rules.template = "%id%.%ext%".into();
        })
        .await;

        let summary = queue.download_all(vec![unhashed(1), unhashed(2)], &[]).await;
        assert_eq!(summary.downloaded, 1);
        assert_eq!(summary.ignored, 1);
        assert_eq!(transport.calls_to("https://cdn.test/"), 2);

        let kept: Vec<u64> = [1, 2]
            .into_iter()
            .filter(|id| dir.path().join(format!("out/{}.png", id)).exists())
            .collect();
        assert_eq!(kept.len(), 1);
        let skips = recorder
            .jobs
            .lock()
            .iter()
            .filter(|(_, s)| matches!(s, JobStatus::Skipped(_)))
            .count();
        assert_eq!(skips, 1);

        let ledger = queue.ledger();
        let ledger = ledger.lock().await;
        assert_eq!(ledger.len(), 1);
        assert_eq!(
            ledger.get(&hash(b"same body")),
            Some(dir.path().join(format!("out/{}.png", kept[0])).as_path())
        );
    }

    #[tokio::test]
    async fn unhashed_duplicates_follow_the_copy_policy() {
        let dir = TempDir::new("queue").unwrap();
        let transport = Arc::new(FakeTransport::new().ok("https://cdn.test/", "same body"));
        let (queue, _) = setup(transport, dir.path(), |o| {
            o.rules.template = "%id%.%ext%".into();
            o.duplicate_policy = DuplicatePolicy::Copy;
        })
        .await;

        let summary = queue.download_all(vec![unhashed(1), unhashed(2)], &[]).await;
        assert_eq!(summary.downloaded, 1);
        assert_eq!(summary.already_existing, 1);
        for id in [1, 2] {
            let path = dir.path().join(format!("out/{}.png", id));
            assert_eq!(fs::read(path).await.unwrap(), b"same body");
        }
    }

    #[tokio::test]
    async fn site_limit_bounds_active_jobs() {
        let dir = TempDir::new("queue").unwrap();
        let mut transport = FakeTransport::new();
        let bodies: Vec<Vec<u8>> = (1..=5u8).map(|i| vec![i; 8]).collect();
        for (i, body) in bodies.iter().enumerate() {
            transport = transport.route(
                &format!("https://cdn.test/{}.png", i + 1),
                vec![Reply::Slow(Duration::from_millis(15), vec![body.clone(), body.clone()])],
            );
        }
        let records = bodies
            .iter()
            .enumerate()
            .map(|(i, b)| {
                let mut record = image(i as u64 + 1, b, "");
                record.md5 = None;
                record
            })
            .collect();
        let (queue, recorder) = setup(Arc::new(transport), dir.path(), |_| {}).await;

        let summary = queue.download_all(records, &[]).await;
        assert_eq!(summary.downloaded, 5);

        let mut active = 0;
        let mut max_active = 0;
        for (_, status) in recorder.jobs.lock().iter() {
            match status {
                JobStatus::Active => active += 1,
                s if s.is_terminal() => active -= 1,
                _ => {}
            }
            max_active = max_active.max(active);
        }
        // max_simultaneous_downloads of the test site
        assert_eq!(max_active, 2);
    }

    #[tokio::test]
    async fn move_policy_relocates_without_fetching() {
        let dir = TempDir::new("queue").unwrap();
        let old = dir.path().join("old").join("keep.png");
        fs::create_dir_all(old.parent().unwrap()).await.unwrap();
        fs::write(&old, b"body").await.unwrap();

        let transport = Arc::new(FakeTransport::new());
        let (queue, recorder) = setup(transport.clone(), dir.path(), |o| {
            o.duplicate_policy = DuplicatePolicy::Move;
        })
        .await;
        queue.ledger.lock().await.record(&hash(b"body"), &old).await.unwrap();

        let summary = queue.download_all(vec![image(9, b"body", "")], &[]).await;
        assert_eq!(summary.already_existing, 1);
        assert_eq!(transport.call_count(), 0);
        assert!(!old.exists());
        assert_eq!(fs::read(out(dir.path(), b"body")).await.unwrap(), b"body");
        assert!(matches!(
            recorder.statuses_of(1).last(),
            Some(JobStatus::Skipped(_))
        ));
        assert_eq!(
            queue.ledger.lock().await.get(&hash(b"body")),
            Some(out(dir.path(), b"body").as_path())
        );
    }

    #[tokio::test]
    async fn copy_policy_and_existing_targets() {
        let dir = TempDir::new("queue").unwrap();
        let old = dir.path().join("old.png");
        fs::write(&old, b"copy me").await.unwrap();
        fs::create_dir_all(dir.path().join("out")).await.unwrap();
        fs::write(out(dir.path(), b"exists"), b"exists").await.unwrap();
        fs::write(out(dir.path(), b"stale"), b"corrupted").await.unwrap();

        let transport = Arc::new(FakeTransport::new().ok("https://cdn.test/3.png", "stale"));
        let (queue, _) = setup(transport.clone(), dir.path(), |o| {
            o.duplicate_policy = DuplicatePolicy::Copy;
        })
        .await;
        queue.ledger.lock().await.record(&hash(b"copy me"), &old).await.unwrap();

        let summary = queue
            .download_all(
                vec![image(1, b"copy me", ""), image(2, b"exists", ""), image(3, b"stale", "")],
                &[],
            )
            .await;
        assert_eq!(summary.already_existing, 2);
        assert_eq!(summary.downloaded, 1);
        assert!(old.exists());
        assert!(out(dir.path(), b"copy me").exists());
        assert_eq!(fs::read(out(dir.path(), b"stale")).await.unwrap(), b"stale");
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn missing_remote_file() {
        let dir = TempDir::new("queue").unwrap();
        let (queue, recorder) = setup(Arc::new(FakeTransport::new()), dir.path(), |_| {}).await;
        let summary = queue.download_all(vec![image(1, b"x", "")], &[]).await;
        assert_eq!(summary.not_found, 1);
        assert!(matches!(recorder.statuses_of(1).last(), Some(JobStatus::Failed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn network_errors_are_retried() {
        let dir = TempDir::new("queue").unwrap();
        // The adapter tries three times before giving up on a request
        let transport = Arc::new(FakeTransport::new().route(
            "https://cdn.test/1.png",
            vec![
                Reply::Status(500, vec![]),
                Reply::Status(500, vec![]),
                Reply::Status(500, vec![]),
                Reply::Status(200, b"ok".to_vec()),
            ],
        ));
        let (queue, recorder) = setup(transport.clone(), dir.path(), |o| o.retries = 1).await;
        let summary = queue.download_all(vec![image(1, b"ok", "")], &[]).await;
        assert_eq!(summary.downloaded, 1);
        assert_eq!(transport.call_count(), 4);
        assert_eq!(recorder.statuses_of(1).last(), Some(&JobStatus::Done));

        let transport = Arc::new(
            FakeTransport::new().route("https://cdn.test/2.png", vec![Reply::Status(502, vec![])]),
        );
        let (queue, _) = setup(transport, dir.path(), |o| o.retries = 1).await;
        let summary = queue.download_all(vec![image(2, b"never", "")], &[]).await;
        assert_eq!(summary.errored, 1);
        assert_eq!(queue.handle().gate(), Gate::Open);
    }

    #[tokio::test]
    async fn corrupted_download_fails() {
        let dir = TempDir::new("queue").unwrap();
        let transport = Arc::new(FakeTransport::new().ok("https://cdn.test/1.png", "tampered"));
        let (queue, _) = setup(transport, dir.path(), |_| {}).await;
        let summary = queue.download_all(vec![image(1, b"original", "")], &[]).await;
        assert_eq!(summary.errored, 1);
        assert!(!out(dir.path(), b"original").exists());
    }

    #[tokio::test]
    async fn pause_and_halt_hold_admissions() {
        let dir = TempDir::new("queue").unwrap();
        let transport = Arc::new(FakeTransport::new().ok("https://cdn.test/", "data"));
        let (queue, recorder) = setup(transport, dir.path(), |_| {}).await;
        let handle = queue.handle();

        handle.pause();
        queue.control.halt("disk full");
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let task = queue.clone().setup_async_downloader(rx);
        tx.send(DownloadRequest::new(image(1, b"data", ""), &[])).unwrap();
        drop(tx);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(recorder.statuses_of(1), vec![JobStatus::Queued]);
        assert_eq!(queue.snapshot(vec![]).jobs.len(), 1);

        // Resuming doesn't reopen a halted queue
        handle.resume();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(recorder.statuses_of(1), vec![JobStatus::Queued]);

        handle.resolve_halt();
        let summary = task.await.unwrap();
        assert_eq!(summary.downloaded, 1);
    }

    #[tokio::test]
    async fn cancel_all_removes_partial_files() {
        let dir = TempDir::new("queue").unwrap();
        let chunks = vec![b"aa".to_vec(); 10];
        let transport = Arc::new(
            FakeTransport::new().route("https://cdn.test/", vec![Reply::Slow(Duration::from_millis(30), chunks)]),
        );
        let (queue, recorder) = setup(transport, dir.path(), |_| {}).await;
        let handle = queue.handle();

        let running = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.download_all(vec![image(1, &[b'a'; 20], "")], &[]).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.cancel_all();
        let summary = running.await.unwrap();

        assert_eq!(summary.cancelled, 1);
        assert_eq!(recorder.statuses_of(1).last(), Some(&JobStatus::Cancelled));
        assert!(!out(dir.path(), &[b'a'; 20]).exists());
    }

    #[tokio::test]
    async fn skip_one_job() {
        let dir = TempDir::new("queue").unwrap();
        let transport = Arc::new(
            FakeTransport::new()
                .route(
                    "https://cdn.test/1.png",
                    vec![Reply::Slow(Duration::from_millis(30), vec![b"x".to_vec(); 10])],
                )
                .ok("https://cdn.test/2.png", "quick"),
        );
        let (queue, _) = setup(transport, dir.path(), |_| {}).await;
        let handle = queue.handle();

        let running = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .download_all(vec![image(1, &[b'x'; 10], ""), image(2, b"quick", "")], &[])
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        let pending = queue.snapshot(vec![]).jobs;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, JobStatus::Active);
        let slow_job = pending[0].id;
        assert!(handle.skip(slow_job));

        let summary = running.await.unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.downloaded, 1);
        assert!(!handle.skip(slow_job));
    }

    #[tokio::test]
    async fn one_file_per_tag_copies() {
        let dir = TempDir::new("queue").unwrap();
        let transport = Arc::new(FakeTransport::new().ok("https://cdn.test/", "pic"));
        let (queue, _) = setup(transport.clone(), dir.path(), |o| {
            o.rules.template = "%character%/%md5%.%ext%".into();
            o.rules.naming.character.policy = crate::filename::TagPolicy::OneFilePerTag;
        })
        .await;

        let summary = queue.download_all(vec![image(1, b"pic", "alice bob")], &[]).await;
        assert_eq!(summary.downloaded, 1);
        let name = format!("{}.png", hash(b"pic"));
        assert!(dir.path().join("out/alice").join(&name).exists());
        assert!(dir.path().join("out/bob").join(&name).exists());
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn rules_are_validated_on_change() {
        let dir = TempDir::new("queue").unwrap();
        let (queue, recorder) = setup(Arc::new(FakeTransport::new()), dir.path(), |_| {}).await;

        let bad = FilenameRules {
            template: "%nope%".into(),
            ..Default::default()
        };
        assert!(matches!(queue.set_rules(bad), Err(QueueError::Validation { .. })));

        let warned = FilenameRules {
            template: "%id%.%ext%".into(),
            ..Default::default()
        };
        assert_eq!(queue.set_rules(warned.clone()).unwrap().len(), 1);
        assert_eq!(queue.rule_issues().len(), 1);
        assert_eq!(queue.set_rules(warned).unwrap().len(), 1);

        let skipping = FilenameRules {
            template: "expr:score / 0".into(),
            script_error_policy: ScriptErrorPolicy::Skip,
            ..Default::default()
        };
        // The dry run fails too, so the rules are refused
        assert!(queue.set_rules(skipping).is_err());

        let conditional = FilenameRules {
            template: r#"expr:contains(character, "bob") ? 1 / 0 : md5 + "." + ext"#.into(),
            script_error_policy: ScriptErrorPolicy::Skip,
            ..Default::default()
        };
        queue.set_rules(conditional).unwrap();
        let summary = queue.download_all(vec![image(4, b"z", "bob")], &[]).await;
        assert_eq!(summary.skipped, 1);
        assert!(matches!(recorder.statuses_of(1).last(), Some(JobStatus::Skipped(_))));
    }
}
