//! Paginated searches.
//!
//! A [`Page`] owns one search (a site and a tag list) and walks its result pages, either
//! replacing the visible records with each fetch or appending to them ("infinite scroll").
//! Ids already shown during the session are never shown again, so consecutive pages do not
//! overlap even when the site shifts its listing in between.
//!
//! ```text
//! Idle -> Fetching -> Ready
//!                  -> Error(reason)   (same index can be retried)
//! ```
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use log::{debug, warn};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::events::{LogType, SharedEventListener};
use crate::filter::lists::{Classifier, LoadStage, Verdict};
use crate::filter::{FilterContext, FilterExpression};
use crate::record::ImageRecord;
use crate::sites::adapter::{FetchParams, SourceAdapter};
use crate::sites::error::ExtractorError;
use crate::sites::{Purpose, SiteConfig};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PageState {
    #[default]
    Idle,
    Fetching,
    Ready,
    /// The last fetch failed with the given reason
    Error(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FetchMode {
    /// Show only the records of the fetched page
    #[default]
    Replace,
    /// Append the fetched records to the ones already shown
    Merge,
}

/// Snapshot handed to listeners on every state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageStatus {
    pub site: String,
    pub tags: Vec<String>,
    pub index: u32,
    pub state: PageState,
    pub records: usize,
    pub has_more: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PageOptions {
    /// Expression every record has to pass to be shown
    pub post_filter: Option<FilterExpression>,
    pub classifier: Option<Classifier>,
    /// Drop blocked records instead of keeping them aside
    pub hide_blacklisted: bool,
    /// Overrides the site's `images_per_page`
    pub images_per_page: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedRecord {
    pub record: ImageRecord,
    pub reason: String,
}

/// What a successful fetch changed.
#[derive(Debug, Clone, Default)]
pub struct PageOutcome {
    pub added: usize,
    /// Rejected by the post filter
    pub filtered: usize,
    pub blacklisted: usize,
    /// Already shown earlier in the session
    pub duplicates: usize,
    /// Whitelisted records that should be queued right away
    pub auto_download: Vec<ImageRecord>,
    pub has_more: bool,
}

/// Cancels whatever fetch its page is running. Cancelling an idle page does nothing.
#[derive(Debug, Clone)]
pub struct PageHandle {
    cancel: Arc<Mutex<CancellationToken>>,
}

impl PageHandle {
    pub fn cancel(&self) {
        self.cancel.lock().cancel();
    }
}

#[derive(Debug)]
pub struct Page {
    adapter: Arc<SourceAdapter>,
    site: Arc<SiteConfig>,
    tags: Vec<String>,
    options: PageOptions,
    listener: SharedEventListener,
    index: u32,
    /// Index of the last attempted fetch, for retries
    requested: u32,
    state: PageState,
    records: Vec<ImageRecord>,
    blocked: Vec<BlockedRecord>,
    /// Every id shown this session, merged fetches skip them
    seen: AHashSet<u64>,
    /// Ids each page index returned, replacing fetches skip the ones of the page before
    page_ids: AHashMap<u32, AHashSet<u64>>,
    has_more: bool,
    cancel: Arc<Mutex<CancellationToken>>,
}

impl Page {
    pub fn new(
        adapter: Arc<SourceAdapter>,
        site: &str,
        tags: &[String],
        options: PageOptions,
        listener: SharedEventListener,
    ) -> Result<Self, ExtractorError> {
        let site = adapter.site(site)?;
        Ok(Self {
            adapter,
            site,
            tags: tags.to_vec(),
            options,
            listener,
            index: 0,
            requested: 1,
            state: PageState::Idle,
            records: Vec::new(),
            blocked: Vec::new(),
            seen: AHashSet::new(),
            page_ids: AHashMap::new(),
            has_more: true,
            cancel: Arc::new(Mutex::new(CancellationToken::new())),
        })
    }

    pub fn handle(&self) -> PageHandle {
        PageHandle {
            cancel: self.cancel.clone(),
        }
    }

    pub fn state(&self) -> &PageState {
        &self.state
    }

    pub fn records(&self) -> &[ImageRecord] {
        &self.records
    }

    pub fn blocked(&self) -> &[BlockedRecord] {
        &self.blocked
    }

    /// Index of the last page fetched successfully, 0 before the first one.
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn status(&self) -> PageStatus {
        PageStatus {
            site: self.site.name.clone(),
            tags: self.tags.clone(),
            index: self.index,
            state: self.state.clone(),
            records: self.records.len(),
            has_more: self.has_more,
        }
    }

    fn set_state(&mut self, state: PageState) {
        self.state = state;
        self.listener.on_page_state_changed(&self.status());
    }

    fn limit(&self) -> u32 {
        self.options
            .images_per_page
            .unwrap_or(self.site.images_per_page)
    }

    /// Rejects requests the site would refuse anyway, before anything is sent.
    fn check_quota(&self, index: u32) -> Result<(), ExtractorError> {
        if index == 0 {
            return Err(ExtractorError::ZeroPage);
        }
        if let Some(max) = self.site.page_limit {
            if index > max {
                return Err(ExtractorError::PageTooFar { page: index, max });
            }
        }
        if let Some(max) = self.site.tag_cap() {
            if self.tags.len() > max {
                return Err(ExtractorError::TooManyTags {
                    current: self.tags.len(),
                    max,
                });
            }
        }
        Ok(())
    }

    fn current_token(&self) -> CancellationToken {
        let mut token = self.cancel.lock();
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
        token.clone()
    }

    /// Fetches page `index` of the search.
    ///
    /// Quota errors leave the page untouched. Any other failure moves it to
    /// [`PageState::Error`] with its records intact, and the same index can be fetched again.
    pub async fn fetch(
        &mut self,
        index: u32,
        mode: FetchMode,
    ) -> Result<PageOutcome, ExtractorError> {
        self.check_quota(index)?;
        self.requested = index;

        let token = self.current_token();
        self.set_state(PageState::Fetching);

        let params = FetchParams {
            tags: self.tags.clone(),
            page: index,
            limit: self.limit(),
            ..Default::default()
        };
        let result = tokio::select! {
            biased;
            () = token.cancelled() => Err(ExtractorError::Cancelled),
            res = self.adapter.fetch(&self.site.name, Purpose::Page, &params) => res,
        };

        let fetched = match result {
            Ok(fetched) => fetched,
            Err(ExtractorError::Cancelled) => {
                debug!("Fetch of page {} cancelled", index);
                self.set_state(PageState::Idle);
                return Err(ExtractorError::Cancelled);
            }
            Err(e) => {
                warn!("Fetching page {} of {} failed: {}", index, self.site, e);
                self.set_state(PageState::Error(e.to_string()));
                return Err(e);
            }
        };

        let outcome = self.accept(index, fetched.records, mode, fetched.pagination.has_more);
        self.index = index;
        self.set_state(PageState::Ready);
        Ok(outcome)
    }

    /// Fetches the page after the last successful one.
    pub async fn fetch_next(&mut self, mode: FetchMode) -> Result<PageOutcome, ExtractorError> {
        self.fetch(self.index + 1, mode).await
    }

    /// Repeats the last attempted fetch.
    pub async fn retry(&mut self, mode: FetchMode) -> Result<PageOutcome, ExtractorError> {
        self.fetch(self.requested, mode).await
    }

    fn accept(
        &mut self,
        index: u32,
        records: Vec<ImageRecord>,
        mode: FetchMode,
        has_more: bool,
    ) -> PageOutcome {
        let mut outcome = PageOutcome {
            has_more,
            ..Default::default()
        };
        if mode == FetchMode::Replace {
            self.records.clear();
            self.blocked.clear();
        }

        let previous = index
            .checked_sub(1)
            .and_then(|i| self.page_ids.get(&i))
            .cloned()
            .unwrap_or_default();
        self.page_ids
            .insert(index, records.iter().map(|r| r.id).collect());

        let default_context = FilterContext::default();
        let context = self
            .options
            .classifier
            .as_ref()
            .map_or(&default_context, Classifier::context);

        for record in records {
            let fresh = self.seen.insert(record.id);
            let duplicate = match mode {
                FetchMode::Merge => !fresh,
                FetchMode::Replace => previous.contains(&record.id),
            };
            if duplicate {
                outcome.duplicates += 1;
                continue;
            }

            if let Some(filter) = &self.options.post_filter {
                let eval = filter.evaluate_with(&record, context);
                if !eval.pass {
                    debug!("Post {} filtered out: {}", record.id, eval.reason);
                    outcome.filtered += 1;
                    continue;
                }
            }

            let verdict = self
                .options
                .classifier
                .as_ref()
                .map_or(Verdict::Allow, |c| c.classify(&record, LoadStage::Thumbnail));
            match verdict {
                Verdict::Allow => {}
                Verdict::AutoDownload => outcome.auto_download.push(record.clone()),
                Verdict::Block(reason) => {
                    outcome.blacklisted += 1;
                    self.listener
                        .log_event(LogType::Skip, &record.id.to_string(), &reason);
                    if !self.options.hide_blacklisted {
                        self.blocked.push(BlockedRecord { record, reason });
                    }
                    continue;
                }
            }

            outcome.added += 1;
            self.records.push(record);
        }

        self.has_more = has_more;
        debug!(
            "Page {} of {}: {} added, {} filtered, {} blacklisted, {} already seen",
            self.requested,
            self.site,
            outcome.added,
            outcome.filtered,
            outcome.blacklisted,
            outcome.duplicates
        );
        outcome
    }

    /// Forgets the session: records, seen ids and position.
    pub fn reset(&mut self) {
        self.records.clear();
        self.blocked.clear();
        self.seen.clear();
        self.page_ids.clear();
        self.index = 0;
        self.requested = 1;
        self.has_more = true;
        self.set_state(PageState::Idle);
    }
}
