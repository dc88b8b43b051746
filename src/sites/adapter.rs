//! Normalizes the configured sources of every site behind one `fetch` call.
//!
//! For each request the adapter walks the site's sources in priority order. A source that
//! can't serve the request, or whose answer fails to parse, is skipped in favor of the next
//! one. Network trouble is retried with the site's error backoff, authentication failures
//! are surfaced right away.
use std::sync::Arc;

use ahash::AHashMap;
use log::{debug, warn};
use parking_lot::Mutex;
use tokio::time::Instant;

use super::auth::{AuthError, AuthManager};
use super::error::ExtractorError;
use super::template::{expand, TemplateVars};
use super::transport::{HttpRequest, HttpResponse, Transport};
use super::{Purpose, SiteConfig};
use crate::parser::{Pagination, ParseError, ParseRequest, SourceFeatures};
use crate::rate_limit::RateLimiter;
use crate::record::ImageRecord;

/// Parameters of a page or details request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchParams {
    pub tags: Vec<String>,
    pub page: u32,
    pub limit: u32,
    /// Target of a details request
    pub id: Option<u64>,
    pub md5: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FetchResult {
    pub records: Vec<ImageRecord>,
    pub pagination: Pagination,
    /// Position of the source that answered
    pub source: usize,
}

pub struct SourceAdapter {
    transport: Arc<dyn Transport>,
    limiter: Arc<RateLimiter>,
    auth: AuthManager,
    sites: AHashMap<String, Arc<SiteConfig>>,
    offline_until: Mutex<AHashMap<String, Instant>>,
}

impl std::fmt::Debug for SourceAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceAdapter")
            .field("sites", &self.sites.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// What happened to one attempt against one source.
enum Attempt {
    Done(FetchResult),
    /// The source can't be used for this request, try the next one
    Skip(String),
}

impl SourceAdapter {
    pub fn new(
        transport: Arc<dyn Transport>,
        limiter: Arc<RateLimiter>,
        sites: impl IntoIterator<Item = SiteConfig>,
    ) -> Self {
        let sites = sites
            .into_iter()
            .map(|site| {
                limiter.register(&site.name, site.intervals);
                (site.name.clone(), Arc::new(site))
            })
            .collect();
        Self {
            transport,
            limiter,
            auth: AuthManager::new(),
            sites,
            offline_until: Mutex::new(AHashMap::new()),
        }
    }

    /// Replaces the in-memory auth session store, e.g. by one backed by a cache directory.
    pub fn with_auth(mut self, auth: AuthManager) -> Self {
        self.auth = auth;
        self
    }

    pub fn site(&self, name: &str) -> Result<Arc<SiteConfig>, ExtractorError> {
        self.sites
            .get(name)
            .cloned()
            .ok_or_else(|| ExtractorError::UnknownSite {
                site: name.to_string(),
            })
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Fetches a listing (`Purpose::Page`) or a single post (`Purpose::Details`).
    pub async fn fetch(
        &self,
        site: &str,
        purpose: Purpose,
        params: &FetchParams,
    ) -> Result<FetchResult, ExtractorError> {
        let config = self.site(site)?;
        let tagless = params.tags.is_empty();

        for (index, source) in config.sources.iter().enumerate() {
            let Some(template) = source.template_for(purpose, tagless) else {
                debug!("{} source #{} has no {} url", site, index + 1, purpose);
                continue;
            };
            let features = source.format.features();
            if purpose == Purpose::Details && !features.contains(SourceFeatures::DETAILS) {
                continue;
            }
            if !tagless && !features.contains(SourceFeatures::TAG_SEARCH) {
                debug!("{} source #{} can't search tags", site, index + 1);
                continue;
            }

            let vars = TemplateVars {
                tags: &params.tags,
                page: params.page,
                limit: params.limit,
                id: params.id,
                md5: params.md5.as_deref(),
                credentials: Some(&config.credentials),
                ..Default::default()
            };
            let url = expand(template, &vars);

            match self.attempt(&config, purpose, index, &url, params).await? {
                Attempt::Done(result) => return Ok(result),
                Attempt::Skip(reason) => {
                    warn!("{} source #{} failed: {}", site, index + 1, reason);
                }
            }
        }

        Err(ExtractorError::NoValidSource {
            site: site.to_string(),
        })
    }

    async fn attempt(
        &self,
        config: &SiteConfig,
        purpose: Purpose,
        index: usize,
        url: &str,
        params: &FetchParams,
    ) -> Result<Attempt, ExtractorError> {
        let source = &config.sources[index];
        let res = match self.send(config, purpose, HttpRequest::get(url)).await {
            Ok(res) => res,
            // A dead endpoint on one source does not mean the others are dead too
            Err(ExtractorError::NotFound { url }) => {
                return Ok(Attempt::Skip(format!("{} not found", url)))
            }
            Err(e) => return Err(e),
        };

        let body = res.text().await.map_err(|e| ExtractorError::Network {
            site: config.name.clone(),
            message: e.to_string(),
        })?;

        let request = ParseRequest {
            tag_search: !params.tags.is_empty(),
            page: params.page,
            limit: params.limit,
        };
        let parsed = match source.format.parse(&source.map, &body, &request) {
            Ok(parsed) => parsed,
            Err(e @ (ParseError::Malformed(_) | ParseError::CapabilityUnsupported(_))) => {
                return Ok(Attempt::Skip(e.to_string()))
            }
        };

        let total_drafts = parsed.drafts.len();
        let records: Vec<ImageRecord> = parsed
            .drafts
            .into_iter()
            .filter_map(|draft| match ImageRecord::from_draft(&config.name, &config.base_url, draft) {
                Ok(record) => Some(record.with_source_index(index)),
                Err(e) => {
                    debug!("Dropping unusable post from {}: {}", config.name, e);
                    None
                }
            })
            .collect();

        if total_drafts > 0 && records.is_empty() {
            return Ok(Attempt::Skip(format!(
                "none of the {} results could be mapped",
                total_drafts
            )));
        }

        debug!(
            "{} source #{} returned {} posts",
            config.name,
            index + 1,
            records.len()
        );

        Ok(Attempt::Done(FetchResult {
            records,
            pagination: parsed.pagination,
            source: index,
        }))
    }

    /// Opens a download of the full image or thumbnail of `record`.
    ///
    /// The template of the source that returned the record rewrites the url. When that
    /// source has none, the url found in the record is used as is. Templates of other
    /// sources only apply to records without a url or without a known source.
    pub async fn download(
        &self,
        purpose: Purpose,
        record: &ImageRecord,
    ) -> Result<HttpResponse, ExtractorError> {
        let config = self.site(&record.site)?;
        let direct = match purpose {
            Purpose::Thumbnail => record.thumbnail_url.as_deref(),
            _ => record.image_url(),
        };

        let ext = record.extension.to_string();
        let any_template = || {
            config
                .sources
                .iter()
                .find_map(|s| s.template_for(purpose, false))
        };
        let template = match record.source_index.and_then(|i| config.sources.get(i)) {
            Some(source) => source
                .template_for(purpose, false)
                .or_else(|| direct.is_none().then(any_template).flatten()),
            None => any_template(),
        };
        let url = match (template, direct) {
            (Some(template), _) => expand(
                template,
                &TemplateVars {
                    id: Some(record.id),
                    md5: record.md5.as_deref(),
                    ext: Some(&ext),
                    url: direct,
                    credentials: Some(&config.credentials),
                    ..Default::default()
                },
            ),
            (None, Some(url)) => url.to_string(),
            (None, None) => return Err(ExtractorError::MissingUrl { id: record.id }),
        };

        let mut request = HttpRequest::get(url);
        if let Some(page) = &record.page_url {
            request = request.header("Referer", page.clone());
        }
        self.send(&config, purpose, request).await
    }

    /// Sends one request through auth, the rate limiter and the retry loop.
    async fn send(
        &self,
        config: &SiteConfig,
        purpose: Purpose,
        request: HttpRequest,
    ) -> Result<HttpResponse, ExtractorError> {
        let site = config.name.as_str();
        let request = request.header("User-Agent", config.user_agent.clone());
        let request = self
            .auth
            .authorize(config, self.transport.as_ref(), request)
            .await?;

        let mut attempt = 0;
        loop {
            self.check_online(site)?;
            self.limiter.await_slot(site, purpose).await;

            let failure = match self.transport.execute(request.clone()).await {
                Ok(res) => match res.status {
                    200..=299 => return Ok(res),
                    401 | 403 => {
                        self.auth.invalidate(site).await;
                        return Err(AuthError::InvalidLogin.into());
                    }
                    404 | 410 => {
                        return Err(ExtractorError::NotFound {
                            url: request.url.clone(),
                        })
                    }
                    503 => {
                        let until = Instant::now() + self.limiter.interval(site, Purpose::Error);
                        self.offline_until.lock().insert(site.to_string(), until);
                        warn!("{} answered 503, treating it as offline", site);
                        return Err(ExtractorError::ServerOffline {
                            site: site.to_string(),
                        });
                    }
                    status => format!("server answered {}", status),
                },
                Err(e) => e.to_string(),
            };

            if attempt >= config.network_retries {
                return Err(ExtractorError::Network {
                    site: site.to_string(),
                    message: failure,
                });
            }
            attempt += 1;
            debug!(
                "Request to {} failed ({}), retry {}/{}",
                site, failure, attempt, config.network_retries
            );
            self.limiter.backoff(site).await;
        }
    }

    fn check_online(&self, site: &str) -> Result<(), ExtractorError> {
        let mut offline = self.offline_until.lock();
        match offline.get(site) {
            Some(until) if Instant::now() < *until => Err(ExtractorError::ServerOffline {
                site: site.to_string(),
            }),
            Some(_) => {
                offline.remove(site);
                Ok(())
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::time::Duration;

    use super::*;
    use crate::parser::{ExtractionMap, SourceFormat};
    use crate::sites::transport::fake::{FakeTransport, Reply};
    use crate::sites::transport::TransportError;
    use crate::sites::{RateIntervals, SourceDefinition, UrlTemplates};

    pub(crate) fn json_source(search: &str) -> SourceDefinition {
        let mut map = ExtractionMap::default();
        for (k, v) in [("id", "id"), ("md5", "md5"), ("file_url", "file_url"), ("tags", "tags"), ("rating", "rating")] {
            map.fields.insert(k.into(), v.into());
        }
        SourceDefinition {
            format: SourceFormat::Json,
            urls: UrlTemplates {
                search: Some(search.to_string()),
                home: Some(search.to_string()),
                ..Default::default()
            },
            map,
        }
    }

    pub(crate) fn test_site(sources: Vec<SourceDefinition>) -> SiteConfig {
        SiteConfig {
            name: "testbooru".into(),
            pretty_name: "Test".into(),
            base_url: "https://test.booru".into(),
            user_agent: "tests".into(),
            sources,
            auth: Default::default(),
            credentials: Default::default(),
            intervals: RateIntervals {
                page: 1.0,
                details: 0.0,
                thumbnail: 0.0,
                image: 0.0,
                error: 2.0,
            },
            page_limit: Some(5),
            max_tags: Some(2),
            premium_max_tags: None,
            images_per_page: 2,
            max_simultaneous_downloads: 2,
            network_retries: 2,
        }
    }

    pub(crate) fn adapter(transport: Arc<FakeTransport>, site: SiteConfig) -> SourceAdapter {
        SourceAdapter::new(transport, Arc::new(RateLimiter::new()), [site])
    }

    fn params(tags: &[&str], page: u32) -> FetchParams {
        FetchParams {
            tags: tags.iter().map(|t| t.to_string()).collect(),
            page,
            limit: 2,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn falls_back_to_second_source() {
        let transport = Arc::new(
            FakeTransport::new()
                .ok("https://one/", "<html>maintenance</html>")
                .ok("https://two/", r#"[{"id":1,"tags":"a b"},{"id":2,"tags":"c"}]"#),
        );
        let site = test_site(vec![
            json_source("https://one/posts?tags={tags}&page={page}"),
            json_source("https://two/posts?tags={tags}&page={page}"),
        ]);
        let adapter = adapter(transport.clone(), site);

        let res = adapter
            .fetch("testbooru", Purpose::Page, &params(&["a"], 1))
            .await
            .unwrap();
        assert_eq!(res.source, 1);
        assert_eq!(res.records.len(), 2);
        assert!(res.pagination.has_more);
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_sources() {
        let transport = Arc::new(FakeTransport::new().ok("https://one/", "nope"));
        let mut rss = json_source("https://rss/feed");
        rss.format = SourceFormat::Rss;
        let site = test_site(vec![json_source("https://one/?t={tags}"), rss]);
        let adapter = adapter(transport.clone(), site);

        let err = adapter
            .fetch("testbooru", Purpose::Page, &params(&["a"], 1))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractorError::NoValidSource { .. }));
        assert_eq!(err.to_string(), "No valid source of the site returned result.");
        // The RSS source can't search tags, so it was never called
        assert_eq!(transport.calls_to("https://rss/"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn network_errors_are_retried_with_backoff() {
        let transport = Arc::new(FakeTransport::new().route(
            "https://one/",
            vec![
                Reply::Fail(TransportError::Timeout),
                Reply::Status(500, vec![]),
                Reply::Status(200, br#"[{"id":9}]"#.to_vec()),
            ],
        ));
        let adapter = adapter(transport.clone(), test_site(vec![json_source("https://one/?t={tags}")]));
        let start = Instant::now();

        let res = adapter
            .fetch("testbooru", Purpose::Page, &params(&[], 1))
            .await
            .unwrap();
        assert_eq!(res.records[0].id, 9);
        assert_eq!(transport.call_count(), 3);
        assert!(Instant::now() - start >= Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn network_error_surfaces_after_retries() {
        let transport = Arc::new(
            FakeTransport::new()
                .route("https://one/", vec![Reply::Fail(TransportError::Timeout)])
                .ok("https://two/", r#"[{"id":1}]"#),
        );
        let adapter = adapter(
            transport.clone(),
            test_site(vec![json_source("https://one/?t={tags}"), json_source("https://two/?t={tags}")]),
        );
        let err = adapter
            .fetch("testbooru", Purpose::Page, &params(&[], 1))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractorError::Network { .. }));
        assert_eq!(transport.calls_to("https://one/"), 3);
        // The next source is never tried on a network failure
        assert_eq!(transport.calls_to("https://two/"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_errors_are_not_retried() {
        let transport = Arc::new(
            FakeTransport::new().route("https://one/", vec![Reply::Status(401, vec![])]),
        );
        let adapter = adapter(transport.clone(), test_site(vec![json_source("https://one/?t={tags}")]));
        let err = adapter
            .fetch("testbooru", Purpose::Page, &params(&[], 1))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractorError::AuthenticationFailure { .. }));
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn server_offline_short_circuits() {
        let transport = Arc::new(
            FakeTransport::new().route("https://one/", vec![Reply::Status(503, vec![])]),
        );
        let adapter = adapter(transport.clone(), test_site(vec![json_source("https://one/?t={tags}")]));
        for _ in 0..2 {
            let err = adapter
                .fetch("testbooru", Purpose::Page, &params(&[], 1))
                .await
                .unwrap_err();
            assert!(matches!(err, ExtractorError::ServerOffline { .. }));
        }
        assert_eq!(transport.call_count(), 1);

        tokio::time::advance(Duration::from_secs(3)).await;
        let _ = adapter.fetch("testbooru", Purpose::Page, &params(&[], 1)).await;
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn page_requests_are_rate_limited() {
        let transport = Arc::new(FakeTransport::new().ok("https://one/", r#"[{"id":1}]"#));
        let adapter = adapter(transport.clone(), test_site(vec![json_source("https://one/?p={page}")]));
        let start = Instant::now();
        adapter.fetch("testbooru", Purpose::Page, &params(&[], 1)).await.unwrap();
        let first = Instant::now();
        adapter.fetch("testbooru", Purpose::Page, &params(&[], 2)).await.unwrap();
        assert!(first - start < Duration::from_millis(10));
        assert!(Instant::now() - first >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn download_uses_record_url() {
        let transport = Arc::new(
            FakeTransport::new()
                .ok("https://one/", r#"[{"id":3,"file_url":"/data/abc.png","md5":"abc"}]"#)
                .ok("https://test.booru/data/", "PNGDATA"),
        );
        let adapter = adapter(transport.clone(), test_site(vec![json_source("https://one/?t={tags}")]));
        let res = adapter
            .fetch("testbooru", Purpose::Page, &params(&[], 1))
            .await
            .unwrap();
        let body = adapter
            .download(Purpose::Image, &res.records[0])
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(body, b"PNGDATA");
    }

    #[tokio::test]
    async fn download_follows_the_producing_source() {
        let mut templated = json_source("https://two/?t={tags}");
        templated.urls.image = Some("https://two.cdn/{md5}.{ext}".into());
        let transport = Arc::new(
            FakeTransport::new()
                .ok("https://one/", r#"[{"id":3,"file_url":"/data/abc.png","md5":"abc"}]"#)
                .ok("https://test.booru/data/", "FROM ONE")
                .ok("https://two.cdn/", "FROM TWO"),
        );
        let adapter = adapter(
            transport.clone(),
            test_site(vec![json_source("https://one/?t={tags}"), templated]),
        );
        let res = adapter
            .fetch("testbooru", Purpose::Page, &params(&[], 1))
            .await
            .unwrap();
        assert_eq!(res.source, 0);
        assert_eq!(res.records[0].source_index, Some(0));

        let body = adapter
            .download(Purpose::Image, &res.records[0])
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(body, b"FROM ONE");

        // A record the second source returned goes through its template
        let from_two = res.records[0].clone().with_source_index(1);
        let body = adapter
            .download(Purpose::Image, &from_two)
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(body, b"FROM TWO");
        assert_eq!(transport.calls_to("https://two.cdn/abc.png"), 1);
    }
}
