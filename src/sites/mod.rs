//! Site definitions and everything needed to talk to them.
//!
//! A [`SiteConfig`] describes one imageboard: where it lives, how to authenticate, how often
//! it may be hit and up to four prioritized [`SourceDefinition`]s, each with its own response
//! format and url templates. The [`SourceAdapter`](adapter::SourceAdapter) walks those
//! definitions in order until one of them yields a valid answer.
use std::fmt::Display;
use std::time::Duration;

use ahash::AHashMap;
use log::error;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::parser::{ExtractionMap, SourceFormat};

use self::auth::{AuthDescriptor, Credentials};
use self::error::ExtractorError;

pub mod adapter;
pub mod auth;
pub mod error;
pub mod serialize;
pub mod template;
pub mod transport;

pub(crate) const DEFAULT_UA: &str =
    concat!("Rust Imageboard Fetcher/", env!("CARGO_PKG_VERSION"));

/// A site can't declare more alternative sources than this.
pub const MAX_SOURCES: usize = 4;

/// Built-in site definitions, parsed from the embedded sample file.
pub static DEFAULT_SITES: Lazy<AHashMap<String, SiteConfig>> =
    Lazy::new(|| match serialize::parse_sites(serialize::SAMPLE_SITES_TOML) {
        Ok(sites) => sites,
        Err(e) => {
            error!("Built-in site definitions are invalid: {}", e);
            AHashMap::new()
        }
    });

/// The category of a request, used to key rate limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Purpose {
    Page,
    Details,
    Thumbnail,
    Image,
    /// Backoff slot used after a failed request
    Error,
}

impl Display for Purpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Page => write!(f, "page"),
            Self::Details => write!(f, "details"),
            Self::Thumbnail => write!(f, "thumbnail"),
            Self::Image => write!(f, "image"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Minimum delay between two requests of the same purpose, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateIntervals {
    pub page: f64,
    pub details: f64,
    pub thumbnail: f64,
    pub image: f64,
    pub error: f64,
}

impl Default for RateIntervals {
    fn default() -> Self {
        Self {
            page: 0.5,
            details: 0.5,
            thumbnail: 0.0,
            image: 0.0,
            error: 1.0,
        }
    }
}

impl RateIntervals {
    pub fn get(&self, purpose: Purpose) -> Duration {
        let secs = match purpose {
            Purpose::Page => self.page,
            Purpose::Details => self.details,
            Purpose::Thumbnail => self.thumbnail,
            Purpose::Image => self.image,
            Purpose::Error => self.error,
        };
        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// Url templates, one per request purpose. See [`template`] for the placeholders.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UrlTemplates {
    /// Listing used when the query has no tags
    pub home: Option<String>,
    pub search: Option<String>,
    pub details: Option<String>,
    pub thumbnail: Option<String>,
    pub image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDefinition {
    pub format: SourceFormat,
    #[serde(default)]
    pub urls: UrlTemplates,
    #[serde(default)]
    pub map: ExtractionMap,
}

impl SourceDefinition {
    /// Template used for the given purpose. Tagless page requests prefer the home listing.
    pub fn template_for(&self, purpose: Purpose, tagless: bool) -> Option<&str> {
        match purpose {
            Purpose::Page if tagless => self.urls.home.as_deref().or(self.urls.search.as_deref()),
            Purpose::Page => self.urls.search.as_deref(),
            Purpose::Details => self.urls.details.as_deref(),
            Purpose::Thumbnail => self.urls.thumbnail.as_deref(),
            Purpose::Image => self.urls.image.as_deref(),
            Purpose::Error => None,
        }
    }
}

fn default_user_agent() -> String {
    DEFAULT_UA.to_string()
}

const fn default_images_per_page() -> u32 {
    20
}

const fn default_simultaneous() -> usize {
    4
}

const fn default_retries() -> u32 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    /// Key of the site in the configuration file
    #[serde(skip)]
    pub name: String,
    pub pretty_name: String,
    pub base_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    pub sources: Vec<SourceDefinition>,
    #[serde(default)]
    pub auth: AuthDescriptor,
    #[serde(default)]
    pub credentials: Credentials,
    #[serde(default)]
    pub intervals: RateIntervals,
    /// Highest page index that can be requested
    #[serde(default)]
    pub page_limit: Option<u32>,
    /// Tag cap for regular accounts
    #[serde(default)]
    pub max_tags: Option<usize>,
    /// Tag cap once `credentials.premium` is set. Unlimited when absent.
    #[serde(default)]
    pub premium_max_tags: Option<usize>,
    #[serde(default = "default_images_per_page")]
    pub images_per_page: u32,
    #[serde(default = "default_simultaneous")]
    pub max_simultaneous_downloads: usize,
    /// Extra attempts after a network failure
    #[serde(default = "default_retries")]
    pub network_retries: u32,
}

impl Display for SiteConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl SiteConfig {
    /// Tag cap applying to the configured account, if any.
    pub fn tag_cap(&self) -> Option<usize> {
        if self.credentials.premium {
            self.premium_max_tags
        } else {
            self.max_tags
        }
    }

    pub fn validate(&self) -> Result<(), ExtractorError> {
        if self.sources.is_empty() || self.sources.len() > MAX_SOURCES {
            return Err(ExtractorError::InvalidConfig {
                site: self.name.clone(),
                message: format!(
                    "expected between 1 and {} sources, found {}",
                    MAX_SOURCES,
                    self.sources.len()
                ),
            });
        }
        if self.max_simultaneous_downloads == 0 {
            return Err(ExtractorError::InvalidConfig {
                site: self.name.clone(),
                message: "max_simultaneous_downloads can't be zero".to_string(),
            });
        }
        Ok(())
    }
}
