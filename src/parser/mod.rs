//! Format-specific extraction of search results into [`RecordDraft`]s.
//!
//! Every source definition declares one [`SourceFormat`] plus an [`ExtractionMap`] telling the
//! matching strategy where each record field lives in the response body. Strategies only
//! produce drafts and a pagination hint. Turning drafts into records and deciding what to do
//! with a failed parse is the adapter's job.
use std::collections::BTreeMap;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::RecordDraft;

pub mod json;
pub mod rss;
pub mod scrape;
pub mod xml;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Source can't handle this request: {0}")]
    CapabilityUnsupported(String),
}

bitflags! {
    /// What a response format is able to represent.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SourceFeatures: u8 {
        /// Results can be narrowed by a tag query
        const TAG_SEARCH = 0b0000_0001;
        /// Tags carry a type (artist, character, ...)
        const TYPED_TAGS = 0b0000_0010;
        /// The response may expose the total amount of results
        const TOTAL_COUNT = 0b0000_0100;
        /// Single post lookups are supported
        const DETAILS = 0b0000_1000;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    Xml,
    Json,
    Regex,
    Rss,
}

/// Where to find things inside a response. Field values are interpreted by each format:
///
/// * XML: `@attr` reads an attribute of the result node, `child` reads a child element's
///   text and `child@attr` one of its attributes.
/// * JSON: dot separated paths relative to the result object (`tags.general`, `file.url`).
/// * Regex: `item` is the per-result pattern, its named groups become fields. The entries
///   of `fields` are extra patterns run against the text of each item match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionMap {
    /// Name of the result node (XML), path to the result array (JSON) or item pattern (Regex)
    pub item: Option<String>,
    /// Record field name to location
    pub fields: BTreeMap<String, String>,
    /// Location of the total result count
    pub count: Option<String>,
    /// Location whose presence marks the body as an API error
    pub error: Option<String>,
    /// Location whose presence tells that another page exists
    pub next: Option<String>,
    /// Nested list of typed tag objects (JSON only)
    pub tag_list: Option<TagListMap>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TagListMap {
    pub path: String,
    pub name: String,
    pub kind: Option<String>,
}

/// What the caller needs from this parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseRequest {
    pub tag_search: bool,
    pub page: u32,
    pub limit: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub has_more: bool,
    pub total_known: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedPage {
    pub drafts: Vec<RecordDraft>,
    pub pagination: Pagination,
}

/// Intermediate output shared by all strategies.
#[derive(Debug, Default)]
pub(crate) struct RawParse {
    pub drafts: Vec<RecordDraft>,
    pub total: Option<u64>,
    pub next: Option<bool>,
}

impl SourceFormat {
    pub const fn features(&self) -> SourceFeatures {
        match self {
            Self::Xml | Self::Json => SourceFeatures::all(),
            Self::Regex => SourceFeatures::TAG_SEARCH
                .union(SourceFeatures::TOTAL_COUNT)
                .union(SourceFeatures::DETAILS),
            Self::Rss => SourceFeatures::empty(),
        }
    }

    pub fn parse(
        &self,
        map: &ExtractionMap,
        body: &str,
        request: &ParseRequest,
    ) -> Result<ParsedPage, ParseError> {
        if request.tag_search && !self.features().contains(SourceFeatures::TAG_SEARCH) {
            return Err(ParseError::CapabilityUnsupported(format!(
                "{:?} sources do not support tag search",
                self
            )));
        }

        let raw = match self {
            Self::Xml => xml::parse(map, body)?,
            Self::Json => json::parse(map, body)?,
            Self::Regex => scrape::parse(map, body)?,
            Self::Rss => rss::parse(body)?,
        };

        let has_more = match (raw.next, raw.total) {
            (Some(next), _) => next,
            (None, Some(total)) => u64::from(request.page) * u64::from(request.limit) < total,
            (None, None) if request.limit == 0 => !raw.drafts.is_empty(),
            (None, None) => raw.drafts.len() >= request.limit as usize,
        };

        Ok(ParsedPage {
            drafts: raw.drafts,
            pagination: Pagination {
                has_more,
                total_known: raw.total,
            },
        })
    }
}
