//! Main representation of an imageboard post
//!
//! # ImageRecord
//! An [`ImageRecord`] is the normalized form of one post returned by any configured source.
//! Parsers never build records directly: they emit [`RecordDraft`]s, a flat map of field
//! names to raw strings plus the typed tags they managed to extract, and the adapter turns
//! each draft into a record with [`ImageRecord::from_draft`].
//!
//! Records are immutable once built. Updating a record means building a new one, for
//! example through [`ImageRecord::with_md5`].
use std::collections::BTreeMap;
use std::{cmp::Ordering, fmt::Debug};

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use log::debug;
use serde::{Deserialize, Serialize};

use self::{
    error::RecordError,
    extension::Extension,
    rating::Rating,
    tags::{Tag, TagType},
};

pub mod error;
pub mod extension;
pub mod rating;
pub mod tags;

/// Raw field values extracted by a parser for one result node.
///
/// Recognized keys: `id`, `md5`, `rating`, `score`, `author`, `created_at`, `width`,
/// `height`, `file_size`, `preview_url`, `sample_url`, `file_url`, `parent_id`, `children`,
/// `source`, `page_url`, `ext`, `tags` (flat, space separated) and `tags_<type>` for typed
/// tag strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordDraft {
    /// Ordered, so typed tags are merged the same way every time
    pub fields: BTreeMap<String, String>,
    pub tags: Vec<Tag>,
}

impl RecordDraft {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a field, ignoring empty values so that a later mapping can still fill it.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        if value.trim().is_empty() {
            return;
        }
        self.fields.insert(key.to_string(), value.trim().to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn push_tag(&mut self, tag: Tag) {
        if !self.tags.contains(&tag) {
            self.tags.push(tag);
        }
    }
}

/// Catchall model for the parts of an imageboard post needed to filter, name and save it.
#[derive(Clone, Serialize, Deserialize)]
pub struct ImageRecord {
    /// ID number of the post given by the imageboard
    pub id: u64,
    /// Identifier of the configured site this record came from
    pub site: String,
    /// Content hash. Some sources only expose it on the details endpoint or not at all.
    pub md5: Option<String>,
    pub tags: Vec<Tag>,
    pub rating: Rating,
    pub score: Option<i64>,
    pub author: Option<String>,
    pub date: Option<DateTime<Utc>>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub filesize: Option<u64>,
    pub thumbnail_url: Option<String>,
    pub sample_url: Option<String>,
    pub file_url: Option<String>,
    /// Post page on the site, mostly filled by RSS sources
    pub page_url: Option<String>,
    /// The original file extension, guessed from the file url when the API omits it.
    pub extension: Extension,
    pub parent_id: Option<u64>,
    pub children: Vec<u64>,
    pub source: Option<String>,
    /// Position of the site source that returned the record, when known
    #[serde(default)]
    pub source_index: Option<usize>,
}

impl Debug for ImageRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageRecord")
            .field("ID", &self.id)
            .field("Site", &self.site)
            .field("MD5 Hash", &self.md5)
            .field("File URL", &self.file_url)
            .field("File Extension", &self.extension)
            .field("Rating", &self.rating)
            .field("Tag List", &self.tags)
            .finish()
    }
}

impl Ord for ImageRecord {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl PartialOrd for ImageRecord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ImageRecord {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.site == other.site
    }
}

impl Eq for ImageRecord {}

fn parse_number<T: std::str::FromStr<Err = std::num::ParseIntError>>(
    draft: &RecordDraft,
    field: &str,
) -> Result<Option<T>, RecordError> {
    match draft.get(field) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|source| RecordError::InvalidNumber {
                field: field.to_string(),
                source,
            }),
    }
}

/// Turns scheme-relative and root-relative urls into absolute ones.
pub fn absolute_url(base_url: &str, url: &str) -> String {
    if url.starts_with("//") {
        format!("https:{}", url)
    } else if url.starts_with('/') {
        format!("{}{}", base_url.trim_end_matches('/'), url)
    } else {
        url.to_string()
    }
}

/// Accepts the date shapes seen across booru APIs and feeds.
pub fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    // Gelbooru: "Sat Jan 01 12:00:00 -0500 2022"
    if let Ok(dt) = DateTime::parse_from_str(raw, "%a %b %d %H:%M:%S %z %Y") {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    if let Ok(secs) = raw.parse::<i64>() {
        return Utc.timestamp_opt(secs, 0).single();
    }
    None
}

impl ImageRecord {
    /// Builds a record out of a parser draft.
    ///
    /// Only `id` is mandatory. Relative urls are resolved against `base_url`.
    pub fn from_draft(site: &str, base_url: &str, draft: RecordDraft) -> Result<Self, RecordError> {
        let id = parse_number::<u64>(&draft, "id")?.ok_or_else(|| RecordError::MissingField {
            field: "id".to_string(),
        })?;

        let url = |key: &str| draft.get(key).map(|u| absolute_url(base_url, u));
        let file_url = url("file_url");
        let sample_url = url("sample_url");
        let thumbnail_url = url("preview_url");

        let extension = match draft.get("ext") {
            Some(ext) => Extension::guess_format(ext.trim_start_matches('.')),
            None => file_url
                .as_deref()
                .or(sample_url.as_deref())
                .map(Extension::from_url)
                .unwrap_or(Extension::Unknown),
        };

        let mut tags = draft.tags.clone();
        if let Some(flat) = draft.get("tags") {
            for tag in Tag::split_list(flat, TagType::General) {
                if !tags.iter().any(|t| t.tag() == tag.tag()) {
                    tags.push(tag);
                }
            }
        }
        for (key, value) in &draft.fields {
            if let Some(kind) = key.strip_prefix("tags_") {
                let kind = TagType::from_type_str(kind);
                for tag in Tag::split_list(value, kind) {
                    if !tags.contains(&tag) {
                        tags.push(tag);
                    }
                }
            }
        }

        let score = match draft.get("score") {
            None => None,
            Some(raw) => Some(
                raw.parse::<f64>()
                    .map_err(|source| RecordError::InvalidDecimal {
                        field: "score".to_string(),
                        source,
                    })?
                    .round() as i64,
            ),
        };

        let children = draft
            .get("children")
            .map(|raw| {
                raw.split([',', ' '])
                    .filter_map(|c| c.trim().parse::<u64>().ok())
                    .collect()
            })
            .unwrap_or_default();

        let date = draft.get("created_at").and_then(|raw| {
            let parsed = parse_date(raw);
            if parsed.is_none() {
                debug!("Unrecognized date format on post {}: {}", id, raw);
            }
            parsed
        });

        Ok(Self {
            id,
            site: site.to_string(),
            md5: draft.get("md5").map(str::to_lowercase),
            tags,
            rating: draft
                .get("rating")
                .map(Rating::from_rating_str)
                .unwrap_or_default(),
            score,
            author: draft.get("author").map(str::to_string),
            date,
            width: parse_number(&draft, "width")?,
            height: parse_number(&draft, "height")?,
            filesize: parse_number(&draft, "file_size")?,
            thumbnail_url,
            sample_url,
            file_url,
            page_url: url("page_url"),
            extension,
            // Moebooru sends an empty string for orphan posts, which `set` already drops
            parent_id: parse_number(&draft, "parent_id")?,
            children,
            source: draft.get("source").map(str::to_string),
            source_index: None,
        })
    }

    /// Returns the record tagged with the site source that returned it.
    pub fn with_source_index(self, index: usize) -> Self {
        Self {
            source_index: Some(index),
            ..self
        }
    }

    /// Returns a copy of the record carrying the given content hash.
    pub fn with_md5(&self, md5: &str) -> Self {
        Self {
            md5: Some(md5.to_lowercase()),
            ..self.clone()
        }
    }

    /// All tag names, in source order.
    pub fn tag_names(&self) -> impl Iterator<Item = &str> {
        self.tags.iter().map(Tag::tag)
    }

    pub fn has_tag(&self, name: &str) -> bool {
        self.tags.iter().any(|t| t.tag().eq_ignore_ascii_case(name))
    }

    pub fn tags_of(&self, kind: TagType) -> Vec<&str> {
        self.tags
            .iter()
            .filter(|t| t.tag_type() == kind)
            .map(Tag::tag)
            .collect()
    }

    /// Best url to fetch the full image from.
    pub fn image_url(&self) -> Option<&str> {
        self.file_url.as_deref().or(self.sample_url.as_deref())
    }

    /// Generic name of the record, its MD5 hash if known, otherwise its ID.
    pub fn name(&self) -> String {
        self.md5.clone().unwrap_or_else(|| self.id.to_string())
    }
}
