//! # Record Tags Module
//!
//! This module defines structures for representing and categorizing tags
//! associated with imageboard posts. Tags are a fundamental part of how
//! imageboards organize and allow searching of content.
//!
//! The primary structures are:
//! - [`Tag`](crate::record::tags::Tag): Represents a single tag, containing its textual content and its type.
//! - [`TagType`](crate::record::tags::TagType): An enum categorizing the nature of a tag (e.g., artist, character, species).

use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Represents a single tag associated with an imageboard post.
///
/// Each tag has textual content and a [`TagType`] that categorizes it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Tag {
    /// The textual content of the tag (e.g., "blue_sky", "solo_focus").
    tag: String,
    /// The category or type of the tag.
    tag_type: TagType,
}

/// Categorizes the type or nature of a `Tag`.
///
/// Different imageboards might use different sets of tag types, or imply them
/// through numeric categories or prefixes. This enum aims to provide a common
/// representation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TagType {
    /// Tags identifying the artist(s) of the work.
    Artist,
    /// Tags related to copyright, series, or franchise.
    Copyright,
    /// Tags identifying specific characters depicted.
    Character,
    /// Tags identifying the species of characters, primarily used on e621/e926.
    Species,
    /// General descriptive tags about the content, scene, or attributes.
    General,
    /// Meta-tags related to the post itself (e.g., "high_resolution", "tagme").
    Meta,
    /// Untyped tag, as returned by sources that only give a flat tag string.
    Any,
}

impl TagType {
    /// All the types a filename template can reference by name.
    pub const NAMED: [TagType; 6] = [
        TagType::Artist,
        TagType::Copyright,
        TagType::Character,
        TagType::Species,
        TagType::General,
        TagType::Meta,
    ];

    /// Maps both textual names and the numeric categories used by Danbooru-like APIs.
    pub fn from_type_str(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "artist" | "author" | "creator" | "studio" | "1" => Self::Artist,
            "copyright" | "series" | "franchise" | "3" => Self::Copyright,
            "character" | "4" => Self::Character,
            "species" | "5-e621" => Self::Species,
            "meta" | "metadata" | "5" => Self::Meta,
            "general" | "tag" | "0" => Self::General,
            _ => Self::Any,
        }
    }

    /// Name used by `%token%` substitution and in config files.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Artist => "artist",
            Self::Copyright => "copyright",
            Self::Character => "character",
            Self::Species => "species",
            Self::General => "general",
            Self::Meta => "meta",
            Self::Any => "any",
        }
    }
}

impl Display for TagType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl Tag {
    /// Creates a new `Tag`.
    pub fn new(text: &str, tag_type: TagType) -> Self {
        Self {
            tag: text.to_string(),
            tag_type,
        }
    }

    /// Returns a reference to the textual content of the tag.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Returns the [`TagType`] of the tag.
    pub const fn tag_type(&self) -> TagType {
        self.tag_type
    }

    /// Splits a space separated tag string, as most list endpoints return it.
    pub fn split_list(raw: &str, tag_type: TagType) -> Vec<Self> {
        raw.split_whitespace()
            .map(|t| Self::new(t, tag_type))
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::{Tag, TagType};

    #[test]
    fn numeric_categories() {
        assert_eq!(TagType::from_type_str("1"), TagType::Artist);
        assert_eq!(TagType::from_type_str("4"), TagType::Character);
        assert_eq!(TagType::from_type_str("Copyright"), TagType::Copyright);
        assert_eq!(TagType::from_type_str("lore"), TagType::Any);
    }

    #[test]
    fn split_tag_string() {
        let tags = Tag::split_list("  1girl solo  blue_sky ", TagType::General);
        assert_eq!(tags.len(), 3);
        assert_eq!(tags[2].tag(), "blue_sky");
        assert_eq!(tags[0].tag_type(), TagType::General);
    }
}
