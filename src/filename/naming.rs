//! How the tags of one type turn into the value of their filename token.
use serde::{Deserialize, Serialize};

use crate::record::tags::TagType;

/// What happens once a record has more tags of a type than the `multiple_limit`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagPolicy {
    #[default]
    KeepAll,
    /// Keep the first `multiple_limit` tags
    KeepN,
    /// Keep the first `multiple_limit` tags and append `add_text`
    KeepNThenAdd,
    /// Replace the whole list with `replace_with`
    ReplaceAll,
    /// Save one file per tag
    OneFilePerTag,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TagNaming {
    /// Used when the record has no tag of the type
    pub empty: String,
    pub policy: TagPolicy,
    pub multiple_limit: usize,
    pub separator: String,
    /// Suffix of `KeepNThenAdd`, `%count%` is the number of dropped tags
    pub add_text: String,
    pub replace_with: String,
}

impl Default for TagNaming {
    fn default() -> Self {
        Self {
            empty: String::new(),
            policy: TagPolicy::KeepAll,
            multiple_limit: 1,
            separator: String::from("+"),
            add_text: String::from(" (+ %count%)"),
            replace_with: String::new(),
        }
    }
}

impl TagNaming {
    fn replacing(empty: &str, replace_with: &str) -> Self {
        Self {
            empty: empty.to_string(),
            policy: TagPolicy::ReplaceAll,
            replace_with: replace_with.to_string(),
            ..Default::default()
        }
    }

    fn keeping(empty: &str) -> Self {
        Self {
            empty: empty.to_string(),
            ..Default::default()
        }
    }

    /// Renders `tags` into one value, or several when the list fans out into one file per tag.
    pub fn apply(&self, tags: &[&str], separator: Option<&str>, fan_out: bool) -> Vec<String> {
        let separator = separator.unwrap_or(&self.separator);
        if tags.is_empty() {
            return vec![self.empty.clone()];
        }
        let limit = self.multiple_limit.max(1);

        match self.policy {
            TagPolicy::OneFilePerTag if fan_out => tags.iter().map(|t| t.to_string()).collect(),
            _ if tags.len() <= limit => vec![tags.join(separator)],
            TagPolicy::KeepAll | TagPolicy::OneFilePerTag => vec![tags.join(separator)],
            TagPolicy::KeepN => vec![tags[..limit].join(separator)],
            TagPolicy::KeepNThenAdd => {
                let suffix = self
                    .add_text
                    .replace("%count%", &(tags.len() - limit).to_string());
                vec![format!("{}{}", tags[..limit].join(separator), suffix)]
            }
            TagPolicy::ReplaceAll => vec![self.replace_with.clone()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamingOptions {
    pub artist: TagNaming,
    pub copyright: TagNaming,
    pub character: TagNaming,
    pub species: TagNaming,
    pub general: TagNaming,
    pub meta: TagNaming,
    /// Replaces spaces inside token values when set
    pub blank_replacement: Option<String>,
}

impl Default for NamingOptions {
    fn default() -> Self {
        Self {
            artist: TagNaming::replacing("anonymous", "multiple artists"),
            copyright: TagNaming::replacing("misc", "crossover"),
            character: TagNaming::replacing("unknown", "group"),
            species: TagNaming::keeping("unknown"),
            general: TagNaming::keeping(""),
            meta: TagNaming::keeping("none"),
            blank_replacement: None,
        }
    }
}

impl NamingOptions {
    pub fn for_type(&self, tag_type: TagType) -> &TagNaming {
        match tag_type {
            TagType::Artist => &self.artist,
            TagType::Copyright => &self.copyright,
            TagType::Character => &self.character,
            TagType::Species => &self.species,
            TagType::Meta => &self.meta,
            TagType::General | TagType::Any => &self.general,
        }
    }
}
