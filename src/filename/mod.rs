//! Filename templates
//!
//! # Syntax
//! A template is literal text with `%token%` placeholders, `/` separates directories:
//! `%artist%/%copyright%/%md5%.%ext%`.
//!
//! Tokens accept options after a colon, separated by commas:
//! `%character:maxlength=30,separator=_%`, `%date:format=yyyy-MM-dd%`. `%%` is a literal `%`.
//!
//! | Token                                   | Value                                     |
//! |-----------------------------------------|-------------------------------------------|
//! | `id`, `md5`, `ext`, `rating`, `score`   | the record field (`md5` falls back to id) |
//! | `site` / `website`                      | site name                                 |
//! | `author`, `width`, `height`, `filesize` | the record field                          |
//! | `date`                                  | post date, `format` option                |
//! | `artist` ... `meta`                     | tags of the type, see [`TagNaming`]       |
//! | `all`                                   | every tag                                 |
//! | `search`                                | tags of the search                        |
//!
//! A template starting with `expr:` is a [`Script`] instead.
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::filter::{FilterContext, FilterError, FilterExpression};
use crate::record::{tags::TagType, ImageRecord};

pub mod naming;
pub mod script;
pub mod validate;

pub use naming::{NamingOptions, TagNaming, TagPolicy};
use script::{Script, ScriptError, Value};

const SCRIPT_PREFIX: &str = "expr:";
const FALLBACK_TEMPLATE: &str = "%md5%.%ext%";
/// Characters never allowed inside a token value, whatever the target filesystem.
const UNSAFE_CHARS: [char; 9] = ['\\', '/', ':', '*', '?', '"', '<', '>', '|'];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilenameError {
    #[error("Filename template is empty")]
    EmptyTemplate,

    #[error("Unknown token %{token}%")]
    UnknownToken { token: String },

    #[error("Invalid option '{option}' for token %{token}%")]
    InvalidOption { token: String, option: String },

    #[error("Unclosed token in template '{template}'")]
    UnclosedToken { template: String },

    #[error("Filename script failed: {source}")]
    Script {
        #[from]
        source: ScriptError,
    },

    #[error("Invalid filename condition: {source}")]
    Condition {
        #[from]
        source: FilterError,
    },

    #[error("Template produced an empty filename for post {id}")]
    EmptyName { id: u64 },
}

/// What to do with a record whose filename script fails to evaluate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptErrorPolicy {
    /// Fail the job
    #[default]
    Block,
    /// Skip the record
    Skip,
    /// Name the file `%md5%.%ext%`
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionalRule {
    /// Filter expression the record has to pass
    pub condition: String,
    pub template: String,
}

/// Everything the filename of a job depends on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilenameRules {
    pub template: String,
    /// Checked in order before falling back to `template`
    pub conditions: Vec<ConditionalRule>,
    pub naming: NamingOptions,
    pub script_error_policy: ScriptErrorPolicy,
}

impl Default for FilenameRules {
    fn default() -> Self {
        Self {
            template: String::from("%md5%.%ext%"),
            conditions: Vec::new(),
            naming: NamingOptions::default(),
            script_error_policy: ScriptErrorPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    Id,
    Md5,
    Ext,
    Site,
    Rating,
    Score,
    Author,
    Width,
    Height,
    Filesize,
    Date,
    Tags(TagType),
    All,
    Search,
}

impl TokenKind {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "id" => Self::Id,
            "md5" => Self::Md5,
            "ext" => Self::Ext,
            "site" | "website" => Self::Site,
            "rating" => Self::Rating,
            "score" => Self::Score,
            "author" => Self::Author,
            "width" => Self::Width,
            "height" => Self::Height,
            "filesize" => Self::Filesize,
            "date" => Self::Date,
            "all" => Self::All,
            "search" => Self::Search,
            other => Self::Tags(*TagType::NAMED.iter().find(|t| t.name() == other)?),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct TokenOptions {
    maxlength: Option<usize>,
    format: Option<String>,
    separator: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    Token { kind: TokenKind, options: TokenOptions },
}

#[derive(Debug, Clone, PartialEq)]
enum Body {
    Tokens(Vec<Part>),
    Script(Script),
}

/// A parsed filename template.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    raw: String,
    body: Body,
}

/// Translates `yyyy-MM-dd HH-mm-ss` style formats to strftime.
fn to_strftime(format: &str) -> String {
    const PATTERNS: [(&str, &str); 7] = [
        ("yyyy", "%Y"),
        ("yy", "%y"),
        ("MM", "%m"),
        ("dd", "%d"),
        ("HH", "%H"),
        ("mm", "%M"),
        ("ss", "%S"),
    ];
    let mut out = String::with_capacity(format.len() * 2);
    let mut rest = format;
    'outer: while let Some(c) = rest.chars().next() {
        for (pattern, spec) in PATTERNS {
            if let Some(after) = rest.strip_prefix(pattern) {
                out.push_str(spec);
                rest = after;
                continue 'outer;
            }
        }
        if c == '%' {
            out.push_str("%%");
        } else {
            out.push(c);
        }
        rest = &rest[c.len_utf8()..];
    }
    out
}

fn format_date(date: &DateTime<Utc>, format: Option<&str>) -> String {
    date.format(&to_strftime(format.unwrap_or("yyyy-MM-dd")))
        .to_string()
}

/// Makes a token value safe to use as (part of) a path component.
fn sanitize_value(value: &str, blank: Option<&str>) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| {
            if UNSAFE_CHARS.contains(&c) || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();
    let cleaned = match blank {
        Some(replacement) => cleaned.replace(' ', replacement),
        None => cleaned,
    };
    cleaned.trim().to_string()
}

fn truncate(value: String, max: Option<usize>) -> String {
    match max {
        Some(max) if value.chars().count() > max => value.chars().take(max).collect(),
        _ => value,
    }
}

fn parse_token(body: &str) -> Result<Part, FilenameError> {
    let (name, raw_options) = body.split_once(':').unwrap_or((body, ""));
    let name = name.trim().to_lowercase();
    let kind = TokenKind::from_name(&name).ok_or_else(|| FilenameError::UnknownToken {
        token: name.clone(),
    })?;

    let mut options = TokenOptions::default();
    for option in raw_options.split(',').filter(|o| !o.is_empty()) {
        let invalid = || FilenameError::InvalidOption {
            token: name.clone(),
            option: option.to_string(),
        };
        let (key, value) = option.split_once('=').ok_or_else(invalid)?;
        match key.trim() {
            "maxlength" => options.maxlength = Some(value.trim().parse().map_err(|_| invalid())?),
            "format" => options.format = Some(value.to_string()),
            "separator" => options.separator = Some(value.to_string()),
            _ => return Err(invalid()),
        }
    }
    Ok(Part::Token { kind, options })
}

impl Template {
    pub fn parse(raw: &str) -> Result<Self, FilenameError> {
        if raw.trim().is_empty() {
            return Err(FilenameError::EmptyTemplate);
        }
        if let Some(source) = raw.strip_prefix(SCRIPT_PREFIX) {
            return Ok(Self {
                raw: raw.to_string(),
                body: Body::Script(Script::parse(source)?),
            });
        }

        let mut parts = Vec::new();
        let mut rest = raw;
        while let Some(start) = rest.find('%') {
            if start > 0 {
                parts.push(Part::Literal(rest[..start].to_string()));
            }
            let after = &rest[start + 1..];
            let end = after.find('%').ok_or_else(|| FilenameError::UnclosedToken {
                template: raw.to_string(),
            })?;
            if end == 0 {
                parts.push(Part::Literal("%".to_string()));
            } else {
                parts.push(parse_token(&after[..end])?);
            }
            rest = &after[end + 1..];
        }
        if !rest.is_empty() {
            parts.push(Part::Literal(rest.to_string()));
        }
        Ok(Self {
            raw: raw.to_string(),
            body: Body::Tokens(parts),
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn is_script(&self) -> bool {
        matches!(self.body, Body::Script(_))
    }

    /// Literal text of the template, tokens excluded.
    pub(crate) fn literals(&self) -> Vec<&str> {
        match &self.body {
            Body::Tokens(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    Part::Literal(l) => Some(l.as_str()),
                    Part::Token { .. } => None,
                })
                .collect(),
            Body::Script(_) => Vec::new(),
        }
    }

    /// Whether the template references a token or script field by name.
    pub(crate) fn uses(&self, name: &str) -> bool {
        match &self.body {
            Body::Tokens(parts) => {
                let wanted = TokenKind::from_name(name);
                parts
                    .iter()
                    .any(|p| matches!(p, Part::Token { kind, .. } if Some(*kind) == wanted))
            }
            Body::Script(script) => script.fields().contains(&name),
        }
    }
}

fn token_values(
    kind: TokenKind,
    options: &TokenOptions,
    record: &ImageRecord,
    search: &[String],
    naming: &NamingOptions,
    fan_out: bool,
) -> Vec<String> {
    let number = |v: Option<String>| v.unwrap_or_default();
    let values = match kind {
        TokenKind::Id => vec![record.id.to_string()],
        TokenKind::Md5 => vec![record.name()],
        TokenKind::Ext => vec![record.extension.to_string()],
        TokenKind::Site => vec![record.site.clone()],
        TokenKind::Rating => vec![record.rating.to_string()],
        TokenKind::Score => vec![number(record.score.map(|s| s.to_string()))],
        TokenKind::Author => vec![record.author.clone().unwrap_or_default()],
        TokenKind::Width => vec![number(record.width.map(|s| s.to_string()))],
        TokenKind::Height => vec![number(record.height.map(|s| s.to_string()))],
        TokenKind::Filesize => vec![number(record.filesize.map(|s| s.to_string()))],
        TokenKind::Date => vec![record
            .date
            .as_ref()
            .map(|d| format_date(d, options.format.as_deref()))
            .unwrap_or_default()],
        TokenKind::Tags(tag_type) => naming.for_type(tag_type).apply(
            &record.tags_of(tag_type),
            options.separator.as_deref(),
            fan_out,
        ),
        TokenKind::All => vec![record
            .tag_names()
            .collect::<Vec<_>>()
            .join(options.separator.as_deref().unwrap_or(" "))],
        TokenKind::Search => vec![search.join(options.separator.as_deref().unwrap_or(" "))],
    };

    values
        .into_iter()
        .map(|v| {
            truncate(
                sanitize_value(&v, naming.blank_replacement.as_deref()),
                options.maxlength,
            )
        })
        .collect()
}

fn script_fields<'a>(
    record: &'a ImageRecord,
    search: &'a [String],
) -> impl Fn(&str) -> Option<Value> + 'a {
    move |name: &str| {
        let num = |v: Option<f64>| Some(v.map_or(Value::Str(String::new()), Value::Num));
        match name {
            "id" => Some(Value::Num(record.id as f64)),
            "md5" => Some(Value::Str(record.name())),
            "ext" => Some(Value::Str(record.extension.to_string())),
            "site" | "website" => Some(Value::Str(record.site.clone())),
            "rating" => Some(Value::Str(record.rating.to_string())),
            "score" => num(record.score.map(|s| s as f64)),
            "width" => num(record.width.map(f64::from)),
            "height" => num(record.height.map(f64::from)),
            "filesize" => num(record.filesize.map(|s| s as f64)),
            "author" => Some(Value::Str(record.author.clone().unwrap_or_default())),
            "date" => Some(Value::Str(
                record
                    .date
                    .as_ref()
                    .map(|d| format_date(d, None))
                    .unwrap_or_default(),
            )),
            "all" | "tags" => Some(Value::Str(record.tag_names().collect::<Vec<_>>().join(" "))),
            "search" => Some(Value::Str(search.join(" "))),
            other => TagType::NAMED
                .iter()
                .find(|t| t.name() == other)
                .map(|t| Value::Str(record.tags_of(*t).join(" "))),
        }
    }
}

/// Splits a rendered name into path components, dropping empty and relative ones.
fn to_path(rendered: &str, blank: Option<&str>) -> Option<PathBuf> {
    let path: PathBuf = rendered
        .split(['/', '\\'])
        .map(|c| sanitize_value(c, blank))
        .filter(|c| !c.is_empty() && c != "." && c != "..")
        .collect();
    (path.components().count() > 0).then_some(path)
}

/// Outcome of naming a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Relative destinations, the first one is downloaded and the rest are copies
    Paths(Vec<PathBuf>),
    Skip(String),
}

/// Compiled [`FilenameRules`].
#[derive(Debug, Clone)]
pub struct FilenameBuilder {
    default: Template,
    conditions: Vec<(FilterExpression, Template)>,
    naming: NamingOptions,
    policy: ScriptErrorPolicy,
    context: FilterContext,
}

impl FilenameBuilder {
    pub fn new(rules: &FilenameRules) -> Result<Self, FilenameError> {
        let conditions = rules
            .conditions
            .iter()
            .map(|rule| {
                Ok((
                    FilterExpression::parse(&rule.condition)?,
                    Template::parse(&rule.template)?,
                ))
            })
            .collect::<Result<Vec<_>, FilenameError>>()?;
        Ok(Self {
            default: Template::parse(&rules.template)?,
            conditions,
            naming: rules.naming.clone(),
            policy: rules.script_error_policy,
            context: FilterContext::default(),
        })
    }

    /// Sets the custom tokens conditions can refer to.
    pub fn with_context(mut self, context: FilterContext) -> Self {
        self.context = context;
        self
    }

    fn template_for(&self, record: &ImageRecord) -> &Template {
        self.conditions
            .iter()
            .find(|(condition, _)| condition.evaluate_with(record, &self.context).pass)
            .map_or(&self.default, |(_, template)| template)
    }

    fn render(&self, template: &Template, record: &ImageRecord, search: &[String]) -> Result<Vec<String>, ScriptError> {
        let parts = match &template.body {
            Body::Script(script) => {
                return script
                    .evaluate(&script_fields(record, search))
                    .map(|v| vec![v.to_string()])
            }
            Body::Tokens(parts) => parts,
        };

        let mut outputs = vec![String::new()];
        let mut fanned = false;
        for part in parts {
            match part {
                Part::Literal(text) => outputs.iter_mut().for_each(|o| o.push_str(text)),
                Part::Token { kind, options } => {
                    let values = token_values(*kind, options, record, search, &self.naming, !fanned);
                    if values.len() > 1 {
                        fanned = true;
                        outputs = outputs
                            .iter()
                            .flat_map(|o| values.iter().map(move |v| format!("{}{}", o, v)))
                            .collect();
                    } else if let Some(value) = values.first() {
                        outputs.iter_mut().for_each(|o| o.push_str(value));
                    }
                }
            }
        }
        Ok(outputs)
    }

    /// Names `record`, returning every destination it should be saved to.
    pub fn resolve(&self, record: &ImageRecord, search: &[String]) -> Result<Resolution, FilenameError> {
        let rendered = match self.render(self.template_for(record), record, search) {
            Ok(rendered) => rendered,
            Err(e) => match self.policy {
                ScriptErrorPolicy::Block => return Err(e.into()),
                ScriptErrorPolicy::Skip => {
                    debug!("Skipping post {}: {}", record.id, e);
                    return Ok(Resolution::Skip(e.to_string()));
                }
                ScriptErrorPolicy::Fallback => {
                    warn!("Filename script failed for post {} ({}), using fallback name", record.id, e);
                    let fallback = Template::parse(FALLBACK_TEMPLATE)?;
                    self.render(&fallback, record, search)?
                }
            },
        };

        let blank = self.naming.blank_replacement.as_deref();
        let mut paths: Vec<PathBuf> = Vec::with_capacity(rendered.len());
        for path in rendered.iter().filter_map(|r| to_path(r, blank)) {
            if !paths.contains(&path) {
                paths.push(path);
            }
        }
        if paths.is_empty() {
            return Err(FilenameError::EmptyName { id: record.id });
        }
        Ok(Resolution::Paths(paths))
    }
}
