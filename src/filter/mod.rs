//! Filter expressions over [`ImageRecord`]s.
//!
//! # Syntax
//! An expression is a whitespace separated list of atoms, all of which must hold:
//!
//! * `tag` / `-tag`: the record has (or lacks) the tag. `*` matches any run of characters.
//! * `meta:value`, `meta:>value`, `meta:<=value`, `meta:low..high`: compares a record field.
//!   `meta` is one of `id`, `md5`, `rating`, `score`, `source`, `width`, `height`,
//!   `filesize`, `date` and `age`. Meta atoms can be negated as well.
//! * `%token%` / `-%token%`: a custom token (a named list of tags) or a record field is
//!   present.
//!
//! Atoms are evaluated left to right and evaluation stops at the first one that fails, whose
//! description becomes the reason of the [`Evaluation`].
use std::cmp::Ordering;
use std::fmt::Display;

use ahash::AHashMap;
use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use thiserror::Error;

use crate::record::{rating::Rating, ImageRecord};

pub mod lists;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    #[error("Invalid value '{value}' for {meta}")]
    InvalidValue { meta: MetaKind, value: String },

    #[error("{meta} can only be compared for equality")]
    InvalidComparator { meta: MetaKind },

    #[error("Invalid wildcard pattern '{pattern}'")]
    InvalidPattern { pattern: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetaKind {
    Id,
    Md5,
    Rating,
    Score,
    Source,
    Width,
    Height,
    Filesize,
    Date,
    Age,
}

impl MetaKind {
    fn from_name(s: &str) -> Option<Self> {
        Some(match s.to_lowercase().as_str() {
            "id" => Self::Id,
            "md5" => Self::Md5,
            "rating" => Self::Rating,
            "score" => Self::Score,
            "source" => Self::Source,
            "width" => Self::Width,
            "height" => Self::Height,
            "filesize" => Self::Filesize,
            "date" => Self::Date,
            "age" => Self::Age,
            _ => return None,
        })
    }

    const fn equality_only(&self) -> bool {
        matches!(self, Self::Md5 | Self::Rating | Self::Source)
    }
}

impl Display for MetaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Id => "id",
            Self::Md5 => "md5",
            Self::Rating => "rating",
            Self::Score => "score",
            Self::Source => "source",
            Self::Width => "width",
            Self::Height => "height",
            Self::Filesize => "filesize",
            Self::Date => "date",
            Self::Age => "age",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetaValue {
    Int(i64),
    Text(String),
    Rating(Rating),
    Date(NaiveDate),
    /// Age in seconds
    Age(i64),
}

impl MetaValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) | (Self::Age(a), Self::Age(b)) => Some(a.cmp(b)),
            (Self::Date(a), Self::Date(b)) => Some(a.cmp(b)),
            (Self::Rating(a), Self::Rating(b)) => (a == b).then_some(Ordering::Equal),
            (Self::Text(a), Self::Text(b)) => Some(a.to_lowercase().cmp(&b.to_lowercase())),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Comparison {
    Eq(MetaValue),
    Lt(MetaValue),
    Gt(MetaValue),
    Le(MetaValue),
    Ge(MetaValue),
    /// Inclusive bounds, either side may be open
    Range(Option<MetaValue>, Option<MetaValue>),
    /// Text equality, with the same wildcards tags understand
    Matches(TagPattern),
}

/// A tag matcher, exact or with `*` wildcards.
#[derive(Debug, Clone)]
pub enum TagPattern {
    Exact(String),
    Wildcard(Regex),
}

impl PartialEq for TagPattern {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Exact(a), Self::Exact(b)) => a == b,
            (Self::Wildcard(a), Self::Wildcard(b)) => a.as_str() == b.as_str(),
            _ => false,
        }
    }
}

impl TagPattern {
    pub fn new(raw: &str) -> Result<Self, FilterError> {
        if !raw.contains('*') {
            return Ok(Self::Exact(raw.to_lowercase()));
        }
        let body = raw
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        Regex::new(&format!("(?i)^{}$", body))
            .map(Self::Wildcard)
            .map_err(|_| FilterError::InvalidPattern {
                pattern: raw.to_string(),
            })
    }

    pub fn matches(&self, tag: &str) -> bool {
        match self {
            Self::Exact(t) => t.eq_ignore_ascii_case(tag),
            Self::Wildcard(re) => re.is_match(tag),
        }
    }

    pub fn matches_any<'a>(&self, mut tags: impl Iterator<Item = &'a str>) -> bool {
        tags.any(|t| self.matches(t))
    }
}

#[derive(Debug, Clone)]
pub enum Atom {
    Tag {
        raw: String,
        pattern: TagPattern,
        negated: bool,
    },
    Meta {
        kind: MetaKind,
        comparison: Comparison,
        negated: bool,
    },
    Token {
        name: String,
        negated: bool,
    },
}

/// Values an expression can refer to besides the record itself.
#[derive(Debug, Clone)]
pub struct FilterContext {
    /// Token name to the tags that make it present
    pub custom_tokens: AHashMap<String, Vec<String>>,
    /// Reference time for `age:` atoms, the current time of each evaluation when unset
    pub now: Option<DateTime<Utc>>,
}

impl Default for FilterContext {
    fn default() -> Self {
        Self {
            custom_tokens: AHashMap::new(),
            now: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub pass: bool,
    /// Why the expression failed, empty when it passed
    pub reason: String,
}

impl Evaluation {
    fn passed() -> Self {
        Self {
            pass: true,
            reason: String::new(),
        }
    }

    fn failed(reason: String) -> Self {
        Self {
            pass: false,
            reason,
        }
    }
}

/// A parsed filter string. Pure: evaluating never changes it.
#[derive(Debug, Clone)]
pub struct FilterExpression {
    source: String,
    atoms: Vec<Atom>,
}

fn parse_size(raw: &str) -> Option<i64> {
    let lower = raw.to_lowercase();
    let (digits, factor) = if let Some(d) = lower.strip_suffix("gb") {
        (d, 1 << 30)
    } else if let Some(d) = lower.strip_suffix("mb") {
        (d, 1 << 20)
    } else if let Some(d) = lower.strip_suffix("kb") {
        (d, 1 << 10)
    } else {
        (lower.as_str(), 1)
    };
    digits
        .trim()
        .parse::<f64>()
        .ok()
        .map(|v| (v * f64::from(factor)) as i64)
}

fn parse_age(raw: &str) -> Option<i64> {
    let lower = raw.to_lowercase();
    let split = lower
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(lower.len());
    let (digits, unit) = lower.split_at(split);
    let amount: i64 = digits.parse().ok()?;
    let factor = match unit {
        "s" => 1,
        "mi" | "min" => 60,
        "h" => 3_600,
        "" | "d" => 86_400,
        "w" => 604_800,
        "mo" => 2_592_000,
        "y" => 31_536_000,
        _ => return None,
    };
    amount.checked_mul(factor)
}

fn parse_value(kind: MetaKind, raw: &str) -> Result<MetaValue, FilterError> {
    let invalid = || FilterError::InvalidValue {
        meta: kind,
        value: raw.to_string(),
    };
    match kind {
        MetaKind::Id | MetaKind::Score | MetaKind::Width | MetaKind::Height => {
            raw.parse::<i64>().map(MetaValue::Int).map_err(|_| invalid())
        }
        MetaKind::Filesize => parse_size(raw).map(MetaValue::Int).ok_or_else(invalid),
        MetaKind::Md5 | MetaKind::Source => Ok(MetaValue::Text(raw.to_string())),
        MetaKind::Rating => match Rating::from_rating_str(raw) {
            Rating::Unknown if !raw.eq_ignore_ascii_case("unknown") => Err(invalid()),
            rating => Ok(MetaValue::Rating(rating)),
        },
        MetaKind::Date => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .or_else(|_| NaiveDate::parse_from_str(raw, "%m/%d/%Y"))
            .map(MetaValue::Date)
            .map_err(|_| invalid()),
        MetaKind::Age => parse_age(raw).map(MetaValue::Age).ok_or_else(invalid),
    }
}

fn parse_comparison(kind: MetaKind, raw: &str) -> Result<Comparison, FilterError> {
    let optional = |s: &str| -> Result<Option<MetaValue>, FilterError> {
        if s.is_empty() {
            Ok(None)
        } else {
            parse_value(kind, s).map(Some)
        }
    };

    let comparison = if let Some(v) = raw.strip_prefix(">=") {
        Comparison::Ge(parse_value(kind, v)?)
    } else if let Some(v) = raw.strip_prefix("<=") {
        Comparison::Le(parse_value(kind, v)?)
    } else if let Some(v) = raw.strip_prefix('>') {
        Comparison::Gt(parse_value(kind, v)?)
    } else if let Some(v) = raw.strip_prefix('<') {
        Comparison::Lt(parse_value(kind, v)?)
    } else if let Some(v) = raw.strip_prefix('=') {
        Comparison::Eq(parse_value(kind, v)?)
    } else if let Some((low, high)) = raw.split_once("..") {
        Comparison::Range(optional(low)?, optional(high)?)
    } else {
        Comparison::Eq(parse_value(kind, raw)?)
    };

    match comparison {
        Comparison::Eq(MetaValue::Text(text)) => TagPattern::new(&text).map(Comparison::Matches),
        Comparison::Eq(_) => Ok(comparison),
        _ if kind.equality_only() => Err(FilterError::InvalidComparator { meta: kind }),
        _ => Ok(comparison),
    }
}

fn record_value(kind: MetaKind, record: &ImageRecord, now: DateTime<Utc>) -> Option<MetaValue> {
    let int = |v: Option<u64>| v.and_then(|v| i64::try_from(v).ok()).map(MetaValue::Int);
    match kind {
        MetaKind::Id => int(Some(record.id)),
        MetaKind::Md5 => record.md5.clone().map(MetaValue::Text),
        MetaKind::Rating => Some(MetaValue::Rating(record.rating)),
        MetaKind::Score => record.score.map(MetaValue::Int),
        MetaKind::Source => record.source.clone().map(MetaValue::Text),
        MetaKind::Width => int(record.width.map(u64::from)),
        MetaKind::Height => int(record.height.map(u64::from)),
        MetaKind::Filesize => int(record.filesize),
        MetaKind::Date => record.date.map(|d| MetaValue::Date(d.date_naive())),
        MetaKind::Age => record.date.map(|d| MetaValue::Age((now - d).num_seconds())),
    }
}

fn compare(actual: &MetaValue, comparison: &Comparison) -> bool {
    use Ordering::{Equal, Greater, Less};
    let cmp = |v: &MetaValue| actual.partial_cmp(v);
    match comparison {
        Comparison::Matches(pattern) => match actual {
            MetaValue::Text(text) => pattern.matches(text),
            _ => false,
        },
        Comparison::Eq(v) => cmp(v) == Some(Equal),
        Comparison::Lt(v) => cmp(v) == Some(Less),
        Comparison::Gt(v) => cmp(v) == Some(Greater),
        Comparison::Le(v) => matches!(cmp(v), Some(Less | Equal)),
        Comparison::Ge(v) => matches!(cmp(v), Some(Greater | Equal)),
        Comparison::Range(low, high) => {
            low.as_ref()
                .map_or(true, |l| matches!(cmp(l), Some(Greater | Equal)))
                && high
                    .as_ref()
                    .map_or(true, |h| matches!(cmp(h), Some(Less | Equal)))
        }
    }
}

/// Whether a `%name%` token is present on the record.
fn token_present(name: &str, record: &ImageRecord, ctx: &FilterContext) -> bool {
    if let Some(tags) = ctx.custom_tokens.get(name) {
        return tags.iter().any(|t| record.has_tag(t));
    }
    match name {
        "md5" => record.md5.is_some(),
        "author" => record.author.is_some(),
        "source" => record.source.is_some(),
        "score" => record.score.is_some(),
        "date" => record.date.is_some(),
        "width" | "height" => record.width.is_some() && record.height.is_some(),
        "filesize" => record.filesize.is_some(),
        "parent" => record.parent_id.is_some(),
        "children" => !record.children.is_empty(),
        other => crate::record::tags::TagType::NAMED
            .iter()
            .find(|t| t.name() == other)
            .is_some_and(|t| !record.tags_of(*t).is_empty()),
    }
}

impl Atom {
    pub fn parse(raw: &str) -> Result<Self, FilterError> {
        let (negated, body) = match raw.strip_prefix('-') {
            Some(rest) if !rest.is_empty() => (true, rest),
            _ => (false, raw),
        };

        if body.len() > 2 && body.starts_with('%') && body.ends_with('%') {
            return Ok(Self::Token {
                name: body[1..body.len() - 1].to_lowercase(),
                negated,
            });
        }

        if let Some((name, value)) = body.split_once(':') {
            if let Some(kind) = MetaKind::from_name(name) {
                return Ok(Self::Meta {
                    kind,
                    comparison: parse_comparison(kind, value)?,
                    negated,
                });
            }
        }

        Ok(Self::Tag {
            raw: body.to_string(),
            pattern: TagPattern::new(body)?,
            negated,
        })
    }

    /// Checks the atom, returning the failure description when it does not hold.
    fn check(
        &self,
        record: &ImageRecord,
        ctx: &FilterContext,
        now: DateTime<Utc>,
    ) -> Option<String> {
        match self {
            Self::Tag {
                raw,
                pattern,
                negated,
            } => {
                let present = pattern.matches_any(record.tag_names());
                match (present, negated) {
                    (true, false) | (false, true) => None,
                    (false, false) => Some(format!("image does not contain \"{}\"", raw)),
                    (true, true) => Some(format!("image contains \"{}\"", raw)),
                }
            }
            Self::Meta {
                kind,
                comparison,
                negated,
            } => {
                let matched = record_value(*kind, record, now)
                    .is_some_and(|actual| compare(&actual, comparison));
                match (matched, negated) {
                    (true, false) | (false, true) => None,
                    (false, false) => Some(format!("image's {} does not match", kind)),
                    (true, true) => Some(format!("image's {} matches", kind)),
                }
            }
            Self::Token { name, negated } => {
                let present = token_present(name, record, ctx);
                match (present, negated) {
                    (true, false) | (false, true) => None,
                    (false, false) => Some(format!("image does not have token \"%{}%\"", name)),
                    (true, true) => Some(format!("image has token \"%{}%\"", name)),
                }
            }
        }
    }
}

impl FilterExpression {
    pub fn parse(source: &str) -> Result<Self, FilterError> {
        let atoms = source
            .split_whitespace()
            .map(Atom::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            source: source.split_whitespace().collect::<Vec<_>>().join(" "),
            atoms,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }

    pub fn atoms(&self) -> &[Atom] {
        &self.atoms
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn evaluate(&self, record: &ImageRecord) -> Evaluation {
        self.evaluate_with(record, &FilterContext::default())
    }

    pub fn evaluate_with(&self, record: &ImageRecord, ctx: &FilterContext) -> Evaluation {
        let now = ctx.now.unwrap_or_else(Utc::now);
        for atom in &self.atoms {
            if let Some(reason) = atom.check(record, ctx, now) {
                return Evaluation::failed(reason);
            }
        }
        Evaluation::passed()
    }
}

impl Display for FilterExpression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

#[cfg(test)]
pub(crate) mod test {
    use chrono::TimeZone;

    use super::*;
    use crate::record::RecordDraft;

    pub(crate) fn record(id: u64, tags: &str, rating: &str) -> ImageRecord {
        let mut draft = RecordDraft::new();
        draft.set("id", id.to_string());
        draft.set("tags", tags);
        draft.set("rating", rating);
        draft.set("md5", format!("{:032x}", id));
        ImageRecord::from_draft("testbooru", "https://test.booru", draft).unwrap()
    }

    #[test]
    fn rating_mismatch_reason() {
        let expr = FilterExpression::parse("rating:safe -loli").unwrap();
        let eval = expr.evaluate(&record(1, "cat", "explicit"));
        assert!(!eval.pass);
        assert_eq!(eval.reason, "image's rating does not match");
    }

    #[test]
    fn short_circuit_left_to_right() {
        let rec = record(1, "cat loli", "explicit");
        let eval = FilterExpression::parse("-loli rating:safe").unwrap().evaluate(&rec);
        assert_eq!(eval.reason, "image contains \"loli\"");
        let eval = FilterExpression::parse("rating:safe -loli").unwrap().evaluate(&rec);
        assert_eq!(eval.reason, "image's rating does not match");
        let eval = FilterExpression::parse("dog").unwrap().evaluate(&rec);
        assert_eq!(eval.reason, "image does not contain \"dog\"");
    }

    #[test]
    fn empty_expression_passes() {
        let eval = FilterExpression::parse("   ").unwrap().evaluate(&record(1, "a", "s"));
        assert!(eval.pass);
        assert!(eval.reason.is_empty());
    }

    #[test]
    fn wildcards_and_case() {
        let rec = record(1, "Blue_Sky cat_ears", "s");
        assert!(FilterExpression::parse("*_ears blue_sky").unwrap().evaluate(&rec).pass);
        assert!(!FilterExpression::parse("-cat*").unwrap().evaluate(&rec).pass);
        assert!(FilterExpression::parse("re:zero*").is_ok());
    }

    #[test]
    fn numeric_comparisons_and_ranges() {
        let mut draft = RecordDraft::new();
        draft.set("id", "500");
        draft.set("score", "42");
        draft.set("width", "1920");
        draft.set("file_size", "3145728");
        let rec = ImageRecord::from_draft("x", "https://x", draft).unwrap();

        for (expr, expected) in [
            ("score:>40", true),
            ("score:<=41", false),
            ("score:10..50", true),
            ("score:..41", false),
            ("score:43..", false),
            ("id:=500", true),
            ("-id:500", false),
            ("width:>=1920", true),
            ("filesize:>2mb", true),
            ("filesize:<1MB", false),
            ("height:>0", false),
        ] {
            assert_eq!(
                FilterExpression::parse(expr).unwrap().evaluate(&rec).pass,
                expected,
                "{}",
                expr
            );
        }
    }

    #[test]
    fn dates_and_ages() {
        let mut draft = RecordDraft::new();
        draft.set("id", "1");
        draft.set("created_at", "2024-01-10T12:00:00Z");
        let rec = ImageRecord::from_draft("x", "https://x", draft).unwrap();
        let ctx = FilterContext {
            now: Some(Utc.with_ymd_and_hms(2024, 1, 12, 12, 0, 0).unwrap()),
            ..Default::default()
        };
        let eval = |s: &str| FilterExpression::parse(s).unwrap().evaluate_with(&rec, &ctx).pass;
        assert!(eval("date:>=2024-01-01"));
        assert!(eval("date:2024-01-10"));
        assert!(!eval("date:<01/01/2024"));
        assert!(eval("age:<3d"));
        assert!(!eval("age:<1d"));
        assert!(eval("age:1d..1w"));
        assert!(eval("age:>47h"));
        assert_eq!(parse_age("2mo"), Some(2 * 2_592_000));
        assert_eq!(parse_age("30mi"), Some(1_800));
    }

    #[test]
    fn oversized_age_is_invalid() {
        assert_eq!(parse_age("99999999999999y"), None);
        assert!(matches!(
            FilterExpression::parse("age:<99999999999999y"),
            Err(FilterError::InvalidValue { meta: MetaKind::Age, .. })
        ));
        assert!(FilterExpression::parse("age:..99999999999999999999d").is_err());
    }

    #[test]
    fn unset_now_follows_the_clock() {
        let mut draft = RecordDraft::new();
        draft.set("id", "1");
        draft.set("created_at", (Utc::now() - chrono::Duration::hours(2)).to_rfc3339());
        let rec = ImageRecord::from_draft("x", "https://x", draft).unwrap();
        let ctx = FilterContext::default();
        assert!(ctx.now.is_none());
        assert!(FilterExpression::parse("age:>1h").unwrap().evaluate_with(&rec, &ctx).pass);
        assert!(!FilterExpression::parse("age:<1h").unwrap().evaluate_with(&rec, &ctx).pass);
    }

    #[test]
    fn text_equality_is_compiled_once() {
        let expr = FilterExpression::parse("source:*pixiv*").unwrap();
        assert!(matches!(
            &expr.atoms()[0],
            Atom::Meta { comparison: Comparison::Matches(TagPattern::Wildcard(_)), .. }
        ));
        let mut draft = RecordDraft::new();
        draft.set("id", "1");
        draft.set("source", "https://www.PIXIV.net/artworks/1");
        let rec = ImageRecord::from_draft("x", "https://x", draft).unwrap();
        assert!(expr.evaluate(&rec).pass);
        assert!(FilterExpression::parse("md5:00000000000000000000000000000001")
            .unwrap()
            .evaluate(&record(1, "a", "s"))
            .pass);
    }

    #[test]
    fn tokens() {
        let rec = record(1, "greyscale cat", "s");
        let mut ctx = FilterContext::default();
        ctx.custom_tokens
            .insert("mono".into(), vec!["monochrome".into(), "greyscale".into()]);
        let eval = |s: &str| FilterExpression::parse(s).unwrap().evaluate_with(&rec, &ctx);
        assert!(eval("%mono%").pass);
        assert_eq!(eval("-%mono%").reason, "image has token \"%mono%\"");
        assert!(eval("%md5%").pass);
        assert!(!eval("%author%").pass);
    }

    #[test]
    fn invalid_atoms() {
        assert!(matches!(
            FilterExpression::parse("rating:>safe"),
            Err(FilterError::InvalidComparator { .. })
        ));
        assert!(matches!(
            FilterExpression::parse("score:lots"),
            Err(FilterError::InvalidValue { .. })
        ));
        assert!(FilterExpression::parse("rating:weird").is_err());
    }
}
