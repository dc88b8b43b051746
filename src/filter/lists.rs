//! Blacklist and whitelist classification
//!
//! ## Config file
//! The lists live in `filters.toml` inside the config directory. It is created from an
//! embedded sample the first time it is loaded:
//! ```toml
//! blacklist = ["guro", "rating:explicit -solo"]
//! whitelist = ["cat_ears"]
//! whitelist_trigger = "on_thumbnail"
//! hide_blacklisted = true
//! post_filter = ""
//!
//! [sites]
//! danbooru = ["comic"] # Only applied to Danbooru
//!
//! [custom_tokens]
//! monochrome = ["monochrome", "greyscale"]
//! ```
use std::collections::BTreeMap;
use std::path::Path;

use ahash::AHashMap;
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;

use super::{FilterContext, FilterError, FilterExpression, TagPattern};
use crate::record::ImageRecord;
use crate::sites::error::ExtractorError;

/// Default `filters.toml` content.
pub const DEFAULT_FILTERS_TOML: &str = include_str!("filters.toml");

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WhitelistTrigger {
    #[default]
    Never,
    OnThumbnail,
    OnImage,
}

/// Point of the record's life at which it is classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStage {
    /// The record arrived with a page
    Thumbnail,
    /// Its full image is about to be loaded
    Image,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Block(String),
    /// Whitelisted at its trigger point, overrides the blacklist
    AutoDownload,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub blacklist: Vec<String>,
    pub whitelist: Vec<String>,
    pub whitelist_trigger: WhitelistTrigger,
    pub hide_blacklisted: bool,
    pub post_filter: String,
    pub sites: BTreeMap<String, Vec<String>>,
    pub custom_tokens: BTreeMap<String, Vec<String>>,
}

impl FilterConfig {
    pub fn from_config(config_content: &str) -> Result<Self, toml::de::Error> {
        let deserialized = toml::from_str::<Self>(config_content)?;
        debug!(
            "Filter config decoded with {} global blacklist lines and {} site lists",
            deserialized.blacklist.len(),
            deserialized.sites.len()
        );
        Ok(deserialized)
    }

    /// Reads `path`, creating it from [`DEFAULT_FILTERS_TOML`] when missing.
    pub async fn load(path: &Path) -> Result<Self, ExtractorError> {
        if !path.exists() {
            debug!("Creating filter config at {}", path.display());
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            let mut file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
                .await?;
            file.write_all(DEFAULT_FILTERS_TOML.as_bytes()).await?;
            file.flush().await?;
        }
        let content = fs::read_to_string(path).await?;
        Ok(Self::from_config(&content)?)
    }

    pub fn context(&self) -> FilterContext {
        FilterContext {
            custom_tokens: self
                .custom_tokens
                .iter()
                .map(|(k, v)| (k.to_lowercase(), v.clone()))
                .collect::<AHashMap<_, _>>(),
            ..Default::default()
        }
    }
}

/// Compiled blacklist and whitelist of one site. Built once and reused across records.
#[derive(Debug, Clone)]
pub struct Classifier {
    blacklist: Vec<FilterExpression>,
    whitelist: Vec<TagPattern>,
    trigger: WhitelistTrigger,
    context: FilterContext,
}

impl Classifier {
    pub fn new(config: &FilterConfig, site: &str) -> Result<Self, FilterError> {
        let site_lines = config.sites.get(site).into_iter().flatten();
        let blacklist = config
            .blacklist
            .iter()
            .chain(site_lines)
            .filter(|l| !l.trim().is_empty())
            .map(|l| FilterExpression::parse(l))
            .collect::<Result<Vec<_>, _>>()?;
        let whitelist = config
            .whitelist
            .iter()
            .map(|t| TagPattern::new(t.trim()))
            .collect::<Result<Vec<_>, _>>()?;

        debug!(
            "Classifier for {} set up with {} blacklist lines and {} whitelisted tags",
            site,
            blacklist.len(),
            whitelist.len()
        );
        Ok(Self {
            blacklist,
            whitelist,
            trigger: config.whitelist_trigger,
            context: config.context(),
        })
    }

    pub fn context(&self) -> &FilterContext {
        &self.context
    }

    pub fn is_whitelisted(&self, record: &ImageRecord) -> bool {
        self.whitelist
            .iter()
            .any(|p| p.matches_any(record.tag_names()))
    }

    /// Returns the reason of the first blacklist line the record fully matches.
    pub fn blocked_by(&self, record: &ImageRecord) -> Option<String> {
        self.blacklist
            .iter()
            .find(|line| line.evaluate_with(record, &self.context).pass)
            .map(|line| format!("image contains \"{}\"", line))
    }

    pub fn classify(&self, record: &ImageRecord, stage: LoadStage) -> Verdict {
        let triggered = matches!(
            (self.trigger, stage),
            (WhitelistTrigger::OnThumbnail, LoadStage::Thumbnail)
                | (WhitelistTrigger::OnImage, LoadStage::Image)
        );
        if triggered && self.is_whitelisted(record) {
            return Verdict::AutoDownload;
        }
        self.blocked_by(record).map_or(Verdict::Allow, Verdict::Block)
    }

    /// Splits `records` into allowed ones and blocked `(record, reason)` pairs.
    pub fn partition(
        &self,
        records: Vec<ImageRecord>,
    ) -> (Vec<ImageRecord>, Vec<(ImageRecord, String)>) {
        let start = Instant::now();
        let mut allowed = Vec::with_capacity(records.len());
        let mut blocked = Vec::new();
        for record in records {
            match self.blocked_by(&record) {
                Some(reason) => blocked.push((record, reason)),
                None => allowed.push(record),
            }
        }
        debug!("Blacklist removed {} posts", blocked.len());
        debug!("Blacklist filtering took {:?}", start.elapsed());
        (allowed, blocked)
    }
}

#[cfg(test)]
mod test {
    use tempdir::TempDir;

    use super::*;
    use crate::filter::test::record;

    fn config(blacklist: &[&str], whitelist: &[&str], trigger: WhitelistTrigger) -> FilterConfig {
        FilterConfig {
            blacklist: blacklist.iter().map(|s| s.to_string()).collect(),
            whitelist: whitelist.iter().map(|s| s.to_string()).collect(),
            whitelist_trigger: trigger,
            ..Default::default()
        }
    }

    #[test]
    fn any_line_blocks() {
        let c = Classifier::new(&config(&["guro", "cat rating:e"], &[], WhitelistTrigger::Never), "x")
            .unwrap();
        assert_eq!(c.classify(&record(1, "cat", "s"), LoadStage::Thumbnail), Verdict::Allow);
        assert_eq!(
            c.classify(&record(2, "cat dog", "e"), LoadStage::Thumbnail),
            Verdict::Block("image contains \"cat rating:e\"".into())
        );
        assert!(matches!(
            c.classify(&record(3, "guro", "s"), LoadStage::Image),
            Verdict::Block(_)
        ));
    }

    #[test]
    fn atom_order_does_not_change_verdict() {
        let lines = ["cat -dog rating:explicit score:<10", "score:<10 rating:explicit -dog cat", "-dog cat score:<10 rating:explicit"];
        let records = [
            record(1, "cat", "e"),
            record(2, "cat dog", "e"),
            record(3, "cat", "s"),
            record(4, "bird", "e"),
        ];
        for rec in &records {
            let verdicts: Vec<bool> = lines
                .iter()
                .map(|l| {
                    Classifier::new(&config(&[l], &[], WhitelistTrigger::Never), "x")
                        .unwrap()
                        .blocked_by(rec)
                        .is_some()
                })
                .collect();
            assert!(verdicts.windows(2).all(|w| w[0] == w[1]), "record {}", rec.id);
        }
    }

    #[test]
    fn whitelist_overrides_at_trigger_only() {
        let c = Classifier::new(&config(&["cat"], &["*_ears"], WhitelistTrigger::OnThumbnail), "x")
            .unwrap();
        let rec = record(1, "cat cat_ears", "s");
        assert_eq!(c.classify(&rec, LoadStage::Thumbnail), Verdict::AutoDownload);
        assert!(matches!(c.classify(&rec, LoadStage::Image), Verdict::Block(_)));

        let never = Classifier::new(&config(&[], &["cat_ears"], WhitelistTrigger::Never), "x").unwrap();
        assert_eq!(never.classify(&rec, LoadStage::Thumbnail), Verdict::Allow);
    }

    #[test]
    fn site_lines_and_tokens() {
        let mut cfg = FilterConfig::from_config(DEFAULT_FILTERS_TOML).unwrap();
        cfg.sites.insert("danbooru".into(), vec!["%monochrome%".into()]);
        let rec = record(1, "greyscale", "s");
        assert!(Classifier::new(&cfg, "danbooru").unwrap().blocked_by(&rec).is_some());
        assert!(Classifier::new(&cfg, "gelbooru").unwrap().blocked_by(&rec).is_none());
    }

    #[test]
    fn partition_keeps_reasons() {
        let c = Classifier::new(&config(&["dog"], &[], WhitelistTrigger::Never), "x").unwrap();
        let (allowed, blocked) = c.partition(vec![record(1, "cat", "s"), record(2, "dog", "s")]);
        assert_eq!(allowed.len(), 1);
        assert_eq!(blocked[0].0.id, 2);
        assert_eq!(blocked[0].1, "image contains \"dog\"");
    }

    #[tokio::test]
    async fn creates_default_file() {
        let dir = TempDir::new("filters").unwrap();
        let path = dir.path().join("conf").join("filters.toml");
        let cfg = FilterConfig::load(&path).await.unwrap();
        assert!(path.exists());
        assert!(cfg.hide_blacklisted);
        assert_eq!(cfg.whitelist_trigger, WhitelistTrigger::Never);
        assert!(cfg.custom_tokens.contains_key("monochrome"));
    }

    #[test]
    fn ages_follow_the_clock_of_a_long_lived_classifier() {
        let c = Classifier::new(&config(&["age:>1s"], &[], WhitelistTrigger::Never), "x").unwrap();
        assert_eq!(c.context().now, None);

        let mut rec = record(1, "cat", "s");
        rec.date = Some(chrono::Utc::now());
        assert_eq!(c.blocked_by(&rec), None);

        std::thread::sleep(std::time::Duration::from_millis(1_500));
        assert!(c.blocked_by(&rec).is_some());
    }
}
