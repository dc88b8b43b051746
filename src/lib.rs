//! # Imageboard Fetcher
//!
//! Core engine of an imageboard (booru) browser. It searches sites with very different APIs
//! through one adapter, filters what comes back and downloads the results with
//! deduplication and configurable file naming.
//!
//! The pieces, bottom up:
//! - [`rate_limit::RateLimiter`] spaces requests per site and purpose.
//! - [`parser`] turns XML, JSON, scraped HTML and RSS answers into [`ImageRecord`]s.
//! - [`sites::adapter::SourceAdapter`] builds requests from site definitions and falls back
//!   from one source to the next.
//! - [`page::Page`] walks the result pages of a search.
//! - [`filter`] evaluates blacklists, whitelists and post-filters.
//! - [`queue::DownloadQueue`] downloads, names and deduplicates files.
//!
//! Front-ends hear about progress through [`events::EventListener`].
use std::env;
use std::fs::create_dir_all;
use std::io;
use std::path::PathBuf;

use directories::ProjectDirs;
use log::debug;

pub mod events;
pub mod filename;
pub mod filter;
pub(crate) mod macros;
pub mod page;
pub mod parser;
pub mod queue;
pub mod rate_limit;
pub mod record;
pub mod sites;

pub use events::{EventListener, LogType, SharedEventListener};
pub use filter::{FilterExpression, lists::Classifier, lists::FilterConfig};
pub use page::Page;
pub use queue::{DownloadQueue, QueueOptions};
pub use record::{rating::Rating, ImageRecord};
pub use sites::adapter::SourceAdapter;

/// Overrides the configuration directory when set.
pub const CONFIG_DIR_ENV: &str = "IBF_CONFIG_DIR";

/// Directory holding site definitions, filters, the md5 ledger and the auth cache.
///
/// It is created when missing.
pub fn config_dir() -> Result<PathBuf, io::Error> {
    let path = match env::var_os(CONFIG_DIR_ENV) {
        Some(dir) => PathBuf::from(dir),
        None => ProjectDirs::from("com", "FerrahWolfeh", "imageboard-fetcher")
            .map(|dirs| dirs.config_dir().to_path_buf())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no home directory found"))?,
    };

    if !path.exists() {
        debug!("Creating config directory {}", path.display());
        create_dir_all(&path)?;
    }
    Ok(path)
}

/// `sites.toml` inside [`config_dir`].
pub fn sites_file() -> Result<PathBuf, io::Error> {
    Ok(config_dir()?.join("sites.toml"))
}

/// `filters.toml` inside [`config_dir`].
pub fn filters_file() -> Result<PathBuf, io::Error> {
    Ok(config_dir()?.join("filters.toml"))
}

pub fn ledger_file() -> Result<PathBuf, io::Error> {
    Ok(config_dir()?.join("md5.jsonl"))
}

pub fn auth_cache_dir() -> Result<PathBuf, io::Error> {
    let dir = config_dir()?.join("auth");
    create_dir_all(&dir)?;
    Ok(dir)
}

#[cfg(test)]
mod test {
    use tempdir::TempDir;

    use super::*;

    #[test]
    fn config_dir_can_be_overridden() {
        let dir = TempDir::new("config").unwrap();
        let custom = dir.path().join("nested").join("ibf");
        env::set_var(CONFIG_DIR_ENV, &custom);

        assert_eq!(config_dir().unwrap(), custom);
        assert!(custom.exists());
        assert_eq!(filters_file().unwrap(), custom.join("filters.toml"));
        assert!(auth_cache_dir().unwrap().is_dir());

        env::remove_var(CONFIG_DIR_ENV);
    }
}
