use std::collections::HashMap;
use std::fs::{read_to_string, File};
use std::io::Write;
use std::path::Path;

use ahash::AHashMap;
use log::debug;
use serde::Deserialize;

use super::{error::ExtractorError, SiteConfig};

pub(crate) const SAMPLE_SITES_TOML: &str = include_str!("default_sites.toml");

#[derive(Debug, Deserialize)]
struct Config {
    sites: HashMap<String, SiteConfig>,
}

/// Parses a sites document, naming each site after its table key.
pub fn parse_sites(contents: &str) -> Result<AHashMap<String, SiteConfig>, ExtractorError> {
    let config: Config = toml::from_str(contents)?;

    let mut smap = AHashMap::with_capacity(config.sites.len());
    for (id, mut data) in config.sites {
        data.name = id.clone();
        data.validate()?;
        smap.insert(id, data);
    }
    Ok(smap)
}

/// Reads the site file at `path`, creating it from the built-in definitions if missing.
///
/// Sites found in the file are merged on top of `smap`, replacing entries with the same key.
pub fn load_sites_file(
    path: &Path,
    smap: &mut AHashMap<String, SiteConfig>,
) -> Result<(), ExtractorError> {
    if !path.exists() {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut sample_toml = File::create(path)?;
        sample_toml.write_all(SAMPLE_SITES_TOML.as_bytes())?;
    }

    let contents = read_to_string(path)?;
    smap.extend(parse_sites(&contents)?);

    debug!("Configured sites: {:?}", smap.keys().collect::<Vec<_>>());
    Ok(())
}
