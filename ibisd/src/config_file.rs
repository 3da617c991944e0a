//! The optional TOML config file. Anything set here is overridden by the
//! equivalent command line flag.

use std::fs::read_to_string;

use serde::Deserialize;

use crate::error::Error;

#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub node: NodeSection,
}

#[derive(Debug, Default, Deserialize)]
pub struct NodeSection {
    /// Target size of resident block files, in megabytes. Zero or absent
    /// means archival.
    pub prune_target_mb: Option<u64>,
    /// Script validation is skipped at or below this height.
    pub assume_valid_height: Option<u32>,
    /// Blocks validated and flushed per chunk.
    pub chunk_size: Option<u32>,
}

impl ConfigFile {
    pub fn from_file(path: &str) -> Result<Self, Error> {
        let contents = read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }
}
