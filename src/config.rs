use std::io::Read;
use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Backend selection and the opaque parameter each driver consumes.
/// The engine itself never interprets these values; they are handed to the
/// backend adapter as-is.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StorageConfig {
    #[serde(flatten)]
    pub driver: StorageDriver,

    /// Hierarchy delimiter handed to path-policy consumers.
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "storage_driver")]
pub enum StorageDriver {
    Row(RowDriverConfig),
    Tree(TreeDriverConfig),
    Maildir(MaildirDriverConfig),
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RowDriverConfig {
    pub connection_string: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TreeDriverConfig {
    pub root_node: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MaildirDriverConfig {
    pub root: PathBuf,
}

pub fn read_config(config_file: PathBuf) -> Result<StorageConfig> {
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .open(config_file.as_path())?;

    let mut config = String::new();
    file.read_to_string(&mut config)?;

    Ok(toml::from_str(&config)?)
}

fn default_delimiter() -> char {
    '.'
}
