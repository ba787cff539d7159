//! Configuration file loading.

use clap::ValueEnum;
use coffer_archive::ArchiveConfig;
use coffer_store::LocalStoreConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

/// Settings read from the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CofferConfig {
    /// Repository directory
    pub repository: PathBuf,
    /// Log output format
    pub log_format: LogFormat,
    /// Archiving engine settings
    pub archive: ArchiveConfig,
    /// Local store settings
    pub store: LocalStoreConfig,
}

impl Default for CofferConfig {
    fn default() -> Self {
        Self {
            repository: PathBuf::from("coffer-repo"),
            log_format: LogFormat::Text,
            archive: ArchiveConfig::default(),
            store: LocalStoreConfig::default(),
        }
    }
}

impl CofferConfig {
    /// Read a `.toml` or `.json` configuration file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: CofferConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.archive.validate()?;
        Ok(config)
    }
}
