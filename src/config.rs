use std::fs;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::error::SurgeError;

pub const DEFAULT_CONFIG_FILE: &str = "surgegauge.json";
pub const DEFAULT_DATABASE: &str = "surgegauge.sqlite";

/// Project file as written on disk; every field optional.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub harvest_dir: Option<String>,
    #[serde(default)]
    pub ingest_dir: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub database: Utf8PathBuf,
    pub harvest_dir: Utf8PathBuf,
    pub ingest_dir: Utf8PathBuf,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Resolves the project config. An explicit path must exist; the default
    /// `surgegauge.json` is optional and falls back to built-in defaults so
    /// fully flag-driven invocations need no file at all.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, SurgeError> {
        let config_path = Utf8PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_FILE));

        if !config_path.as_std_path().exists() {
            if path.is_some() {
                return Err(SurgeError::MissingConfig);
            }
            return Ok(Self::resolve_config(Config::default()));
        }

        let content = fs::read_to_string(config_path.as_std_path())
            .map_err(|_| SurgeError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| SurgeError::ConfigParse(err.to_string()))?;

        Ok(Self::resolve_config(config))
    }

    pub fn resolve_config(config: Config) -> ResolvedConfig {
        ResolvedConfig {
            schema_version: config.schema_version.unwrap_or(1),
            database: Utf8PathBuf::from(
                config.database.unwrap_or_else(|| DEFAULT_DATABASE.to_string()),
            ),
            harvest_dir: Utf8PathBuf::from(
                config.harvest_dir.unwrap_or_else(|| "harvest".to_string()),
            ),
            ingest_dir: Utf8PathBuf::from(
                config.ingest_dir.unwrap_or_else(|| "ingest".to_string()),
            ),
        }
    }
}
