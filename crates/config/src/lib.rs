//! Configuration for the tempo version index.
//!
//! Values are layered with [`figment`]: built-in defaults, then an optional
//! configuration file (TOML, YAML or JSON, chosen by extension), then
//! environment variables prefixed with `TEMPO_` where `__` separates nested
//! keys (`TEMPO_INDEX__CONCURRENCY=8`).
//!
//! ```toml
//! [index]
//! database = "/var/cache/tempo/usb-drive.db"
//! concurrency = 8
//!
//! [ingest]
//! progress_interval_secs = 30
//! hash_type = "blake3"
//! ```

pub mod error;

use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::{OptionExt, ResultExt};
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const ENV_PREFIX: &str = "TEMPO_";
const DATABASE_FILE: &str = "index.db";

/// Provider metadata keys that never make it into a version's attribute bag.
pub const DEFAULT_IGNORED_METADATA: &[&str] =
    &["Name", "IsDir", "MimeType", "ID", "OrigID", "Tier", "IsBucket", "Encrypted", "EncryptedPath"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub index: IndexConfig,
    pub ingest: IngestConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Location of the SQLite index. Defaults to the platform cache directory.
    pub database: Option<PathBuf>,
    /// Maximum number of concurrent remote reads.
    pub concurrency: usize,
}
impl Default for IndexConfig {
    fn default() -> Self {
        Self { database: None, concurrency: 4 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Log listing progress every this many seconds. `None` disables it.
    pub progress_interval_secs: Option<u64>,
    /// Provider metadata keys dropped during ingestion.
    pub ignored_metadata: Vec<String>,
    /// Checksum type kept from the destination listing. Every reported
    /// type is kept when unset.
    pub hash_type: Option<String>,
}
impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            progress_interval_secs: Some(60),
            ignored_metadata: DEFAULT_IGNORED_METADATA.iter().map(|key| key.to_string()).collect(),
            hash_type: None,
        }
    }
}

impl Config {
    /// Build the layered [`Figment`] without extracting it.
    pub fn figment(file: Option<&Path>) -> Result<Figment> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(file) = file {
            let extension = file.extension().and_then(|ext| ext.to_str()).unwrap_or_default().to_ascii_lowercase();
            figment = match extension.as_str() {
                "toml" => figment.merge(Toml::file(file)),
                "yaml" | "yml" => figment.merge(Yaml::file(file)),
                "json" => figment.merge(Json::file(file)),
                _ => exn::bail!(ErrorKind::UnsupportedFormat(file.display().to_string())),
            };
        }
        Ok(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Load and validate configuration from defaults, an optional file and
    /// the environment.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let config: Config = Self::figment(file)?.extract().or_raise(|| ErrorKind::Load)?;
        config.validate()?;
        tracing::debug!(concurrency = config.index.concurrency, "Loaded configuration");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.index.concurrency == 0 {
            exn::bail!(ErrorKind::Invalid("index.concurrency must be at least 1"));
        }
        if self.ingest.progress_interval_secs == Some(0) {
            exn::bail!(ErrorKind::Invalid("ingest.progress_interval_secs must be at least 1"));
        }
        Ok(())
    }

    /// Resolved location of the index database.
    pub fn database_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.index.database {
            return Ok(path.clone());
        }
        let dirs = ProjectDirs::from("", "", "tempo").ok_or_raise(|| ErrorKind::Invalid("no home directory"))?;
        Ok(dirs.cache_dir().join(DATABASE_FILE))
    }
}
