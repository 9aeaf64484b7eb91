//! Layered configuration for coffer.
//!
//! Priority (highest wins):
//! 1. Environment variables (`COFFER_` prefix, `__` between nested keys,
//!    e.g. `COFFER_STORAGE__BUCKET`)
//! 2. Config file (TOML, YAML or JSON, picked by extension)
//! 3. Defaults
//!
//! Loading and validation both happen before any transfer starts; a
//! [`Config`] that made it through [`Config::validate`] is safe to run with.

pub mod error;

use crate::error::{ErrorKind, Result};
use coffer_storage::UploadOptions;
use coffer_storage::backend::MIN_PART_SIZE;
use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

pub const ENV_PREFIX: &str = "COFFER_";
const MIB: u64 = 1024 * 1024;

/// Complete application configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub upload: UploadConfig,
    pub pipeline: PipelineConfig,
    /// Source roots backed up when no directory is given on the command line.
    pub sources: Vec<PathBuf>,
}

/// Connection to the remote container.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint for S3-compatible services (MinIO, R2, ...).
    pub endpoint: Option<String>,
    pub key_id: String,
    pub key_secret: String,
    /// Ceiling on concurrent requests issued by the client.
    pub max_requests: usize,
}
impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            region: "us-east-1".to_string(),
            endpoint: None,
            key_id: String::new(),
            key_secret: String::new(),
            max_requests: 100,
        }
    }
}
// Keep the secret out of logs.
impl fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageConfig")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("key_id", &self.key_id)
            .field("key_secret", &"<redacted>")
            .field("max_requests", &self.max_requests)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Bytes above which an upload is split into parts.
    pub single_upload_threshold: u64,
    pub part_size: u64,
    /// Parts uploaded concurrently per object.
    pub parallel_parts: usize,
}
impl Default for UploadConfig {
    fn default() -> Self {
        Self { single_upload_threshold: 32 * MIB, part_size: 8 * MIB, parallel_parts: 4 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Maximum number of queued, not yet processed, items.
    pub capacity: usize,
    /// Number of transfer workers.
    pub workers: usize,
}
impl Default for PipelineConfig {
    fn default() -> Self {
        Self { capacity: 64, workers: 8 }
    }
}

impl Config {
    /// Default config file location, e.g. `~/.config/coffer/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "coffer").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load configuration from defaults, a config file and the environment.
    ///
    /// An explicit `path` must exist. Without one, the
    /// [default location](Self::default_path) is used if a file is there.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        match path {
            Some(path) => {
                if !path.is_file() {
                    exn::bail!(ErrorKind::Invalid(format!("config file not found: {}", path.display())));
                }
                figment = Self::merge_file(figment, path)?;
            },
            None => {
                if let Some(default) = Self::default_path().filter(|p| p.is_file()) {
                    figment = Self::merge_file(figment, &default)?;
                }
            },
        }

        let config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .or_raise(|| ErrorKind::Load)?;
        tracing::debug!(config = ?config, "loaded configuration");
        Ok(config)
    }

    fn merge_file(figment: Figment, path: &Path) -> Result<Figment> {
        let extension = path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase);
        tracing::debug!(path = %path.display(), "reading configuration file");
        Ok(match extension.as_deref() {
            Some("toml") => figment.merge(Toml::file(path)),
            Some("yaml" | "yml") => figment.merge(Yaml::file(path)),
            Some("json") => figment.merge(Json::file(path)),
            _ => exn::bail!(ErrorKind::UnsupportedFormat(path.to_path_buf())),
        })
    }

    /// Check every setting the run depends on.
    pub fn validate(&self) -> Result<()> {
        fn require(ok: bool, message: &str) -> Result<()> {
            if !ok {
                exn::bail!(ErrorKind::Invalid(message.to_string()));
            }
            Ok(())
        }
        require(!self.storage.bucket.trim().is_empty(), "storage.bucket must be set")?;
        require(!self.storage.key_id.is_empty(), "storage.key_id must be set")?;
        require(!self.storage.key_secret.is_empty(), "storage.key_secret must be set")?;
        require(self.storage.max_requests > 0, "storage.max_requests must be positive")?;
        require(self.upload.single_upload_threshold > 0, "upload.single_upload_threshold must be positive")?;
        require(self.upload.part_size >= MIN_PART_SIZE, "upload.part_size must be at least 5 MiB")?;
        require(self.upload.parallel_parts > 0, "upload.parallel_parts must be positive")?;
        require(self.pipeline.capacity > 0, "pipeline.capacity must be positive")?;
        require(self.pipeline.workers > 0, "pipeline.workers must be positive")?;
        Ok(())
    }
}

impl UploadConfig {
    pub fn to_options(&self) -> Result<UploadOptions> {
        let parallel_parts = NonZeroUsize::new(self.parallel_parts)
            .ok_or_else(|| ErrorKind::Invalid("upload.parallel_parts must be positive".to_string()))?;
        Ok(UploadOptions {
            single_upload_threshold: self.single_upload_threshold,
            part_size: self.part_size,
            parallel_parts,
        })
    }
}
