//! Configuration for the S3 upload store

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default part size: 8 MiB
pub const DEFAULT_PART_SIZE: u64 = 8 * 1024 * 1024;

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3StoreConfig {
    /// Access key for the object store
    pub access_key_id: String,

    /// Secret key for the object store
    pub secret_access_key: String,

    /// Bucket holding uploads and their sidecar objects
    pub bucket: String,

    /// Region (S3-compatible stores usually accept any value here)
    #[serde(default = "default_region")]
    pub region: String,

    /// Custom endpoint URL (for MinIO, DigitalOcean Spaces, LocalStack, ...)
    /// If not specified, uses the AWS default endpoint
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Use path-style URLs (required for MinIO, LocalStack)
    #[serde(default = "default_force_path_style")]
    pub force_path_style: bool,

    /// Target size of a single multipart part in bytes.
    /// S3 imposes a 5 MiB floor on non-final parts; anything below that
    /// makes the store discard every non-final chunk.
    #[serde(default = "default_part_size")]
    pub part_size: u64,

    /// Directory for chunk spill files. A unique per-store temporary
    /// directory is created when unset.
    #[serde(default)]
    pub tmp_dir: Option<PathBuf>,
}

// Default value functions for serde
fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_force_path_style() -> bool {
    true
}

fn default_part_size() -> u64 {
    DEFAULT_PART_SIZE
}

impl S3StoreConfig {
    /// Build a configuration with defaults for everything but the credentials
    /// and bucket.
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        bucket: impl Into<String>,
    ) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            bucket: bucket.into(),
            region: default_region(),
            endpoint: None,
            force_path_style: default_force_path_style(),
            part_size: default_part_size(),
            tmp_dir: None,
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: S3StoreConfig =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let access_key_id = require_env("TUSS3_ACCESS_KEY_ID")?;
        let secret_access_key = require_env("TUSS3_SECRET_ACCESS_KEY")?;
        let bucket = require_env("TUSS3_BUCKET")?;

        let mut config = Self::new(access_key_id, secret_access_key, bucket);

        if let Ok(region) = std::env::var("TUSS3_REGION") {
            config.region = region;
        }
        config.endpoint = std::env::var("TUSS3_ENDPOINT").ok();
        if let Ok(style) = std::env::var("TUSS3_PATH_STYLE") {
            config.force_path_style = style == "true" || style == "1";
        }
        if let Ok(size) = std::env::var("TUSS3_PART_SIZE") {
            config.part_size = size
                .parse()
                .map_err(|_| ConfigError::Parse(format!("invalid TUSS3_PART_SIZE: {}", size)))?;
        }
        if let Ok(dir) = std::env::var("TUSS3_TMP_DIR") {
            config.tmp_dir = Some(PathBuf::from(dir));
        }

        Ok(config)
    }

    /// Load configuration from file if one is configured, otherwise from
    /// environment variables
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(path) = std::env::var("TUSS3_CONFIG") {
            return Self::from_file(&path);
        }
        Self::from_env()
    }
}

fn require_env(name: &str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::Missing(name.to_string()))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Missing required setting: {0}")]
    Missing(String),
}
