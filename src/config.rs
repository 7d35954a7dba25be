//! Configuration management.
//!
//! Loads configuration from a TOML file with `ZFSBACKREST_` environment
//! variable overrides (`.` in a key path becomes `_`).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::repository::BackupKind;

/// Minimum S3 multipart part size (the S3 API rejects smaller parts).
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}")]
    Parse {
        path: String,
        #[source]
        source: Box<toml::de::Error>,
    },

    #[error("invalid value in environment variable {key}: {message}")]
    InvalidEnv { key: String, message: String },

    #[error("repository.s3.part_size must be at least {MIN_PART_SIZE} bytes, got {0}")]
    PartSizeTooSmall(u64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub repository: RepositoryConfig,

    /// Enables debug logging.
    #[serde(default)]
    pub debug: bool,

    #[serde(default)]
    pub upload_concurrency: UploadConcurrency,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Glob patterns selecting the datasets this repository manages.
    pub included_datasets: Vec<String>,

    pub s3: S3Config,

    pub expiry: ExpiryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub endpoint: String,
    pub bucket: String,
    pub key: String,
    pub secret: String,
    pub region: String,

    /// Multipart upload part size in bytes.
    #[serde(default = "default_part_size")]
    pub part_size: u64,

    /// Concurrent part uploads per snapshot stream.
    #[serde(default = "default_upload_threads")]
    pub upload_threads: usize,
}

/// Per-kind backup TTLs. A backup also expires when its parent expires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpiryConfig {
    #[serde(with = "humantime_serde")]
    pub full: Duration,
    #[serde(with = "humantime_serde")]
    pub diff: Duration,
    #[serde(with = "humantime_serde")]
    pub incr: Duration,
}

impl ExpiryConfig {
    pub fn for_kind(&self, kind: BackupKind) -> Duration {
        match kind {
            BackupKind::Full => self.full,
            BackupKind::Diff => self.diff,
            BackupKind::Incr => self.incr,
        }
    }
}

/// Bound on concurrent snapshot uploads, per backup kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConcurrency {
    #[serde(default = "default_concurrency")]
    pub full: usize,
    #[serde(default = "default_concurrency")]
    pub diff: usize,
    #[serde(default = "default_concurrency")]
    pub incr: usize,
}

impl UploadConcurrency {
    pub fn for_kind(&self, kind: BackupKind) -> usize {
        let n = match kind {
            BackupKind::Full => self.full,
            BackupKind::Diff => self.diff,
            BackupKind::Incr => self.incr,
        };
        n.max(1)
    }
}

impl Default for UploadConcurrency {
    fn default() -> Self {
        Self {
            full: default_concurrency(),
            diff: default_concurrency(),
            incr: default_concurrency(),
        }
    }
}

fn default_part_size() -> u64 {
    128 * 1024 * 1024 // 128 MiB
}

fn default_upload_threads() -> usize {
    1
}

fn default_concurrency() -> usize {
    1
}

impl Config {
    /// Load configuration from a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;

        let mut config: Config =
            toml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: display,
                source: Box::new(source),
            })?;

        config.apply_env_overrides()?;
        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.repository.s3.part_size < MIN_PART_SIZE {
            return Err(ConfigError::PartSizeTooSmall(self.repository.s3.part_size));
        }
        Ok(())
    }

    /// Apply `ZFSBACKREST_*` environment overrides for the documented keys.
    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(v) = env("ZFSBACKREST_DEBUG") {
            self.debug = parse_env("ZFSBACKREST_DEBUG", &v)?;
        }

        if let Some(v) = env("ZFSBACKREST_REPOSITORY_INCLUDED_DATASETS") {
            self.repository.included_datasets =
                v.split(',').map(|s| s.trim().to_string()).collect();
        }

        let s3 = &mut self.repository.s3;
        if let Some(v) = env("ZFSBACKREST_REPOSITORY_S3_ENDPOINT") {
            s3.endpoint = v;
        }
        if let Some(v) = env("ZFSBACKREST_REPOSITORY_S3_BUCKET") {
            s3.bucket = v;
        }
        if let Some(v) = env("ZFSBACKREST_REPOSITORY_S3_KEY") {
            s3.key = v;
        }
        if let Some(v) = env("ZFSBACKREST_REPOSITORY_S3_SECRET") {
            s3.secret = v;
        }
        if let Some(v) = env("ZFSBACKREST_REPOSITORY_S3_REGION") {
            s3.region = v;
        }
        if let Some(v) = env("ZFSBACKREST_REPOSITORY_S3_PART_SIZE") {
            s3.part_size = parse_env("ZFSBACKREST_REPOSITORY_S3_PART_SIZE", &v)?;
        }
        if let Some(v) = env("ZFSBACKREST_REPOSITORY_S3_UPLOAD_THREADS") {
            s3.upload_threads = parse_env("ZFSBACKREST_REPOSITORY_S3_UPLOAD_THREADS", &v)?;
        }

        let expiry = &mut self.repository.expiry;
        if let Some(v) = env("ZFSBACKREST_REPOSITORY_EXPIRY_FULL") {
            expiry.full = parse_duration_env("ZFSBACKREST_REPOSITORY_EXPIRY_FULL", &v)?;
        }
        if let Some(v) = env("ZFSBACKREST_REPOSITORY_EXPIRY_DIFF") {
            expiry.diff = parse_duration_env("ZFSBACKREST_REPOSITORY_EXPIRY_DIFF", &v)?;
        }
        if let Some(v) = env("ZFSBACKREST_REPOSITORY_EXPIRY_INCR") {
            expiry.incr = parse_duration_env("ZFSBACKREST_REPOSITORY_EXPIRY_INCR", &v)?;
        }

        let concurrency = &mut self.upload_concurrency;
        if let Some(v) = env("ZFSBACKREST_UPLOAD_CONCURRENCY_FULL") {
            concurrency.full = parse_env("ZFSBACKREST_UPLOAD_CONCURRENCY_FULL", &v)?;
        }
        if let Some(v) = env("ZFSBACKREST_UPLOAD_CONCURRENCY_DIFF") {
            concurrency.diff = parse_env("ZFSBACKREST_UPLOAD_CONCURRENCY_DIFF", &v)?;
        }
        if let Some(v) = env("ZFSBACKREST_UPLOAD_CONCURRENCY_INCR") {
            concurrency.incr = parse_env("ZFSBACKREST_UPLOAD_CONCURRENCY_INCR", &v)?;
        }

        Ok(())
    }
}

fn env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|err: T::Err| ConfigError::InvalidEnv {
        key: key.to_string(),
        message: err.to_string(),
    })
}

fn parse_duration_env(key: &str, value: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value).map_err(|err| ConfigError::InvalidEnv {
        key: key.to_string(),
        message: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
debug = true

[repository]
included_datasets = ["tank/home", "tank/srv/*"]

[repository.s3]
endpoint = "s3.example.com"
bucket = "backups"
key = "AKIA"
secret = "shhh"
region = "us-east-1"

[repository.expiry]
full = "336h"
diff = "120h"
incr = "24h"

[upload_concurrency]
full = 2
"#;

    #[test]
    fn test_parse_sample_config() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        file.flush().unwrap();

        let config = Config::load(file.path()).unwrap();
        assert!(config.debug);
        assert_eq!(
            config.repository.included_datasets,
            vec!["tank/home", "tank/srv/*"]
        );
        assert_eq!(config.repository.s3.bucket, "backups");
        assert_eq!(config.repository.s3.part_size, default_part_size());
        assert_eq!(config.repository.s3.upload_threads, 1);
        assert_eq!(
            config.repository.expiry.full,
            Duration::from_secs(336 * 3600)
        );
        assert_eq!(config.upload_concurrency.full, 2);
        assert_eq!(config.upload_concurrency.incr, 1);
    }

    #[test]
    fn test_expiry_for_kind() {
        let expiry = ExpiryConfig {
            full: Duration::from_secs(30),
            diff: Duration::from_secs(20),
            incr: Duration::from_secs(10),
        };
        assert_eq!(expiry.for_kind(BackupKind::Full), Duration::from_secs(30));
        assert_eq!(expiry.for_kind(BackupKind::Diff), Duration::from_secs(20));
        assert_eq!(expiry.for_kind(BackupKind::Incr), Duration::from_secs(10));
    }

    #[test]
    fn test_upload_concurrency_never_zero() {
        let concurrency = UploadConcurrency {
            full: 0,
            diff: 3,
            incr: 1,
        };
        assert_eq!(concurrency.for_kind(BackupKind::Full), 1);
        assert_eq!(concurrency.for_kind(BackupKind::Diff), 3);
    }

    #[test]
    fn test_part_size_too_small_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        let sample = SAMPLE.replace(
            "region = \"us-east-1\"",
            "region = \"us-east-1\"\npart_size = 1024",
        );
        file.write_all(sample.as_bytes()).unwrap();
        file.flush().unwrap();

        let err = Config::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::PartSizeTooSmall(1024)));
    }
}
