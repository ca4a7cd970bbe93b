//! Configuration loading.
//!
//! Settings are layered with `figment`: built-in defaults, then an optional
//! TOML file, then `MIGRATE_*` environment variables, then command-line
//! overrides. The result is validated once into an immutable
//! [`MigrationConfig`] snapshot that the core consumes.

use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::core::retry::RetryPolicy;

pub const DEFAULT_CONFIG_FILE: &str = "asset-migrate.toml";
pub const ENV_PREFIX: &str = "MIGRATE_";

pub const CONCURRENCY_RANGE: RangeInclusive<usize> = 1..=50;
pub const MAX_RETRIES_RANGE: RangeInclusive<u32> = 0..=10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(Box<figment::Error>),
    #[error("config file not found: {0}")]
    MissingFile(PathBuf),
    #[error("missing required setting `{0}`")]
    Missing(&'static str),
    #[error("`{name}` must be between {min} and {max}, got {value}")]
    OutOfRange {
        name: &'static str,
        min: u64,
        max: u64,
        value: u64,
    },
    #[error("invalid setting `{name}`: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Which remote store backend to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// S3-style HTTP object gateway
    Http,
    /// Directory-backed bucket on local disk
    Fs,
    /// In-memory store, nothing leaves the process
    Simulated,
}

/// Raw, layered application settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
    pub store: StoreKind,
    pub store_root: PathBuf,
    pub public_dir: PathBuf,
    pub sources: Vec<PathBuf>,
    pub concurrency: usize,
    pub max_retries: u32,
    pub skip_existing: bool,
    pub dry_run: bool,
    pub attempt_timeout_secs: u64,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Save a manifest snapshot after this many terminal records (0 disables)
    pub checkpoint_every: usize,
    pub manifest_path: PathBuf,
    pub log_path: PathBuf,
    pub verbose: bool,
    pub json_logs: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bucket: None,
            endpoint: None,
            access_token: None,
            public_url: None,
            store: StoreKind::Http,
            store_root: PathBuf::from(".migration/bucket"),
            public_dir: PathBuf::from("public"),
            sources: vec![PathBuf::from("public/imgs"), PathBuf::from("public/videos")],
            concurrency: 10,
            max_retries: 3,
            skip_existing: true,
            dry_run: false,
            attempt_timeout_secs: 300,
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 30_000,
            checkpoint_every: 50,
            manifest_path: PathBuf::from(".migration/manifest.json"),
            log_path: PathBuf::from(".migration/events.jsonl"),
            verbose: false,
            json_logs: false,
        }
    }
}

/// Command-line overrides. Absent fields leave lower layers untouched.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<StoreKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<PathBuf>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_existing: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dry_run: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verbose: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json_logs: Option<bool>,
}

impl AppConfig {
    /// Build the layered provider chain without extracting it.
    pub fn figment(config_file: Option<&Path>, overrides: &ConfigOverrides) -> Figment {
        let file = config_file
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX))
            .merge(Serialized::defaults(overrides))
    }

    /// Load settings. An explicitly named config file must exist; the
    /// default one is optional.
    pub fn load(config_file: Option<&Path>, overrides: &ConfigOverrides) -> Result<Self, ConfigError> {
        if let Some(path) = config_file {
            if !path.exists() {
                return Err(ConfigError::MissingFile(path.to_path_buf()));
            }
        }

        Self::figment(config_file, overrides)
            .extract()
            .map_err(|e| ConfigError::Load(Box::new(e)))
    }

    /// Validate into the immutable snapshot used by a migration run.
    pub fn migration_config(&self) -> Result<MigrationConfig, ConfigError> {
        let bucket = self
            .bucket
            .clone()
            .filter(|b| !b.trim().is_empty())
            .ok_or(ConfigError::Missing("bucket"))?;

        MigrationConfig::builder(bucket)
            .public_url(self.public_url.clone())
            .concurrency(self.concurrency)
            .max_retries(self.max_retries)
            .dry_run(self.dry_run)
            .skip_existing(self.skip_existing)
            .attempt_timeout(Duration::from_secs(self.attempt_timeout_secs))
            .retry_delays(
                Duration::from_millis(self.retry_base_delay_ms),
                Duration::from_millis(self.retry_max_delay_ms),
            )
            .build()
    }

    /// Access token with everything past the first few characters hidden.
    pub fn masked_token(&self) -> String {
        match &self.access_token {
            Some(token) if token.chars().count() > 8 => {
                format!("{}...", token.chars().take(8).collect::<String>())
            }
            Some(_) => "********".to_string(),
            None => "(none)".to_string(),
        }
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

/// Immutable settings snapshot for one migration run. Recorded verbatim in
/// the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationConfig {
    bucket_name: String,
    public_url: Option<String>,
    concurrency: usize,
    max_retries: u32,
    dry_run: bool,
    skip_existing: bool,
    attempt_timeout_ms: u64,
    retry_base_delay_ms: u64,
    retry_max_delay_ms: u64,
    created_at: DateTime<Utc>,
}

impl MigrationConfig {
    pub fn builder(bucket_name: impl Into<String>) -> MigrationConfigBuilder {
        MigrationConfigBuilder {
            bucket_name: bucket_name.into(),
            public_url: None,
            concurrency: 10,
            max_retries: 3,
            dry_run: false,
            skip_existing: true,
            attempt_timeout: Duration::from_secs(300),
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
        }
    }

    pub fn bucket_name(&self) -> &str {
        &self.bucket_name
    }

    pub fn public_url(&self) -> Option<&str> {
        self.public_url.as_deref()
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn skip_existing(&self) -> bool {
        self.skip_existing
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.retry_base_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
        )
    }
}

#[derive(Debug, Clone)]
pub struct MigrationConfigBuilder {
    bucket_name: String,
    public_url: Option<String>,
    concurrency: usize,
    max_retries: u32,
    dry_run: bool,
    skip_existing: bool,
    attempt_timeout: Duration,
    retry_base_delay: Duration,
    retry_max_delay: Duration,
}

impl MigrationConfigBuilder {
    pub fn public_url(mut self, url: Option<String>) -> Self {
        self.public_url = url;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.concurrency = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    pub fn dry_run(mut self, on: bool) -> Self {
        self.dry_run = on;
        self
    }

    pub fn skip_existing(mut self, on: bool) -> Self {
        self.skip_existing = on;
        self
    }

    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn retry_delays(mut self, base: Duration, max: Duration) -> Self {
        self.retry_base_delay = base;
        self.retry_max_delay = max;
        self
    }

    pub fn build(self) -> Result<MigrationConfig, ConfigError> {
        let bucket_name = self.bucket_name.trim().to_string();
        if bucket_name.is_empty() {
            return Err(ConfigError::Missing("bucket"));
        }
        if !looks_like_bucket_name(&bucket_name) {
            warn!(
                bucket = %bucket_name,
                "Bucket name looks unusual (expected 3-63 lowercase alphanumerics or hyphens)"
            );
        }

        if !CONCURRENCY_RANGE.contains(&self.concurrency) {
            return Err(ConfigError::OutOfRange {
                name: "concurrency",
                min: *CONCURRENCY_RANGE.start() as u64,
                max: *CONCURRENCY_RANGE.end() as u64,
                value: self.concurrency as u64,
            });
        }
        if !MAX_RETRIES_RANGE.contains(&self.max_retries) {
            return Err(ConfigError::OutOfRange {
                name: "max_retries",
                min: *MAX_RETRIES_RANGE.start() as u64,
                max: *MAX_RETRIES_RANGE.end() as u64,
                value: self.max_retries as u64,
            });
        }
        if self.attempt_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                name: "attempt_timeout_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.retry_max_delay < self.retry_base_delay {
            return Err(ConfigError::Invalid {
                name: "retry_max_delay_ms",
                reason: "must not be smaller than retry_base_delay_ms".to_string(),
            });
        }

        Ok(MigrationConfig {
            bucket_name,
            public_url: self.public_url,
            concurrency: self.concurrency,
            max_retries: self.max_retries,
            dry_run: self.dry_run,
            skip_existing: self.skip_existing,
            attempt_timeout_ms: self.attempt_timeout.as_millis() as u64,
            retry_base_delay_ms: self.retry_base_delay.as_millis() as u64,
            retry_max_delay_ms: self.retry_max_delay.as_millis() as u64,
            created_at: Utc::now(),
        })
    }
}

fn looks_like_bucket_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    (3..=63).contains(&bytes.len())
        && bytes
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
        && bytes.first() != Some(&b'-')
        && bytes.last() != Some(&b'-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn builder_rejects_out_of_range_concurrency() {
        let err = MigrationConfig::builder("media")
            .concurrency(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { name: "concurrency", .. }));

        let err = MigrationConfig::builder("media")
            .concurrency(51)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { value: 51, .. }));
    }

    #[test]
    fn builder_rejects_out_of_range_retries() {
        let err = MigrationConfig::builder("media")
            .max_retries(11)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { name: "max_retries", .. }));
    }

    #[test]
    fn builder_requires_bucket() {
        let err = MigrationConfig::builder("  ").build().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("bucket")));
    }

    #[test]
    fn builder_accepts_bounds() {
        let config = MigrationConfig::builder("media-assets")
            .concurrency(50)
            .max_retries(0)
            .dry_run(true)
            .build()
            .unwrap();

        assert_eq!(config.concurrency(), 50);
        assert_eq!(config.max_retries(), 0);
        assert!(config.dry_run());
        assert!(config.skip_existing());
        assert_eq!(config.retry_policy().max_attempts(), 1);
    }

    #[test]
    fn file_then_overrides_layering() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("migrate.toml");
        std::fs::write(
            &path,
            "bucket = \"from-file\"\nconcurrency = 4\nmax_retries = 2\nstore = \"fs\"\n",
        )
        .unwrap();

        let overrides = ConfigOverrides {
            concurrency: Some(8),
            dry_run: Some(true),
            ..Default::default()
        };
        let config = AppConfig::load(Some(&path), &overrides).unwrap();

        assert_eq!(config.bucket.as_deref(), Some("from-file"));
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.store, StoreKind::Fs);
        assert!(config.dry_run);
        assert!(config.skip_existing);
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("nope.toml");
        let err = AppConfig::load(Some(&path), &ConfigOverrides::default()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingFile(_)));
    }

    #[test]
    fn migration_config_requires_bucket() {
        let config = AppConfig::default();
        assert!(matches!(
            config.migration_config(),
            Err(ConfigError::Missing("bucket"))
        ));
    }

    #[test]
    fn masked_token_hides_secret() {
        let config = AppConfig {
            access_token: Some("abcdef0123456789".to_string()),
            ..Default::default()
        };
        assert_eq!(config.masked_token(), "abcdef01...");
    }

    #[test]
    fn masked_token_respects_char_boundaries() {
        let config = AppConfig {
            access_token: Some("aéééééééé".to_string()),
            ..Default::default()
        };
        assert_eq!(config.masked_token(), "aééééééé...");

        let short = AppConfig {
            access_token: Some("aéééé".to_string()),
            ..Default::default()
        };
        assert_eq!(short.masked_token(), "********");
    }

    #[test]
    fn default_config_round_trips_through_toml() {
        let config = AppConfig {
            bucket: Some("media".to_string()),
            ..Default::default()
        };
        let text = config.to_toml().unwrap();
        let parsed: AppConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
