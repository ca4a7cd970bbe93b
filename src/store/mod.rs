//! Remote object store adapters.
//!
//! The uploader only sees the [`RemoteStore`] trait. Backends differ in
//! where bytes land: an HTTP object gateway, a directory on disk, or an
//! in-memory simulation used by tests and rehearsals.

mod fs;
mod http;
mod simulated;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{AppConfig, ConfigError, StoreKind};
use crate::core::models::AssetDescriptor;

pub use fs::FsStore;
pub use http::HttpStore;
pub use simulated::{Behavior, SimulatedStore};

/// Media is published under content-addressed paths and never rewritten
/// in place.
pub const IMMUTABLE_CACHE_CONTROL: &str = "public, max-age=31536000, immutable";

/// Metadata header carrying the SHA-256 of the object body.
pub const CHECKSUM_HEADER: &str = "x-amz-meta-sha256";

/// Store failures, classified by what the caller should do about them.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Worth retrying: network hiccup, throttling, server error, timeout.
    #[error("{0}")]
    Transient(String),
    /// Retrying will not help: rejected key, local file gone, bad request.
    #[error("{0}")]
    Permanent(String),
    /// The store as a whole is unusable (unreachable, credentials refused).
    #[error("remote store unavailable: {0}")]
    Fatal(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// What a `head` call found at a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub etag: String,
    /// SHA-256 recorded at upload time, if the store kept it
    pub checksum: Option<String>,
    pub size: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct PutRequest {
    pub key: String,
    pub path: PathBuf,
    pub content_type: String,
    pub cache_control: String,
    pub checksum: String,
    pub size: u64,
}

impl PutRequest {
    pub fn for_asset(asset: &AssetDescriptor) -> Self {
        Self {
            key: asset.remote_key.clone(),
            path: asset.local_path.clone(),
            content_type: asset.mime_type.clone(),
            cache_control: IMMUTABLE_CACHE_CONTROL.to_string(),
            checksum: asset.checksum.clone(),
            size: asset.size_bytes,
        }
    }
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Confirm the bucket is reachable and writable before a run starts.
    async fn check_access(&self) -> Result<(), StoreError>;

    /// Look up an object. `Ok(None)` means the key does not exist.
    async fn head(&self, key: &str) -> Result<Option<RemoteObject>, StoreError>;

    /// Upload one object and return its ETag.
    async fn put(&self, req: &PutRequest) -> Result<String, StoreError>;
}

/// Construct the configured backend.
pub fn build_store(config: &AppConfig) -> Result<Arc<dyn RemoteStore>, ConfigError> {
    let bucket = config
        .bucket
        .as_deref()
        .filter(|b| !b.trim().is_empty())
        .ok_or(ConfigError::Missing("bucket"))?;

    match config.store {
        StoreKind::Http => {
            let endpoint = config
                .endpoint
                .as_deref()
                .ok_or(ConfigError::Missing("endpoint"))?;
            let store = HttpStore::new(endpoint, bucket, config.access_token.clone()).map_err(
                |e| ConfigError::Invalid {
                    name: "endpoint",
                    reason: e.to_string(),
                },
            )?;
            Ok(Arc::new(store))
        }
        StoreKind::Fs => Ok(Arc::new(FsStore::new(&config.store_root, bucket))),
        StoreKind::Simulated => Ok(Arc::new(SimulatedStore::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(StoreError::Transient("503".into()).is_retryable());
        assert!(!StoreError::Permanent("400".into()).is_retryable());
        assert!(!StoreError::Fatal("down".into()).is_retryable());
        assert!(StoreError::Fatal("down".into()).is_fatal());
    }

    #[test]
    fn http_store_needs_an_endpoint() {
        let config = AppConfig {
            bucket: Some("media".to_string()),
            store: StoreKind::Http,
            ..Default::default()
        };
        assert!(matches!(
            build_store(&config),
            Err(ConfigError::Missing("endpoint"))
        ));
    }

    #[test]
    fn simulated_store_builds_without_credentials() {
        let config = AppConfig {
            bucket: Some("media".to_string()),
            store: StoreKind::Simulated,
            ..Default::default()
        };
        assert!(build_store(&config).is_ok());
    }
}
