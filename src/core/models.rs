use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Broad file type, used for reporting only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetCategory {
    Image,
    Video,
}

impl AssetCategory {
    /// Classify a file extension (without the dot). Returns `None` for
    /// extensions the migration does not carry.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" | "png" | "gif" | "webp" | "svg" => Some(Self::Image),
            "mp4" | "webm" => Some(Self::Video),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
        }
    }
}

/// One local file and the remote identity it migrates to.
///
/// Descriptors are produced by discovery and never mutated afterwards;
/// records share them through an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetDescriptor {
    pub local_path: PathBuf,
    pub remote_key: String,
    pub size_bytes: u64,
    pub mime_type: String,
    /// Lowercase hex SHA-256 of the file content
    pub checksum: String,
    pub category: AssetCategory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Pending,
    Uploading,
    Success,
    Failed,
    Skipped,
}

impl RecordStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Uploading => "uploading",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("record `{id}` cannot move from {from} to {to}")]
pub struct TransitionError {
    pub id: String,
    pub from: RecordStatus,
    pub to: RecordStatus,
}

/// Per-asset progress and outcome.
///
/// Status moves `pending -> uploading* -> success | failed | skipped`.
/// The transition methods enforce that shape; `skipped` is only reachable
/// from `pending`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRecord {
    pub id: String,
    pub asset: Arc<AssetDescriptor>,
    pub status: RecordStatus,
    pub upload_started_at: Option<DateTime<Utc>>,
    pub upload_completed_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub error_message: Option<String>,
    pub etag: Option<String>,
}

impl MigrationRecord {
    pub fn new(asset: Arc<AssetDescriptor>) -> Self {
        Self {
            id: asset.remote_key.clone(),
            asset,
            status: RecordStatus::Pending,
            upload_started_at: None,
            upload_completed_at: None,
            attempts: 0,
            error_message: None,
            etag: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Enter `uploading` for a new attempt. Stamps the start time on the
    /// first attempt only.
    pub fn begin_attempt(&mut self) -> Result<(), TransitionError> {
        self.check(
            matches!(self.status, RecordStatus::Pending | RecordStatus::Uploading),
            RecordStatus::Uploading,
        )?;
        if self.upload_started_at.is_none() {
            self.upload_started_at = Some(Utc::now());
        }
        self.attempts += 1;
        self.status = RecordStatus::Uploading;
        Ok(())
    }

    pub fn mark_success(&mut self, etag: String) -> Result<(), TransitionError> {
        self.check(self.status == RecordStatus::Uploading, RecordStatus::Success)?;
        self.status = RecordStatus::Success;
        self.upload_completed_at = Some(Utc::now());
        self.etag = Some(etag);
        self.error_message = None;
        Ok(())
    }

    /// Allowed from `uploading` (attempts exhausted or non-retryable error)
    /// and from `pending` (run cancelled before this asset started).
    pub fn mark_failed(&mut self, message: impl Into<String>) -> Result<(), TransitionError> {
        self.check(
            matches!(self.status, RecordStatus::Pending | RecordStatus::Uploading),
            RecordStatus::Failed,
        )?;
        self.status = RecordStatus::Failed;
        self.upload_completed_at = Some(Utc::now());
        self.error_message = Some(message.into());
        self.etag = None;
        Ok(())
    }

    pub fn mark_skipped(&mut self) -> Result<(), TransitionError> {
        self.check(self.status == RecordStatus::Pending, RecordStatus::Skipped)?;
        self.status = RecordStatus::Skipped;
        Ok(())
    }

    fn check(&self, allowed: bool, to: RecordStatus) -> Result<(), TransitionError> {
        if allowed {
            Ok(())
        } else {
            Err(TransitionError {
                id: self.id.clone(),
                from: self.status,
                to,
            })
        }
    }
}

/// Aggregate statistics over every record of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationSummary {
    pub total_files: usize,
    pub success_count: usize,
    pub failed_count: usize,
    pub skipped_count: usize,
    /// Sum of `size_bytes` over `success` records only
    pub total_bytes_uploaded: u64,
    pub duration_ms: u64,
    pub average_speed_bytes_per_sec: f64,
}

impl MigrationSummary {
    pub fn from_records<'a>(
        records: impl IntoIterator<Item = &'a MigrationRecord>,
        duration: Duration,
    ) -> Self {
        let mut summary = Self::default();

        for record in records {
            summary.total_files += 1;
            match record.status {
                RecordStatus::Success => {
                    summary.success_count += 1;
                    summary.total_bytes_uploaded += record.asset.size_bytes;
                }
                RecordStatus::Failed => summary.failed_count += 1,
                RecordStatus::Skipped => summary.skipped_count += 1,
                RecordStatus::Pending | RecordStatus::Uploading => {}
            }
        }

        summary.duration_ms = duration.as_millis() as u64;
        let secs = duration.as_secs_f64();
        if secs > 0.0 {
            summary.average_speed_bytes_per_sec = summary.total_bytes_uploaded as f64 / secs;
        }

        summary
    }

    pub fn has_failures(&self) -> bool {
        self.failed_count > 0
    }
}
