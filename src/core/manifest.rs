//! The migration manifest: every record of a run plus its metadata.
//!
//! A manifest is created with one `pending` record per asset, receives
//! terminal records as workers finish, and is finalized exactly once when
//! nothing is left in flight. The JSON form on disk is the audit trail and
//! the starting point for a resumed run.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};
use uuid::Uuid;

use super::discovery::checksums_match;
use super::models::{AssetDescriptor, MigrationRecord, MigrationSummary, RecordStatus, TransitionError};
use crate::config::MigrationConfig;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("duplicate remote key `{0}`")]
    DuplicateKey(String),
    #[error("record `{id}` is still {status}")]
    NotTerminal { id: String, status: RecordStatus },
    #[error("manifest {0} is already finalized")]
    AlreadyFinalized(Uuid),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("manifest I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("manifest {path} is not valid JSON: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode manifest: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    migration_id: Uuid,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    target_bucket: String,
    source_paths: Vec<PathBuf>,
    summary: MigrationSummary,
    records: BTreeMap<String, MigrationRecord>,
    config: MigrationConfig,
}

impl Manifest {
    /// Start a manifest with one `pending` record per asset.
    pub fn create(
        config: MigrationConfig,
        source_paths: Vec<PathBuf>,
        assets: &[Arc<AssetDescriptor>],
    ) -> Result<Self, ManifestError> {
        let mut records = BTreeMap::new();
        for asset in assets {
            let record = MigrationRecord::new(Arc::clone(asset));
            if records.insert(record.id.clone(), record).is_some() {
                return Err(ManifestError::DuplicateKey(asset.remote_key.clone()));
            }
        }

        Ok(Self {
            migration_id: Uuid::now_v7(),
            started_at: Utc::now(),
            completed_at: None,
            target_bucket: config.bucket_name().to_string(),
            source_paths,
            summary: MigrationSummary {
                total_files: records.len(),
                ..Default::default()
            },
            records,
            config,
        })
    }

    pub fn migration_id(&self) -> Uuid {
        self.migration_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn is_finalized(&self) -> bool {
        self.completed_at.is_some()
    }

    pub fn target_bucket(&self) -> &str {
        &self.target_bucket
    }

    pub fn source_paths(&self) -> &[PathBuf] {
        &self.source_paths
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub fn summary(&self) -> &MigrationSummary {
        &self.summary
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn record(&self, id: &str) -> Option<&MigrationRecord> {
        self.records.get(id)
    }

    pub fn records(&self) -> impl Iterator<Item = &MigrationRecord> {
        self.records.values()
    }

    /// Store a terminal record, replacing whatever was there for its id.
    pub fn update_record(&mut self, record: MigrationRecord) -> Result<(), ManifestError> {
        if self.is_finalized() {
            return Err(ManifestError::AlreadyFinalized(self.migration_id));
        }
        if !record.is_terminal() {
            return Err(ManifestError::NotTerminal {
                id: record.id,
                status: record.status,
            });
        }
        self.records.insert(record.id.clone(), record);
        Ok(())
    }

    /// Compute the summary and stamp completion. Every record must be
    /// terminal.
    pub fn finalize(&mut self, started: Instant) -> Result<&MigrationSummary, ManifestError> {
        if self.is_finalized() {
            return Err(ManifestError::AlreadyFinalized(self.migration_id));
        }
        if let Some(open) = self.records.values().find(|r| !r.is_terminal()) {
            return Err(ManifestError::NotTerminal {
                id: open.id.clone(),
                status: open.status,
            });
        }

        self.summary = MigrationSummary::from_records(self.records.values(), started.elapsed());
        debug_assert_eq!(
            self.summary.total_files,
            self.summary.success_count + self.summary.failed_count + self.summary.skipped_count
        );
        self.completed_at = Some(Utc::now());
        Ok(&self.summary)
    }

    /// Counts so far, for checkpoints of a run still in progress.
    fn refresh_running_summary(&mut self) {
        let elapsed = (Utc::now() - self.started_at).to_std().unwrap_or_default();
        self.summary = MigrationSummary::from_records(self.records.values(), elapsed);
    }

    pub fn records_with(&self, status: RecordStatus) -> Vec<&MigrationRecord> {
        self.records.values().filter(|r| r.status == status).collect()
    }

    pub fn failed_records(&self) -> Vec<&MigrationRecord> {
        self.records_with(RecordStatus::Failed)
    }

    pub fn successful_records(&self) -> Vec<&MigrationRecord> {
        self.records_with(RecordStatus::Success)
    }

    pub fn skipped_records(&self) -> Vec<&MigrationRecord> {
        self.records_with(RecordStatus::Skipped)
    }

    /// Keys a later run can treat as done.
    pub fn resumable_keys(&self) -> BTreeSet<&str> {
        self.records
            .values()
            .filter(|r| matches!(r.status, RecordStatus::Success | RecordStatus::Skipped))
            .map(|r| r.id.as_str())
            .collect()
    }

    /// Whether `asset` already reached the bucket in this run with the same
    /// content.
    pub fn covers(&self, asset: &AssetDescriptor) -> bool {
        self.records.get(&asset.remote_key).is_some_and(|r| {
            matches!(r.status, RecordStatus::Success | RecordStatus::Skipped)
                && checksums_match(&r.asset.checksum, &asset.checksum)
        })
    }

    /// Write pretty JSON through a temp file and rename, so a crash never
    /// leaves a half-written manifest behind.
    pub async fn save(&self, path: &Path) -> Result<(), ManifestError> {
        let io_err = |source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }

        let json = serde_json::to_vec_pretty(self)?;
        let mut tmp = path.as_os_str().to_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, json).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, path).await.map_err(io_err)?;
        debug!(path = %path.display(), records = self.records.len(), "Manifest saved");
        Ok(())
    }

    pub async fn load(path: &Path) -> Result<Self, ManifestError> {
        let bytes = tokio::fs::read(path).await.map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| ManifestError::Decode {
            path: path.to_path_buf(),
            source,
        })
    }
}

struct Slot {
    manifest: Manifest,
    checkpoint: Option<Checkpoint>,
}

struct Checkpoint {
    path: PathBuf,
    every: usize,
    since_last: usize,
}

/// The manifest as shared by concurrent workers.
///
/// All updates go through one async mutex. Optional checkpoints save a
/// snapshot every `every` updates; snapshots are written in the order they
/// were taken.
#[derive(Clone)]
pub struct SharedManifest {
    slot: Arc<Mutex<Slot>>,
    save_lock: Arc<Mutex<()>>,
}

impl SharedManifest {
    pub fn new(manifest: Manifest) -> Self {
        Self::build(manifest, None)
    }

    /// Like [`SharedManifest::new`], also saving a snapshot to `path` every
    /// `every` updates. `every == 0` disables snapshots.
    pub fn with_checkpoints(manifest: Manifest, path: impl Into<PathBuf>, every: usize) -> Self {
        let checkpoint = (every > 0).then(|| Checkpoint {
            path: path.into(),
            every,
            since_last: 0,
        });
        Self::build(manifest, checkpoint)
    }

    fn build(manifest: Manifest, checkpoint: Option<Checkpoint>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot {
                manifest,
                checkpoint,
            })),
            save_lock: Arc::new(Mutex::new(())),
        }
    }

    pub async fn update(&self, record: MigrationRecord) -> Result<(), ManifestError> {
        let pending_save: Option<(Manifest, PathBuf, OwnedMutexGuard<()>)> = {
            let mut slot = self.slot.lock().await;
            slot.manifest.update_record(record)?;

            let due = match slot.checkpoint.as_mut() {
                Some(cp) => {
                    cp.since_last += 1;
                    if cp.since_last >= cp.every {
                        cp.since_last = 0;
                        Some(cp.path.clone())
                    } else {
                        None
                    }
                }
                None => None,
            };

            match due {
                Some(path) => {
                    slot.manifest.refresh_running_summary();
                    let snapshot = slot.manifest.clone();
                    // Taken before releasing the slot so writes keep snapshot order
                    let guard = Arc::clone(&self.save_lock).lock_owned().await;
                    Some((snapshot, path, guard))
                }
                None => None,
            }
        };

        if let Some((snapshot, path, _guard)) = pending_save {
            if let Err(e) = snapshot.save(&path).await {
                warn!(path = %path.display(), error = %e, "Manifest checkpoint failed");
            }
        }
        Ok(())
    }

    /// Take the manifest back once workers are done with it.
    pub async fn into_manifest(self) -> Manifest {
        match Arc::try_unwrap(self.slot) {
            Ok(slot) => slot.into_inner().manifest,
            Err(shared) => shared.lock().await.manifest.clone(),
        }
    }
}
