use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::discovery::checksums_match;
use super::manifest::Manifest;
use super::models::RecordStatus;
use crate::store::{RemoteStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Pass,
    /// Every checked object is missing or different
    Fail,
    Partial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyKind {
    ChecksumMismatch,
    MissingFromRemote,
    /// The local source is gone; informational only
    MissingLocally,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Discrepancy {
    pub remote_key: String,
    pub kind: DiscrepancyKind,
    pub expected_checksum: String,
    pub actual_checksum: Option<String>,
    pub description: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    pub migration_id: Uuid,
    pub verified_at: DateTime<Utc>,
    pub status: VerificationStatus,
    pub verified_count: usize,
    pub mismatch_count: usize,
    pub missing_count: usize,
    pub discrepancies: Vec<Discrepancy>,
}

impl VerificationResult {
    pub fn passed(&self) -> bool {
        self.status == VerificationStatus::Pass
    }
}

struct Target {
    key: String,
    checksum: String,
    local_path: PathBuf,
}

/// Re-check every uploaded or skipped record of `manifest` against the
/// store, with at most `concurrency` lookups in flight.
///
/// A fatal store error stops verification and is returned as-is.
pub async fn verify_manifest(
    manifest: &Manifest,
    store: Arc<dyn RemoteStore>,
    concurrency: usize,
) -> Result<VerificationResult, StoreError> {
    if manifest.config().dry_run() {
        warn!(
            migration_id = %manifest.migration_id(),
            "Manifest comes from a dry run; objects were never uploaded"
        );
    }

    let targets: Vec<Target> = manifest
        .records()
        .filter(|r| matches!(r.status, RecordStatus::Success | RecordStatus::Skipped))
        .map(|r| Target {
            key: r.id.clone(),
            checksum: r.asset.checksum.clone(),
            local_path: r.asset.local_path.clone(),
        })
        .collect();

    info!(
        migration_id = %manifest.migration_id(),
        objects = targets.len(),
        "Starting verification"
    );

    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks = JoinSet::new();
    for target in targets {
        let store = Arc::clone(&store);
        let semaphore = Arc::clone(&semaphore);
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            check_one(store.as_ref(), target).await
        });
    }

    let mut verified_count = 0;
    let mut discrepancies = Vec::new();
    let mut fatal = None;

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok((ok, found))) => {
                if ok {
                    verified_count += 1;
                }
                discrepancies.extend(found);
            }
            Ok(Err(e)) => {
                if fatal.is_none() {
                    tasks.abort_all();
                }
                fatal.get_or_insert(e);
            }
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => {}
        }
    }

    if let Some(e) = fatal {
        return Err(e);
    }

    discrepancies.sort_by(|a: &Discrepancy, b: &Discrepancy| a.remote_key.cmp(&b.remote_key));
    let mismatch_count = count(&discrepancies, DiscrepancyKind::ChecksumMismatch);
    let missing_count = count(&discrepancies, DiscrepancyKind::MissingFromRemote);

    let status = if mismatch_count + missing_count == 0 {
        VerificationStatus::Pass
    } else if verified_count == 0 {
        VerificationStatus::Fail
    } else {
        VerificationStatus::Partial
    };

    info!(
        status = ?status,
        verified = verified_count,
        mismatched = mismatch_count,
        missing = missing_count,
        "Verification complete"
    );

    Ok(VerificationResult {
        migration_id: manifest.migration_id(),
        verified_at: Utc::now(),
        status,
        verified_count,
        mismatch_count,
        missing_count,
        discrepancies,
    })
}

fn count(found: &[Discrepancy], kind: DiscrepancyKind) -> usize {
    found.iter().filter(|d| d.kind == kind).count()
}

/// Returns whether the remote object checks out, plus any discrepancies.
async fn check_one(
    store: &dyn RemoteStore,
    target: Target,
) -> Result<(bool, Vec<Discrepancy>), StoreError> {
    let mut found = Vec::new();

    if !tokio::fs::try_exists(&target.local_path).await.unwrap_or(false) {
        found.push(Discrepancy {
            remote_key: target.key.clone(),
            kind: DiscrepancyKind::MissingLocally,
            expected_checksum: target.checksum.clone(),
            actual_checksum: None,
            description: format!("local file {} no longer exists", target.local_path.display()),
        });
    }

    let remote = match store.head(&target.key).await {
        Ok(remote) => remote,
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => {
            debug!(remote_key = %target.key, error = %e, "Lookup failed during verification");
            found.push(Discrepancy {
                remote_key: target.key.clone(),
                kind: DiscrepancyKind::MissingFromRemote,
                expected_checksum: target.checksum,
                actual_checksum: None,
                description: format!("lookup failed: {e}"),
            });
            return Ok((false, found));
        }
    };

    let ok = match remote {
        None => {
            found.push(Discrepancy {
                remote_key: target.key.clone(),
                kind: DiscrepancyKind::MissingFromRemote,
                expected_checksum: target.checksum,
                actual_checksum: None,
                description: "object not found in bucket".to_string(),
            });
            false
        }
        Some(object) => match object.checksum {
            Some(actual) if !checksums_match(&actual, &target.checksum) => {
                found.push(Discrepancy {
                    remote_key: target.key.clone(),
                    kind: DiscrepancyKind::ChecksumMismatch,
                    expected_checksum: target.checksum,
                    description: "remote checksum differs from the local file".to_string(),
                    actual_checksum: Some(actual),
                });
                false
            }
            // No stored checksum: existence is all that can be checked
            _ => true,
        },
    };

    Ok((ok, found))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MigrationConfig;
    use crate::core::models::{AssetCategory, AssetDescriptor, MigrationRecord};
    use crate::store::SimulatedStore;
    use std::time::Instant;
    use tempfile::tempdir;

    fn uploaded_manifest(dir: &std::path::Path, keys: &[&str]) -> Manifest {
        let assets: Vec<_> = keys
            .iter()
            .map(|key| {
                let local_path = dir.join(key);
                std::fs::write(&local_path, key.as_bytes()).unwrap();
                Arc::new(AssetDescriptor {
                    local_path,
                    remote_key: key.to_string(),
                    size_bytes: key.len() as u64,
                    mime_type: "image/png".to_string(),
                    checksum: format!("{key}-sum"),
                    category: AssetCategory::Image,
                })
            })
            .collect();

        let config = MigrationConfig::builder("media").build().unwrap();
        let mut manifest = Manifest::create(config, vec![], &assets).unwrap();
        for asset in &assets {
            let mut record = MigrationRecord::new(Arc::clone(asset));
            record.begin_attempt().unwrap();
            record.mark_success("\"e\"".to_string()).unwrap();
            manifest.update_record(record).unwrap();
        }
        manifest.finalize(Instant::now()).unwrap();
        manifest
    }

    #[tokio::test]
    async fn all_present_passes() {
        let temp = tempdir().unwrap();
        let manifest = uploaded_manifest(temp.path(), &["a.png", "b.png"]);
        let store = SimulatedStore::new();
        store.insert_object("a.png", "a.png-sum");
        store.insert_object("b.png", "B.PNG-SUM");

        let result = verify_manifest(&manifest, Arc::new(store), 4).await.unwrap();

        assert!(result.passed());
        assert_eq!(result.verified_count, 2);
        assert!(result.discrepancies.is_empty());
    }

    #[tokio::test]
    async fn missing_and_mismatched_objects_are_partial() {
        let temp = tempdir().unwrap();
        let manifest = uploaded_manifest(temp.path(), &["a.png", "b.png", "c.png"]);
        let store = SimulatedStore::new();
        store.insert_object("a.png", "a.png-sum");
        store.insert_object("b.png", "something-else");

        let result = verify_manifest(&manifest, Arc::new(store), 2).await.unwrap();

        assert_eq!(result.status, VerificationStatus::Partial);
        assert_eq!(result.verified_count, 1);
        assert_eq!(result.mismatch_count, 1);
        assert_eq!(result.missing_count, 1);
        assert_eq!(result.discrepancies[0].remote_key, "b.png");
        assert_eq!(result.discrepancies[0].kind, DiscrepancyKind::ChecksumMismatch);
        assert_eq!(
            result.discrepancies[0].actual_checksum.as_deref(),
            Some("something-else")
        );
        assert_eq!(result.discrepancies[1].kind, DiscrepancyKind::MissingFromRemote);
    }

    #[tokio::test]
    async fn empty_bucket_fails() {
        let temp = tempdir().unwrap();
        let manifest = uploaded_manifest(temp.path(), &["a.png"]);

        let result = verify_manifest(&manifest, Arc::new(SimulatedStore::new()), 1)
            .await
            .unwrap();

        assert_eq!(result.status, VerificationStatus::Fail);
    }

    #[tokio::test]
    async fn missing_local_file_is_informational() {
        let temp = tempdir().unwrap();
        let manifest = uploaded_manifest(temp.path(), &["a.png"]);
        std::fs::remove_file(temp.path().join("a.png")).unwrap();
        let store = SimulatedStore::new();
        store.insert_object("a.png", "a.png-sum");

        let result = verify_manifest(&manifest, Arc::new(store), 1).await.unwrap();

        assert!(result.passed());
        assert_eq!(result.discrepancies.len(), 1);
        assert_eq!(result.discrepancies[0].kind, DiscrepancyKind::MissingLocally);
    }
}
