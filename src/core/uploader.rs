//! Bounded-concurrency batch uploader.
//!
//! Each asset becomes one task holding a semaphore permit, so at most
//! `concurrency` uploads run at once. A task checks whether the object is
//! already present, then attempts the upload until it succeeds, hits a
//! non-retryable error, or runs out of attempts. Every terminal record is
//! reported to the progress tracker, the event log and the manifest.
//!
//! A fatal store error cancels the shared token: tasks not yet started
//! and tasks waiting out a backoff finish as failed, and in-flight
//! attempts are abandoned.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

use super::discovery::checksums_match;
use super::event_log::{EventLog, MigrationEvent};
use super::manifest::{ManifestError, SharedManifest};
use super::models::{AssetDescriptor, MigrationRecord};
use super::progress::ProgressTracker;
use crate::config::MigrationConfig;
use crate::store::{PutRequest, RemoteStore, StoreError};

/// ETag recorded for uploads that a dry run only pretended to do.
pub const DRY_RUN_ETAG: &str = "dry-run";

pub const CANCELLED_MESSAGE: &str = "migration cancelled";

/// Result of one batch.
#[derive(Debug)]
pub struct BatchOutcome {
    /// One terminal record per input asset, in input order
    pub records: Vec<MigrationRecord>,
    pub cancelled: bool,
    /// The store failure that aborted the run, if any
    pub fatal: Option<StoreError>,
}

#[derive(Clone)]
pub struct BatchUploader {
    store: Arc<dyn RemoteStore>,
    config: Arc<MigrationConfig>,
    progress: Option<ProgressTracker>,
    events: EventLog,
    manifest: Option<SharedManifest>,
    cancel: CancellationToken,
}

struct TaskOutput {
    index: usize,
    record: MigrationRecord,
    fatal: Option<StoreError>,
    error: Option<ManifestError>,
}

enum Existing {
    Present,
    Absent,
    Cancelled,
    Fatal(StoreError),
}

impl BatchUploader {
    pub fn new(store: Arc<dyn RemoteStore>, config: Arc<MigrationConfig>) -> Self {
        Self {
            store,
            config,
            progress: None,
            events: EventLog::disabled(),
            manifest: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressTracker) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_event_log(mut self, events: EventLog) -> Self {
        self.events = events;
        self
    }

    pub fn with_manifest(mut self, manifest: SharedManifest) -> Self {
        self.manifest = Some(manifest);
        self
    }

    /// Share an external token, e.g. one tripped by Ctrl-C.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Upload every asset and return one terminal record per asset.
    ///
    /// Only manifest bookkeeping errors are returned as `Err`; store
    /// failures end up in the records.
    pub async fn run(&self, assets: &[Arc<AssetDescriptor>]) -> Result<BatchOutcome, ManifestError> {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency()));
        let mut tasks = JoinSet::new();
        let mut slots: Vec<Option<MigrationRecord>> = vec![None; assets.len()];
        let mut fatal = None;
        let mut first_error = None;

        info!(
            files = assets.len(),
            concurrency = self.config.concurrency(),
            max_retries = self.config.max_retries(),
            dry_run = self.config.dry_run(),
            "Starting batch upload"
        );

        for (index, asset) in assets.iter().enumerate() {
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let worker = self.clone();
            let asset = Arc::clone(asset);
            tasks.spawn(
                async move {
                    let output = worker.process(index, asset).await;
                    drop(permit);
                    output
                }
                .in_current_span(),
            );

            // Collect finished tasks as we go so the set stays small
            while let Some(done) = tasks.try_join_next() {
                collect(done, &mut slots, &mut fatal, &mut first_error);
            }
        }

        while let Some(done) = tasks.join_next().await {
            collect(done, &mut slots, &mut fatal, &mut first_error);
        }

        // Anything without a record never got a permit before cancellation
        let mut records = Vec::with_capacity(assets.len());
        for (slot, asset) in slots.into_iter().zip(assets) {
            let record = match slot {
                Some(record) => record,
                None => {
                    let mut record = MigrationRecord::new(Arc::clone(asset));
                    if let Err(e) = record.mark_failed(CANCELLED_MESSAGE) {
                        first_error.get_or_insert(e.into());
                    }
                    if let Err(e) = self.finish(&record).await {
                        first_error.get_or_insert(e);
                    }
                    record
                }
            };
            records.push(record);
        }

        if let Some(e) = first_error {
            error!(error = %e, "Manifest bookkeeping failed during upload");
            return Err(e);
        }

        Ok(BatchOutcome {
            records,
            cancelled: self.cancel.is_cancelled(),
            fatal,
        })
    }

    async fn process(&self, index: usize, asset: Arc<AssetDescriptor>) -> TaskOutput {
        let mut record = MigrationRecord::new(Arc::clone(&asset));
        let (fatal, error) = match self.drive(&mut record).await {
            Ok(fatal) => (fatal, None),
            Err(e) => (None, Some(e)),
        };
        let error = match (error, self.finish(&record).await) {
            (Some(e), _) => Some(e),
            (None, Err(e)) => Some(e),
            (None, Ok(())) => None,
        };
        TaskOutput {
            index,
            record,
            fatal,
            error,
        }
    }

    /// Take one record from `pending` to a terminal state. Returns the
    /// fatal store error if this asset tripped one.
    async fn drive(&self, record: &mut MigrationRecord) -> Result<Option<StoreError>, ManifestError> {
        let key = record.id.clone();

        if self.cancel.is_cancelled() {
            record.mark_failed(CANCELLED_MESSAGE)?;
            return Ok(None);
        }

        if self.config.skip_existing() {
            match self.check_existing(&record.asset).await {
                Existing::Present => {
                    record.mark_skipped()?;
                    debug!(remote_key = %key, "Already uploaded, skipping");
                    self.events.log(MigrationEvent::UploadSkipped {
                        remote_key: key,
                        reason: "already exists with matching checksum".to_string(),
                    });
                    return Ok(None);
                }
                Existing::Absent => {}
                Existing::Cancelled => {
                    record.mark_failed(CANCELLED_MESSAGE)?;
                    return Ok(None);
                }
                Existing::Fatal(e) => {
                    self.abort(&e);
                    record.mark_failed(e.to_string())?;
                    return Ok(Some(e));
                }
            }
        }

        let request = PutRequest::for_asset(&record.asset);
        let policy = self.config.retry_policy();
        let started = Instant::now();

        loop {
            record.begin_attempt()?;
            let attempt = record.attempts;
            self.events.log(MigrationEvent::UploadStarted {
                remote_key: key.clone(),
                attempt,
            });

            let result = if self.config.dry_run() {
                Ok(DRY_RUN_ETAG.to_string())
            } else {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => {
                        record.mark_failed(CANCELLED_MESSAGE)?;
                        return Ok(None);
                    }
                    r = timeout(self.config.attempt_timeout(), self.store.put(&request)) => {
                        r.unwrap_or_else(|_| Err(StoreError::Transient(format!(
                            "upload timed out after {}s",
                            self.config.attempt_timeout().as_secs_f64()
                        ))))
                    }
                }
            };

            let e = match result {
                Ok(etag) => {
                    record.mark_success(etag)?;
                    let duration_ms = started.elapsed().as_millis() as u64;
                    debug!(remote_key = %key, attempt, duration_ms, "Upload complete");
                    self.events.log(MigrationEvent::UploadSuccess {
                        remote_key: key,
                        size_bytes: record.asset.size_bytes,
                        duration_ms,
                    });
                    return Ok(None);
                }
                Err(e) => e,
            };

            self.events.log(MigrationEvent::UploadFailed {
                remote_key: key.clone(),
                attempt,
                error: e.to_string(),
            });

            if e.is_fatal() {
                self.abort(&e);
                record.mark_failed(e.to_string())?;
                return Ok(Some(e));
            }
            if !e.is_retryable() || !policy.should_retry(attempt) {
                warn!(remote_key = %key, attempts = attempt, error = %e, "Upload failed");
                record.mark_failed(e.to_string())?;
                return Ok(None);
            }

            let delay = policy.delay(attempt);
            warn!(
                remote_key = %key,
                attempt,
                max_attempts = policy.max_attempts(),
                retry_in_ms = delay.as_millis() as u64,
                error = %e,
                "Upload failed, retrying"
            );
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    record.mark_failed(CANCELLED_MESSAGE)?;
                    return Ok(None);
                }
                _ = sleep(delay) => {}
            }
        }
    }

    /// Skip only when the remote copy carries the same checksum. Lookup
    /// failures other than fatal ones fall through to an upload.
    async fn check_existing(&self, asset: &AssetDescriptor) -> Existing {
        let lookup = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Existing::Cancelled,
            r = timeout(self.config.attempt_timeout(), self.store.head(&asset.remote_key)) => r,
        };

        match lookup {
            Ok(Ok(Some(remote))) => match remote.checksum.as_deref() {
                Some(sum) if checksums_match(sum, &asset.checksum) => Existing::Present,
                Some(_) => {
                    debug!(remote_key = %asset.remote_key, "Remote object differs, overwriting");
                    Existing::Absent
                }
                None => {
                    debug!(remote_key = %asset.remote_key, "Remote object has no checksum, overwriting");
                    Existing::Absent
                }
            },
            Ok(Ok(None)) => Existing::Absent,
            Ok(Err(e)) if e.is_fatal() => Existing::Fatal(e),
            Ok(Err(e)) => {
                warn!(remote_key = %asset.remote_key, error = %e, "Existence check failed, uploading anyway");
                Existing::Absent
            }
            Err(_) => {
                warn!(remote_key = %asset.remote_key, "Existence check timed out, uploading anyway");
                Existing::Absent
            }
        }
    }

    fn abort(&self, e: &StoreError) {
        if !self.cancel.is_cancelled() {
            error!(error = %e, "Fatal store error, cancelling remaining uploads");
            self.cancel.cancel();
        }
    }

    async fn finish(&self, record: &MigrationRecord) -> Result<(), ManifestError> {
        if let Some(progress) = &self.progress {
            progress.report(record);
        }
        if let Some(manifest) = &self.manifest {
            manifest.update(record.clone()).await?;
        }
        Ok(())
    }
}

fn collect(
    done: Result<TaskOutput, tokio::task::JoinError>,
    slots: &mut [Option<MigrationRecord>],
    fatal: &mut Option<StoreError>,
    first_error: &mut Option<ManifestError>,
) {
    match done {
        Ok(output) => {
            if let Some(e) = output.fatal {
                fatal.get_or_insert(e);
            }
            if let Some(e) = output.error {
                first_error.get_or_insert(e);
            }
            slots[output.index] = Some(output.record);
        }
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => warn!(error = %e, "Upload task ended without a result"),
    }
}
