//! Drives one migration run end to end: access check, manifest, event log,
//! progress, batch upload, finalization and save.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tracing::{Instrument, info, info_span, warn};

use super::event_log::{EventLog, EventLogWriter, MigrationEvent};
use super::manifest::{Manifest, SharedManifest};
use super::models::AssetDescriptor;
use super::progress::{ProgressTracker, UploadProgress};
use super::uploader::BatchUploader;
use crate::context::MigrationContext;
use crate::error::{ExitStatus, MigrateError};
use crate::store::StoreError;

/// What a finished run produced.
#[derive(Debug)]
pub struct RunReport {
    pub manifest: Manifest,
    pub progress: UploadProgress,
    pub cancelled: bool,
    pub fatal: Option<StoreError>,
}

impl RunReport {
    pub fn exit_status(&self) -> ExitStatus {
        if self.fatal.is_some() {
            ExitStatus::Fatal
        } else {
            ExitStatus::from_summary(self.manifest.summary())
        }
    }
}

pub struct Orchestrator {
    ctx: MigrationContext,
}

impl Orchestrator {
    pub fn new(ctx: MigrationContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &MigrationContext {
        &self.ctx
    }

    /// Migrate `assets` and return the finalized, saved manifest.
    pub async fn run(
        &self,
        source_paths: Vec<PathBuf>,
        assets: Vec<AssetDescriptor>,
    ) -> Result<RunReport, MigrateError> {
        let started = Instant::now();
        let assets: Vec<Arc<AssetDescriptor>> = assets.into_iter().map(Arc::new).collect();
        let manifest = Manifest::create((*self.ctx.config).clone(), source_paths, &assets)?;
        let migration_id = manifest.migration_id();
        let span = info_span!("migration", migration_id = %migration_id);
        self.run_logged(assets, manifest, started)
            .instrument(span)
            .await
    }

    async fn run_logged(
        &self,
        assets: Vec<Arc<AssetDescriptor>>,
        manifest: Manifest,
        started: Instant,
    ) -> Result<RunReport, MigrateError> {
        let migration_id = manifest.migration_id();
        let total_bytes: u64 = assets.iter().map(|a| a.size_bytes).sum();
        let (events, writer) = self.open_event_log(migration_id);

        info!(
            bucket = self.ctx.config.bucket_name(),
            files = assets.len(),
            total_bytes,
            dry_run = self.ctx.config.dry_run(),
            "Migration started"
        );
        events.log(MigrationEvent::MigrationStarted {
            files_count: assets.len(),
            total_bytes,
        });

        let result = self.execute(&assets, manifest, &events, started).await;

        match &result {
            Ok(report) => {
                if let Some(e) = &report.fatal {
                    events.log(MigrationEvent::MigrationError {
                        error: e.to_string(),
                    });
                }
                events.log(MigrationEvent::MigrationCompleted {
                    summary: report.manifest.summary().clone(),
                });
            }
            Err(e) => events.log(MigrationEvent::MigrationError {
                error: e.to_string(),
            }),
        }

        drop(events);
        if let Some(writer) = writer {
            writer.close().await;
        }
        result
    }

    async fn execute(
        &self,
        assets: &[Arc<AssetDescriptor>],
        manifest: Manifest,
        events: &EventLog,
        started: Instant,
    ) -> Result<RunReport, MigrateError> {
        self.ctx.store.check_access().await?;

        let total_bytes = assets.iter().map(|a| a.size_bytes).sum();
        let shared = SharedManifest::with_checkpoints(
            manifest,
            &self.ctx.manifest_path,
            self.ctx.checkpoint_every,
        );
        let (progress, renderer) =
            ProgressTracker::start(assets.len(), total_bytes, self.ctx.show_progress);

        let uploader = BatchUploader::new(Arc::clone(&self.ctx.store), Arc::clone(&self.ctx.config))
            .with_progress(progress)
            .with_event_log(events.clone())
            .with_manifest(shared.clone())
            .with_cancellation(self.ctx.cancel.clone());

        let outcome = uploader.run(assets).await;
        drop(uploader);
        let progress = renderer.complete().await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                // Keep whatever was recorded so the run can be inspected
                let partial = shared.into_manifest().await;
                if let Err(save_err) = partial.save(&self.ctx.manifest_path).await {
                    warn!(error = %save_err, "Could not save partial manifest");
                }
                return Err(e.into());
            }
        };

        let mut manifest = shared.into_manifest().await;
        debug_assert_eq!(outcome.records.len(), manifest.len());
        manifest.finalize(started)?;
        manifest.save(&self.ctx.manifest_path).await?;

        let summary = manifest.summary();
        info!(
            migration_id = %manifest.migration_id(),
            succeeded = summary.success_count,
            skipped = summary.skipped_count,
            failed = summary.failed_count,
            bytes = summary.total_bytes_uploaded,
            duration_ms = summary.duration_ms,
            cancelled = outcome.cancelled,
            manifest = %self.ctx.manifest_path.display(),
            "Migration finished"
        );

        Ok(RunReport {
            manifest,
            progress,
            cancelled: outcome.cancelled,
            fatal: outcome.fatal,
        })
    }

    fn open_event_log(&self, migration_id: uuid::Uuid) -> (EventLog, Option<EventLogWriter>) {
        match &self.ctx.log_path {
            Some(path) => {
                let (log, writer) = EventLog::open(path.clone(), migration_id);
                (log, Some(writer))
            }
            None => (EventLog::disabled(), None),
        }
    }
}

/// Drop assets a previous run already delivered with the same content.
/// Returns the remaining assets and how many were dropped.
pub fn remaining_after(
    previous: &Manifest,
    assets: Vec<AssetDescriptor>,
) -> (Vec<AssetDescriptor>, usize) {
    let before = assets.len();
    let remaining: Vec<_> = assets.into_iter().filter(|a| !previous.covers(a)).collect();
    let done = before - remaining.len();
    (remaining, done)
}
