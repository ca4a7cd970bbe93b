//! Durable JSON Lines event log for a migration run.
//!
//! Callers hand events to [`EventLog::log`], which only pushes onto a
//! channel. A background task owns the file and appends one line per
//! event, so disk latency never sits on the upload path. Write failures
//! are reported through `tracing` and otherwise ignored.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

use super::models::MigrationSummary;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MigrationEvent {
    #[serde(rename_all = "camelCase")]
    MigrationStarted { files_count: usize, total_bytes: u64 },
    #[serde(rename_all = "camelCase")]
    UploadStarted { remote_key: String, attempt: u32 },
    #[serde(rename_all = "camelCase")]
    UploadSuccess {
        remote_key: String,
        size_bytes: u64,
        duration_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    UploadFailed {
        remote_key: String,
        attempt: u32,
        error: String,
    },
    #[serde(rename_all = "camelCase")]
    UploadSkipped { remote_key: String, reason: String },
    MigrationCompleted { summary: MigrationSummary },
    MigrationError { error: String },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LogEntry<'a> {
    #[serde(flatten)]
    event: &'a MigrationEvent,
    timestamp: DateTime<Utc>,
    migration_id: Uuid,
}

struct Stamped {
    event: MigrationEvent,
    timestamp: DateTime<Utc>,
}

/// Cloneable sender side of the event log.
#[derive(Clone)]
pub struct EventLog {
    tx: Option<mpsc::UnboundedSender<Stamped>>,
}

/// Owns the writer task; `close` flushes and waits for it.
pub struct EventLogWriter {
    handle: JoinHandle<()>,
}

impl EventLog {
    /// Start a writer appending to `path` (parent directories are created).
    pub fn open(path: impl Into<PathBuf>, migration_id: Uuid) -> (Self, EventLogWriter) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(write_loop(path.into(), migration_id, rx));
        (Self { tx: Some(tx) }, EventLogWriter { handle })
    }

    /// A log that drops everything.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn log(&self, event: MigrationEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(Stamped {
                event,
                timestamp: Utc::now(),
            });
        }
    }
}

impl EventLogWriter {
    /// Wait until every event sent before all `EventLog` handles were
    /// dropped has been written.
    pub async fn close(self) {
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Event log writer task failed");
        }
    }
}

async fn write_loop(path: PathBuf, migration_id: Uuid, mut rx: mpsc::UnboundedReceiver<Stamped>) {
    let mut writer = match open_append(&path).await {
        Ok(file) => Some(BufWriter::new(file)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Cannot open event log, events will be dropped");
            None
        }
    };

    while let Some(stamped) = rx.recv().await {
        let Some(out) = writer.as_mut() else {
            continue;
        };

        let entry = LogEntry {
            event: &stamped.event,
            timestamp: stamped.timestamp,
            migration_id,
        };
        let mut line = match serde_json::to_vec(&entry) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Failed to encode event");
                continue;
            }
        };
        line.push(b'\n');

        if let Err(e) = out.write_all(&line).await {
            warn!(path = %path.display(), error = %e, "Failed to write event log");
        }
        // Flush when the queue is drained so the file stays current
        if rx.is_empty() {
            if let Err(e) = out.flush().await {
                warn!(path = %path.display(), error = %e, "Failed to flush event log");
            }
        }
    }

    if let Some(mut out) = writer {
        if let Err(e) = out.flush().await {
            warn!(path = %path.display(), error = %e, "Failed to flush event log");
        }
    }
}

async fn open_append(path: &Path) -> std::io::Result<tokio::fs::File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    OpenOptions::new().create(true).append(true).open(path).await
}
