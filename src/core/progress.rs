//! Live progress for a migration run.
//!
//! The tracker is a pure observer. Workers call [`ProgressTracker::report`],
//! which never blocks: it pushes the terminal record's outcome onto an
//! unbounded channel drained by a render task. That task owns the
//! counters and draws the terminal bar, or throttled log lines when the bar
//! is off.

use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::models::{MigrationRecord, RecordStatus};
use crate::logging::LogThrottle;

const LOG_INTERVAL: Duration = Duration::from_secs(2);

/// Point-in-time view of a run's progress.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgress {
    pub current_file: Option<String>,
    pub completed: usize,
    pub total: usize,
    pub percent_complete: u8,
    pub bytes_uploaded: u64,
    pub total_bytes: u64,
    pub current_speed_bytes_per_sec: f64,
    pub estimated_seconds_remaining: Option<u64>,
}

/// Counters and derived rates, independent of how they are shown.
#[derive(Debug, Clone)]
pub struct ProgressState {
    progress: UploadProgress,
    /// Bytes accounted for by any terminal outcome; drives the ETA
    bytes_settled: u64,
}

impl ProgressState {
    pub fn new(total_files: usize, total_bytes: u64) -> Self {
        Self {
            progress: UploadProgress {
                total: total_files,
                total_bytes,
                ..Default::default()
            },
            bytes_settled: 0,
        }
    }

    /// Fold in one terminal outcome observed `elapsed` after the start.
    pub fn apply(&mut self, key: &str, status: RecordStatus, size: u64, elapsed: Duration) {
        let p = &mut self.progress;
        p.current_file = Some(key.to_string());
        p.completed += 1;
        if status == RecordStatus::Success {
            p.bytes_uploaded += size;
        }
        self.bytes_settled += size;

        p.percent_complete = if p.total == 0 {
            100
        } else {
            ((p.completed * 100) / p.total).min(100) as u8
        };

        let secs = elapsed.as_secs_f64();
        p.current_speed_bytes_per_sec = if secs > 0.0 {
            p.bytes_uploaded as f64 / secs
        } else {
            0.0
        };

        // Settled bytes, not uploaded ones: skipped and failed files also
        // shrink the remaining work.
        let remaining = p.total_bytes.saturating_sub(self.bytes_settled);
        let settle_rate = if secs > 0.0 {
            self.bytes_settled as f64 / secs
        } else {
            0.0
        };
        p.estimated_seconds_remaining = if remaining == 0 {
            Some(0)
        } else if settle_rate > 0.0 {
            Some((remaining as f64 / settle_rate).ceil() as u64)
        } else {
            None
        };
    }

    pub fn snapshot(&self) -> &UploadProgress {
        &self.progress
    }
}

struct Completion {
    key: String,
    status: RecordStatus,
    size: u64,
}

/// Cloneable handle feeding the render task.
#[derive(Clone)]
pub struct ProgressTracker {
    tx: mpsc::UnboundedSender<Completion>,
}

/// Owns the render task. Obtained with the tracker from [`ProgressTracker::start`].
pub struct ProgressRenderer {
    handle: JoinHandle<UploadProgress>,
    close: CancellationToken,
}

impl ProgressTracker {
    /// Spawn the render task. `show_bar` draws an `indicatif` bar on stderr;
    /// otherwise progress goes to the log at a throttled rate.
    pub fn start(total_files: usize, total_bytes: u64, show_bar: bool) -> (Self, ProgressRenderer) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = ProgressState::new(total_files, total_bytes);
        let close = CancellationToken::new();

        let bar = if show_bar {
            Some(make_bar(total_files as u64))
        } else {
            None
        };
        let handle = tokio::spawn(render_loop(state, rx, close.clone(), bar));

        (Self { tx }, ProgressRenderer { handle, close })
    }

    /// Record one terminal outcome. Non-terminal records are ignored.
    pub fn report(&self, record: &MigrationRecord) {
        if !record.is_terminal() {
            return;
        }
        let _ = self.tx.send(Completion {
            key: record.id.clone(),
            status: record.status,
            size: record.asset.size_bytes,
        });
    }
}

impl ProgressRenderer {
    /// Stop rendering and return the final snapshot. Reports already queued
    /// are folded in; later ones are dropped.
    pub async fn complete(self) -> UploadProgress {
        self.close.cancel();
        match self.handle.await {
            Ok(progress) => progress,
            Err(e) => {
                warn!(error = %e, "Progress renderer failed");
                UploadProgress::default()
            }
        }
    }
}

async fn render_loop(
    mut state: ProgressState,
    mut rx: mpsc::UnboundedReceiver<Completion>,
    close: CancellationToken,
    bar: Option<ProgressBar>,
) -> UploadProgress {
    let started = Instant::now();
    let mut throttle = LogThrottle::new(LOG_INTERVAL);

    loop {
        let done = tokio::select! {
            biased;
            msg = rx.recv() => match msg {
                Some(done) => done,
                None => break,
            },
            _ = close.cancelled() => break,
        };
        render(&mut state, done, started, &mut throttle, bar.as_ref());
    }

    rx.close();
    while let Ok(done) = rx.try_recv() {
        render(&mut state, done, started, &mut throttle, bar.as_ref());
    }

    if let Some(bar) = bar {
        bar.finish_and_clear();
    }
    state.snapshot().clone()
}

fn render(
    state: &mut ProgressState,
    done: Completion,
    started: Instant,
    throttle: &mut LogThrottle,
    bar: Option<&ProgressBar>,
) {
    state.apply(&done.key, done.status, done.size, started.elapsed());
    let p = state.snapshot();

    match bar {
        Some(bar) => {
            bar.set_position(p.completed as u64);
            bar.set_message(format!(
                "{}/s | ETA {}",
                format_bytes(p.current_speed_bytes_per_sec as u64),
                format_eta(p.estimated_seconds_remaining)
            ));
        }
        None => {
            if throttle.should_log() || p.completed == p.total {
                info!(
                    completed = p.completed,
                    total = p.total,
                    percent = p.percent_complete,
                    uploaded = %format_bytes(p.bytes_uploaded),
                    speed = %format!("{}/s", format_bytes(p.current_speed_bytes_per_sec as u64)),
                    eta = %format_eta(p.estimated_seconds_remaining),
                    "Migration progress"
                );
            }
        }
    }
}

fn make_bar(total: u64) -> ProgressBar {
    let bar = ProgressBar::with_draw_target(Some(total), ProgressDrawTarget::stderr());
    if let Ok(style) = ProgressStyle::with_template(
        "Uploading [{bar:40.cyan/blue}] {percent:>3}% | {pos}/{len} | {msg}",
    ) {
        bar.set_style(style.progress_chars("█░"));
    }
    bar
}

fn format_eta(secs: Option<u64>) -> String {
    match secs {
        Some(s) => format_duration(Duration::from_secs(s)),
        None => "?".to_string(),
    }
}

/// Human-readable size, e.g. `1.5 MB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if bytes == 0 {
        return "0 B".to_string();
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// Human-readable duration, e.g. `2m 30s`.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (h, m, s) = (secs / 3600, (secs / 60) % 60, secs % 60);
    if h > 0 {
        format!("{h}h {m}m {s}s")
    } else if m > 0 {
        format!("{m}m {s}s")
    } else {
        format!("{s}s")
    }
}
