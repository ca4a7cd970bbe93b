//! Diagnostic logging on stderr through `tracing`.
//!
//! Kept apart from the per-run JSONL event log in [`crate::core::event_log`];
//! stdout stays free for JSON reports.

use std::time::{Duration, Instant};

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Debug, Clone, Copy, Default)]
pub struct LogConfig {
    /// One JSON object per line
    pub json: bool,
    /// Debug level for this crate
    pub verbose: bool,
}

/// Install the global subscriber. `RUST_LOG` wins over `verbose`; a second
/// call leaves the first subscriber in place.
pub fn init(config: LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(config.verbose)));
    let registry = tracing_subscriber::registry().with(filter);

    // JSON lines carry the run span's fields and close with its duration
    let installed = if config.json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()
    } else {
        registry
            .with(
                fmt::layer()
                    .compact()
                    .with_writer(std::io::stderr)
                    .with_target(false),
            )
            .try_init()
    };

    if let Err(e) = installed {
        eprintln!("logging already initialized: {e}");
    }
}

fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "asset_migrate=debug"
    } else {
        "asset_migrate=info"
    }
}

/// Lets a line through at most once per interval.
#[derive(Debug)]
pub struct LogThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn should_log(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}
