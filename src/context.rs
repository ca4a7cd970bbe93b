use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, MigrationConfig};
use crate::error::MigrateError;
use crate::store::{self, RemoteStore};

/// Everything a migration run needs, resolved from configuration.
#[derive(Clone)]
pub struct MigrationContext {
    pub config: Arc<MigrationConfig>,
    pub store: Arc<dyn RemoteStore>,
    pub cancel: CancellationToken,
    pub manifest_path: PathBuf,
    pub log_path: Option<PathBuf>,
    pub checkpoint_every: usize,
    pub show_progress: bool,
}

impl MigrationContext {
    pub fn new(config: MigrationConfig, store: Arc<dyn RemoteStore>) -> Self {
        Self {
            config: Arc::new(config),
            store,
            cancel: CancellationToken::new(),
            manifest_path: PathBuf::from(".migration/manifest.json"),
            log_path: None,
            checkpoint_every: 0,
            show_progress: false,
        }
    }

    pub fn from_app_config(app: &AppConfig) -> Result<Self, MigrateError> {
        let config = app.migration_config()?;
        let store = store::build_store(app)?;
        Ok(Self {
            manifest_path: app.manifest_path.clone(),
            log_path: Some(app.log_path.clone()),
            checkpoint_every: app.checkpoint_every,
            ..Self::new(config, store)
        })
    }

    pub fn with_manifest_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.manifest_path = path.into();
        self
    }

    pub fn with_event_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    pub fn with_checkpoints(mut self, every: usize) -> Self {
        self.checkpoint_every = every;
        self
    }

    pub fn with_progress_bar(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }
}
