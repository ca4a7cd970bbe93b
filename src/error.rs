//! Top-level errors and process exit codes.

use std::process::ExitCode;

use thiserror::Error;

use crate::config::ConfigError;
use crate::core::discovery::DiscoveryError;
use crate::core::manifest::ManifestError;
use crate::core::models::MigrationSummary;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum MigrateError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl MigrateError {
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            Self::Config(_) | Self::Discovery(DiscoveryError::MissingSource(_)) => {
                ExitStatus::ConfigError
            }
            Self::Discovery(_) | Self::Manifest(_) | Self::Store(_) => ExitStatus::Fatal,
        }
    }
}

/// How the process ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitStatus {
    Success = 0,
    /// Finished, but at least one asset failed
    PartialFailure = 1,
    /// Bad configuration or missing source directory
    ConfigError = 2,
    /// Aborted: the store became unusable or bookkeeping broke
    Fatal = 3,
}

impl ExitStatus {
    pub fn from_summary(summary: &MigrationSummary) -> Self {
        if summary.has_failures() {
            Self::PartialFailure
        } else {
            Self::Success
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

impl From<ExitStatus> for ExitCode {
    fn from(status: ExitStatus) -> Self {
        ExitCode::from(status.code())
    }
}
