pub mod discovery;
pub mod event_log;
pub mod manifest;
pub mod models;
pub mod orchestrator;
pub mod progress;
pub mod retry;
pub mod uploader;
pub mod verifier;

pub use discovery::{DiscoveryError, discover_all};
pub use event_log::{EventLog, MigrationEvent};
pub use manifest::{Manifest, ManifestError, SharedManifest};
pub use models::{AssetCategory, AssetDescriptor, MigrationRecord, MigrationSummary, RecordStatus};
pub use orchestrator::{Orchestrator, RunReport};
pub use progress::{ProgressTracker, UploadProgress};
pub use retry::RetryPolicy;
pub use uploader::{BatchOutcome, BatchUploader};
pub use verifier::{VerificationResult, VerificationStatus, verify_manifest};
