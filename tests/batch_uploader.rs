use asset_migrate::config::MigrationConfig;
use asset_migrate::core::uploader::{CANCELLED_MESSAGE, DRY_RUN_ETAG};
use asset_migrate::core::{AssetCategory, AssetDescriptor, BatchUploader, RecordStatus};
use asset_migrate::store::{Behavior, SimulatedStore, StoreError};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

fn asset(key: &str, size: u64) -> Arc<AssetDescriptor> {
    Arc::new(AssetDescriptor {
        local_path: PathBuf::from(format!("/srv/public/{key}")),
        remote_key: key.to_string(),
        size_bytes: size,
        mime_type: mime_guess::from_path(key)
            .first_raw()
            .unwrap_or("application/octet-stream")
            .to_string(),
        checksum: format!("sum-{key}"),
        category: if key.ends_with(".mp4") {
            AssetCategory::Video
        } else {
            AssetCategory::Image
        },
    })
}

fn config(concurrency: usize, max_retries: u32) -> Arc<MigrationConfig> {
    Arc::new(
        MigrationConfig::builder("media")
            .concurrency(concurrency)
            .max_retries(max_retries)
            .retry_delays(Duration::ZERO, Duration::ZERO)
            .build()
            .unwrap(),
    )
}

fn uploader(store: &SimulatedStore, config: Arc<MigrationConfig>) -> BatchUploader {
    BatchUploader::new(Arc::new(store.clone()), config)
}

#[tokio::test]
async fn test_every_asset_gets_one_terminal_record() {
    let store = SimulatedStore::new();
    store.script("3.jpg", Behavior::FailPermanent);
    store.script("5.jpg", Behavior::FailTransient(1));
    store.insert_object("7.jpg", "sum-7.jpg");
    let assets: Vec<_> = (0..25).map(|i| asset(&format!("{i}.jpg"), 10)).collect();

    let outcome = uploader(&store, config(4, 2)).run(&assets).await.unwrap();

    assert_eq!(outcome.records.len(), 25);
    let ids: HashSet<_> = outcome.records.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids.len(), 25);
    assert!(outcome.records.iter().all(|r| r.is_terminal()));
}

#[tokio::test]
async fn test_matching_remote_checksum_is_skipped() {
    let store = SimulatedStore::new();
    store.insert_object("a.jpg", "SUM-A.JPG");

    let outcome = uploader(&store, config(2, 3)).run(&[asset("a.jpg", 10)]).await.unwrap();
    let record = &outcome.records[0];

    assert_eq!(record.status, RecordStatus::Skipped);
    assert_eq!(record.attempts, 0);
    assert!(record.upload_started_at.is_none());
    assert!(record.etag.is_none());
    assert_eq!(store.put_calls(), 0);
}

#[tokio::test]
async fn test_always_transient_uses_every_attempt() {
    let store = SimulatedStore::new();
    store.script("a.jpg", Behavior::AlwaysTransient);

    let outcome = uploader(&store, config(2, 3)).run(&[asset("a.jpg", 10)]).await.unwrap();
    let record = &outcome.records[0];

    assert_eq!(record.status, RecordStatus::Failed);
    assert_eq!(record.attempts, 4);
    assert_eq!(store.put_attempts("a.jpg"), 4);
    assert!(record.error_message.is_some());
}

#[tokio::test]
async fn test_zero_retries_means_single_attempt() {
    let store = SimulatedStore::new();
    store.script("a.jpg", Behavior::AlwaysTransient);

    let outcome = uploader(&store, config(1, 0)).run(&[asset("a.jpg", 10)]).await.unwrap();

    assert_eq!(outcome.records[0].status, RecordStatus::Failed);
    assert_eq!(outcome.records[0].attempts, 1);
    assert_eq!(store.put_attempts("a.jpg"), 1);
}

#[tokio::test]
async fn test_permanent_failures_do_not_block_others() {
    let store = SimulatedStore::new();
    store.script("bad-1.jpg", Behavior::FailPermanent);
    store.script("bad-2.jpg", Behavior::FailPermanent);
    let assets = vec![
        asset("bad-1.jpg", 1),
        asset("ok-1.jpg", 1),
        asset("bad-2.jpg", 1),
        asset("ok-2.jpg", 1),
        asset("ok-3.jpg", 1),
    ];

    let outcome = uploader(&store, config(2, 5)).run(&assets).await.unwrap();

    for record in &outcome.records {
        if record.id.starts_with("bad") {
            assert_eq!(record.status, RecordStatus::Failed);
            assert_eq!(record.attempts, 1, "permanent errors are not retried");
        } else {
            assert_eq!(record.status, RecordStatus::Success);
        }
    }
    assert!(outcome.fatal.is_none());
    assert!(!outcome.cancelled);
}

#[tokio::test]
async fn test_stalled_uploads_time_out_instead_of_starving_the_pool() {
    let store = SimulatedStore::new();
    store.script("stuck.mp4", Behavior::Hang);
    let config = Arc::new(
        MigrationConfig::builder("media")
            .concurrency(1)
            .max_retries(0)
            .attempt_timeout(Duration::from_millis(50))
            .build()
            .unwrap(),
    );
    let assets = vec![asset("stuck.mp4", 1), asset("after.jpg", 1)];

    let outcome = timeout(Duration::from_secs(5), uploader(&store, config).run(&assets))
        .await
        .expect("run should not hang")
        .unwrap();

    assert_eq!(outcome.records[0].status, RecordStatus::Failed);
    assert_eq!(outcome.records[1].status, RecordStatus::Success);
}

#[tokio::test]
async fn test_dry_run_makes_no_put_calls() {
    let store = SimulatedStore::new();
    store.insert_object("existing.jpg", "sum-existing.jpg");
    let config = Arc::new(
        MigrationConfig::builder("media")
            .dry_run(true)
            .build()
            .unwrap(),
    );
    let assets = vec![asset("new.jpg", 5), asset("existing.jpg", 7)];

    let outcome = uploader(&store, config).run(&assets).await.unwrap();

    assert_eq!(store.put_calls(), 0);
    assert_eq!(outcome.records[0].status, RecordStatus::Success);
    assert_eq!(outcome.records[0].etag.as_deref(), Some(DRY_RUN_ETAG));
    assert_eq!(outcome.records[1].status, RecordStatus::Skipped);
    assert!(store.object("new.jpg").is_none());
}

#[tokio::test]
async fn test_concurrency_reaches_but_never_exceeds_limit() {
    let store = SimulatedStore::new().with_put_delay(Duration::from_millis(15));
    let assets: Vec<_> = (0..12).map(|i| asset(&format!("{i}.png"), 1)).collect();

    let outcome = uploader(&store, config(3, 0)).run(&assets).await.unwrap();

    assert!(outcome.records.iter().all(|r| r.status == RecordStatus::Success));
    assert_eq!(store.peak_concurrency(), 3);
}

#[tokio::test]
async fn test_cancellation_finishes_every_record() {
    let store = SimulatedStore::new();
    let assets: Vec<_> = (0..6).map(|i| asset(&format!("{i}.jpg"), 1)).collect();
    for a in &assets {
        store.script(&a.remote_key, Behavior::Hang);
    }
    let uploader = uploader(&store, config(2, 0));
    let cancel = uploader.cancellation_token();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let outcome = timeout(Duration::from_secs(5), uploader.run(&assets))
        .await
        .expect("cancelled run should return")
        .unwrap();

    assert!(outcome.cancelled);
    assert_eq!(outcome.records.len(), 6);
    for record in &outcome.records {
        assert_eq!(record.status, RecordStatus::Failed);
        assert_eq!(record.error_message.as_deref(), Some(CANCELLED_MESSAGE));
    }
    assert_eq!(store.put_calls(), 2);
}

#[tokio::test]
async fn test_fatal_error_aborts_remaining_assets() {
    let store = SimulatedStore::new();
    store.script("b.jpg", Behavior::FailFatal);
    let assets = vec![asset("a.jpg", 1), asset("b.jpg", 1), asset("c.jpg", 1), asset("d.jpg", 1)];

    let outcome = uploader(&store, config(1, 3)).run(&assets).await.unwrap();

    assert!(matches!(outcome.fatal, Some(StoreError::Fatal(_))));
    assert!(outcome.cancelled);
    assert_eq!(outcome.records[0].status, RecordStatus::Success);
    assert_eq!(outcome.records[1].status, RecordStatus::Failed);
    assert_eq!(outcome.records[1].attempts, 1);
    assert_eq!(outcome.records[2].error_message.as_deref(), Some(CANCELLED_MESSAGE));
    assert_eq!(outcome.records[3].error_message.as_deref(), Some(CANCELLED_MESSAGE));
    assert_eq!(store.put_attempts("c.jpg"), 0);
}
