use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;

use super::{PutRequest, RemoteObject, RemoteStore, StoreError};

/// Scripted outcome for `put` calls on one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Behavior {
    /// The first `n` puts fail with a transient error, later ones succeed.
    FailTransient(u32),
    /// Every put fails with a permanent error.
    FailPermanent,
    /// Every put fails as if the store went away.
    FailFatal,
    /// Every put fails transiently.
    AlwaysTransient,
    /// Puts never complete.
    Hang,
}

#[derive(Default)]
struct State {
    objects: HashMap<String, RemoteObject>,
    behaviors: HashMap<String, Behavior>,
    put_attempts: HashMap<String, u32>,
    head_calls: usize,
    unreachable: bool,
}

/// In-memory object store with scriptable failures.
///
/// Cheap to clone; clones share state, so a test can keep a handle for
/// assertions while the uploader owns another.
#[derive(Clone, Default)]
pub struct SimulatedStore {
    state: Arc<Mutex<State>>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
    put_delay: Duration,
}

impl SimulatedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every put take at least `delay`.
    pub fn with_put_delay(mut self, delay: Duration) -> Self {
        self.put_delay = delay;
        self
    }

    /// Seed an existing object carrying `checksum`.
    pub fn insert_object(&self, key: &str, checksum: &str) {
        self.state().objects.insert(
            key.to_string(),
            RemoteObject {
                etag: simulated_etag(checksum),
                checksum: Some(checksum.to_string()),
                size: None,
            },
        );
    }

    pub fn script(&self, key: &str, behavior: Behavior) {
        self.state().behaviors.insert(key.to_string(), behavior);
    }

    /// Make `check_access` fail.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state().unreachable = unreachable;
    }

    pub fn object(&self, key: &str) -> Option<RemoteObject> {
        self.state().objects.get(key).cloned()
    }

    pub fn put_attempts(&self, key: &str) -> u32 {
        self.state().put_attempts.get(key).copied().unwrap_or(0)
    }

    pub fn put_calls(&self) -> u32 {
        self.state().put_attempts.values().sum()
    }

    pub fn head_calls(&self) -> usize {
        self.state().head_calls
    }

    /// Highest number of puts that were running at the same moment.
    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Decrements the in-flight counter even when the put future is dropped
/// by a timeout or cancellation.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteStore for SimulatedStore {
    async fn check_access(&self) -> Result<(), StoreError> {
        if self.state().unreachable {
            return Err(StoreError::Fatal("simulated store is unreachable".to_string()));
        }
        Ok(())
    }

    async fn head(&self, key: &str) -> Result<Option<RemoteObject>, StoreError> {
        let mut state = self.state();
        state.head_calls += 1;
        Ok(state.objects.get(key).cloned())
    }

    async fn put(&self, req: &PutRequest) -> Result<String, StoreError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        let (attempt, behavior) = {
            let mut state = self.state();
            let attempt = state.put_attempts.entry(req.key.clone()).or_insert(0);
            *attempt += 1;
            let attempt = *attempt;
            (attempt, state.behaviors.get(&req.key).cloned())
        };

        if !self.put_delay.is_zero() {
            sleep(self.put_delay).await;
        }

        match behavior {
            Some(Behavior::FailTransient(n)) if attempt <= n => {
                return Err(StoreError::Transient(format!(
                    "simulated transient failure {attempt}/{n}"
                )));
            }
            Some(Behavior::AlwaysTransient) => {
                return Err(StoreError::Transient("simulated throttling".to_string()));
            }
            Some(Behavior::FailPermanent) => {
                return Err(StoreError::Permanent("simulated rejection".to_string()));
            }
            Some(Behavior::FailFatal) => {
                return Err(StoreError::Fatal("simulated outage".to_string()));
            }
            Some(Behavior::Hang) => std::future::pending::<()>().await,
            _ => {}
        }

        let etag = simulated_etag(&req.checksum);
        self.state().objects.insert(
            req.key.clone(),
            RemoteObject {
                etag: etag.clone(),
                checksum: Some(req.checksum.clone()),
                size: Some(req.size),
            },
        );
        Ok(etag)
    }
}

fn simulated_etag(checksum: &str) -> String {
    let len = checksum.len().min(16);
    format!("\"sim-{}\"", &checksum[..len])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn req(key: &str) -> PutRequest {
        PutRequest {
            key: key.to_string(),
            path: PathBuf::from(key),
            content_type: "image/jpeg".to_string(),
            cache_control: String::new(),
            checksum: "c0ffee".to_string(),
            size: 3,
        }
    }

    #[tokio::test]
    async fn transient_script_recovers() {
        let store = SimulatedStore::new();
        store.script("a.jpg", Behavior::FailTransient(2));

        assert!(store.put(&req("a.jpg")).await.is_err());
        assert!(store.put(&req("a.jpg")).await.is_err());
        assert!(store.put(&req("a.jpg")).await.is_ok());
        assert_eq!(store.put_attempts("a.jpg"), 3);
        assert!(store.object("a.jpg").is_some());
    }

    #[tokio::test]
    async fn head_sees_seeded_objects() {
        let store = SimulatedStore::new();
        store.insert_object("b.jpg", "abc");

        let found = store.head("b.jpg").await.unwrap().unwrap();
        assert_eq!(found.checksum.as_deref(), Some("abc"));
        assert!(store.head("missing.jpg").await.unwrap().is_none());
        assert_eq!(store.head_calls(), 2);
    }

    #[tokio::test]
    async fn in_flight_counter_resets_after_drop() {
        let store = SimulatedStore::new();
        store.script("slow.jpg", Behavior::Hang);

        let result =
            tokio::time::timeout(Duration::from_millis(20), store.put(&req("slow.jpg"))).await;
        assert!(result.is_err());
        assert_eq!(store.in_flight.load(Ordering::SeqCst), 0);
        assert_eq!(store.peak_concurrency(), 1);
    }
}
