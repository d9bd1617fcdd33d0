//! In-memory [`RemoteStore`] for tests.
//!
//! Behaves like a versioned object store: every write bumps a global version,
//! conditional writes are checked against it, watches see every owned change.
//! Faults can be injected per operation and calls are counted, so controller
//! tests can assert on exactly what reached the store.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::{Operation, StoreError};
use crate::resource::{OwnerLabel, Resource, ResourceKey};
use crate::store::{Listing, RemoteStore, WatchEvent, WatchStream};

/// Minimal labeled set resource used to exercise controllers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSet {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub members: Vec<String>,
    pub resource_version: Option<String>,
}

impl TestSet {
    pub fn new(name: &str, members: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            labels: BTreeMap::new(),
            members: members.iter().map(|m| m.to_string()).collect(),
            resource_version: None,
        }
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }
}

impl Resource for TestSet {
    const KIND: &'static str = "TestSet";

    fn key(&self) -> ResourceKey {
        ResourceKey::new(self.name.clone())
    }

    fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    fn labels_mut(&mut self) -> &mut BTreeMap<String, String> {
        &mut self.labels
    }

    fn resource_version(&self) -> Option<&str> {
        self.resource_version.as_deref()
    }

    fn set_resource_version(&mut self, version: Option<String>) {
        self.resource_version = version;
    }

    fn same_content(&self, other: &Self) -> bool {
        self.name == other.name && self.labels == other.labels && self.members == other.members
    }
}

#[derive(Debug, Clone)]
enum FaultMode {
    Times(u32),
    Always,
}

#[derive(Debug, Clone)]
struct Fault {
    error: StoreError,
    mode: FaultMode,
}

type EventSender<R> = mpsc::UnboundedSender<Result<WatchEvent<R>, StoreError>>;

struct Inner<R> {
    items: BTreeMap<ResourceKey, R>,
    watchers: Vec<(OwnerLabel, EventSender<R>)>,
    faults: HashMap<Operation, Fault>,
    calls: HashMap<Operation, usize>,
}

/// Versioned in-memory store.
pub struct MemoryStore<R: Resource> {
    inner: Mutex<Inner<R>>,
    version: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    latency: Duration,
    watch_supported: bool,
}

impl<R: Resource> Default for MemoryStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

struct InFlightGuard<'a> {
    counter: &'a AtomicUsize,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<R: Resource> MemoryStore<R> {
    /// Create an empty store that supports watches.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: BTreeMap::new(),
                watchers: Vec::new(),
                faults: HashMap::new(),
                calls: HashMap::new(),
            }),
            version: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            latency: Duration::ZERO,
            watch_supported: true,
        }
    }

    /// Delay every mutation by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Report watch as unsupported, like a poll-only backend.
    pub fn without_watch(mut self) -> Self {
        self.watch_supported = false;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner<R>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    /// Store `resource` directly, bypassing faults. Stamps a fresh version.
    pub fn insert(&self, mut resource: R) -> R {
        resource.set_resource_version(Some(self.next_version()));
        let mut inner = self.lock();
        let event = if inner.items.contains_key(&resource.key()) {
            WatchEvent::Modified(resource.clone())
        } else {
            WatchEvent::Added(resource.clone())
        };
        inner.items.insert(resource.key(), resource.clone());
        broadcast(&mut inner, event);
        resource
    }

    /// Remove `key` directly, bypassing faults.
    pub fn remove(&self, key: &ResourceKey) -> Option<R> {
        let mut inner = self.lock();
        let removed = inner.items.remove(key)?;
        broadcast(&mut inner, WatchEvent::Deleted(removed.clone()));
        Some(removed)
    }

    /// Stored resource for `key`.
    pub fn get(&self, key: &ResourceKey) -> Option<R> {
        self.lock().items.get(key).cloned()
    }

    /// All stored keys, sorted.
    pub fn keys(&self) -> Vec<ResourceKey> {
        self.lock().items.keys().cloned().collect()
    }

    /// All stored resources, sorted by key.
    pub fn snapshot(&self) -> Vec<R> {
        self.lock().items.values().cloned().collect()
    }

    /// Fail the next `times` calls of `op` with `error`.
    pub fn fail(&self, op: Operation, error: StoreError, times: u32) {
        self.lock().faults.insert(
            op,
            Fault {
                error,
                mode: FaultMode::Times(times),
            },
        );
    }

    /// Fail every call of `op` with `error` until cleared.
    pub fn fail_always(&self, op: Operation, error: StoreError) {
        self.lock().faults.insert(
            op,
            Fault {
                error,
                mode: FaultMode::Always,
            },
        );
    }

    /// Remove every injected fault.
    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    /// Number of calls of `op` so far, failed ones included.
    pub fn calls(&self, op: Operation) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Highest number of mutations observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// End every open watch stream, as a server-side timeout would.
    pub fn close_watches(&self) {
        self.lock().watchers.clear();
    }

    /// Number of open watch streams.
    pub fn watch_count(&self) -> usize {
        let mut inner = self.lock();
        inner.watchers.retain(|(_, tx)| !tx.is_closed());
        inner.watchers.len()
    }

    fn record_call(&self, op: Operation) -> Result<(), StoreError> {
        let mut inner = self.lock();
        *inner.calls.entry(op).or_insert(0) += 1;

        let Some(fault) = inner.faults.get_mut(&op) else {
            return Ok(());
        };
        let error = fault.error.clone();
        let exhausted = match &mut fault.mode {
            FaultMode::Always => false,
            FaultMode::Times(remaining) => {
                *remaining = remaining.saturating_sub(1);
                *remaining == 0
            }
        };
        if exhausted {
            inner.faults.remove(&op);
        }
        Err(error)
    }

    async fn begin_mutation(&self) -> InFlightGuard<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        InFlightGuard {
            counter: &self.in_flight,
        }
    }
}

fn broadcast<R: Resource>(inner: &mut Inner<R>, event: WatchEvent<R>) {
    let owned = match &event {
        WatchEvent::Added(r) | WatchEvent::Modified(r) | WatchEvent::Deleted(r) => r.clone(),
    };
    inner.watchers.retain(|(owner, tx)| {
        if !owned.is_owned_by(owner) {
            return !tx.is_closed();
        }
        tx.send(Ok(event.clone())).is_ok()
    });
}

#[async_trait]
impl<R: Resource> RemoteStore for MemoryStore<R> {
    type Resource = R;

    async fn list(&self, owner: &OwnerLabel) -> Result<Listing<R>, StoreError> {
        self.record_call(Operation::List)?;
        let inner = self.lock();
        let items = inner
            .items
            .values()
            .filter(|r| r.is_owned_by(owner))
            .cloned()
            .collect();
        Ok(Listing {
            items,
            version: Some(self.version.load(Ordering::SeqCst).to_string()),
        })
    }

    async fn watch(
        &self,
        owner: &OwnerLabel,
        _since: Option<&str>,
    ) -> Result<WatchStream<R>, StoreError> {
        if !self.watch_supported {
            return Err(StoreError::Unsupported("watch"));
        }
        self.record_call(Operation::Watch)?;

        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().watchers.push((owner.clone(), tx));
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn create(&self, resource: &R) -> Result<R, StoreError> {
        let _guard = self.begin_mutation().await;
        self.record_call(Operation::Create)?;

        let key = resource.key();
        let mut inner = self.lock();
        if inner.items.contains_key(&key) {
            return Err(StoreError::Conflict(format!("{key} already exists")));
        }

        let mut stored = resource.clone();
        stored.set_resource_version(Some(self.next_version()));
        inner.items.insert(key, stored.clone());
        broadcast(&mut inner, WatchEvent::Added(stored.clone()));
        Ok(stored)
    }

    async fn update(&self, resource: &R) -> Result<R, StoreError> {
        let _guard = self.begin_mutation().await;
        self.record_call(Operation::Update)?;

        let key = resource.key();
        let mut inner = self.lock();
        let Some(current) = inner.items.get(&key) else {
            return Err(StoreError::NotFound(key.to_string()));
        };
        if let Some(expected) = resource.resource_version() {
            if current.resource_version() != Some(expected) {
                return Err(StoreError::Conflict(format!(
                    "{key}: version {expected} is stale"
                )));
            }
        }

        let mut stored = resource.clone();
        stored.set_resource_version(Some(self.next_version()));
        inner.items.insert(key, stored.clone());
        broadcast(&mut inner, WatchEvent::Modified(stored.clone()));
        Ok(stored)
    }

    async fn delete(
        &self,
        key: &ResourceKey,
        expected_version: Option<&str>,
    ) -> Result<(), StoreError> {
        let _guard = self.begin_mutation().await;
        self.record_call(Operation::Delete)?;

        let mut inner = self.lock();
        let Some(current) = inner.items.get(key) else {
            return Err(StoreError::NotFound(key.to_string()));
        };
        if let Some(expected) = expected_version {
            if current.resource_version() != Some(expected) {
                return Err(StoreError::Conflict(format!(
                    "{key}: version {expected} is stale"
                )));
            }
        }

        if let Some(removed) = inner.items.remove(key) {
            broadcast(&mut inner, WatchEvent::Deleted(removed));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn owner() -> OwnerLabel {
        OwnerLabel::new("owner", "me")
    }

    #[tokio::test]
    async fn test_list_filters_by_owner() {
        let store = MemoryStore::new();
        store.insert(TestSet::new("mine", &[]).with_label("owner", "me"));
        store.insert(TestSet::new("theirs", &[]).with_label("owner", "them"));

        let listing = store.list(&owner()).await.unwrap();
        assert_eq!(listing.items.len(), 1);
        assert_eq!(listing.items[0].name, "mine");
        assert_eq!(store.calls(Operation::List), 1);
    }

    #[tokio::test]
    async fn test_conditional_writes() {
        let store = MemoryStore::new();
        let created = store.create(&TestSet::new("a", &["1.2.3.4/32"])).await.unwrap();
        let v1 = created.resource_version.clone().unwrap();

        let err = store.create(&TestSet::new("a", &[])).await.unwrap_err();
        assert!(err.is_conflict());

        let mut next = created.clone();
        next.members = vec!["5.6.7.8/32".into()];
        let updated = store.update(&next).await.unwrap();
        assert_ne!(updated.resource_version.as_deref(), Some(v1.as_str()));

        // Stale version.
        let err = store.update(&next).await.unwrap_err();
        assert!(err.is_conflict());
        let err = store.delete(&next.key(), Some(v1.as_str())).await.unwrap_err();
        assert!(err.is_conflict());

        store.delete(&next.key(), None).await.unwrap();
        let err = store.delete(&next.key(), None).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_fault_injection_counts_down() {
        let store: MemoryStore<TestSet> = MemoryStore::new();
        store.fail(Operation::Create, StoreError::Unavailable("down".into()), 2);

        assert!(store.create(&TestSet::new("a", &[])).await.is_err());
        assert!(store.create(&TestSet::new("a", &[])).await.is_err());
        assert!(store.create(&TestSet::new("a", &[])).await.is_ok());
        assert_eq!(store.calls(Operation::Create), 3);
    }

    #[tokio::test]
    async fn test_watch_sees_owned_changes_only() {
        let store = MemoryStore::new();
        let mut events = store.watch(&owner(), None).await.unwrap();

        store.insert(TestSet::new("theirs", &[]).with_label("owner", "them"));
        store.insert(TestSet::new("mine", &[]).with_label("owner", "me"));
        store.remove(&ResourceKey::from("mine"));

        let first = events.next().await.unwrap().unwrap();
        assert!(matches!(first, WatchEvent::Added(ref r) if r.name == "mine"));
        let second = events.next().await.unwrap().unwrap();
        assert!(matches!(second, WatchEvent::Deleted(ref r) if r.name == "mine"));

        store.close_watches();
        assert!(events.next().await.is_none());
    }
}
