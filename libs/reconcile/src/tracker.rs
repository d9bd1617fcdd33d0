//! Desired-state tracker: desired entries, the retain set, fail callbacks.
//!
//! Everything lives behind one mutex so producers on arbitrary tasks and the
//! reconciler see consistent snapshots. Producers never reach the remote
//! store from here; they only change these maps and enqueue keys.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::resource::{Resource, ResourceKey};
use crate::status::StatusSink;

/// Callback run when a key exhausts its retry budget.
pub type FailFn = Arc<dyn Fn() + Send + Sync>;

/// A desired resource and the status sink its failures are reported to.
#[derive(Clone)]
pub struct DesiredEntry<R> {
    pub resource: R,
    pub status: Arc<dyn StatusSink>,

    /// Bumped on every add, so a failure of an older value can be told apart.
    pub generation: u64,
}

impl<R: fmt::Debug> fmt::Debug for DesiredEntry<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DesiredEntry")
            .field("resource", &self.resource)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// Everything the reconciler needs to know about one key, read under one lock.
#[derive(Debug, Clone)]
pub struct KeySnapshot<R> {
    pub desired: Option<DesiredEntry<R>>,
    pub retained: bool,
    pub parked: bool,
}

struct TrackerState<R> {
    desired: HashMap<ResourceKey, DesiredEntry<R>>,
    retained: HashSet<ResourceKey>,
    fail_fns: HashMap<ResourceKey, FailFn>,
    parked: HashSet<ResourceKey>,
    generation: u64,
}

impl<R> Default for TrackerState<R> {
    fn default() -> Self {
        Self {
            desired: HashMap::new(),
            retained: HashSet::new(),
            fail_fns: HashMap::new(),
            parked: HashSet::new(),
            generation: 0,
        }
    }
}

/// Desired state of one controller.
pub struct DesiredState<R> {
    state: Mutex<TrackerState<R>>,
}

impl<R: Resource> Default for DesiredState<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Resource> DesiredState<R> {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TrackerState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState<R>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace the desired entry for the resource's key.
    ///
    /// The key leaves the retain set (the entry now covers it) and is unparked.
    pub fn upsert(&self, resource: R, status: Arc<dyn StatusSink>, on_fail: FailFn) -> ResourceKey {
        let key = resource.key();
        let mut state = self.lock();
        state.retained.remove(&key);
        state.parked.remove(&key);
        state.fail_fns.insert(key.clone(), on_fail);
        state.generation += 1;
        let generation = state.generation;
        state.desired.insert(
            key.clone(),
            DesiredEntry {
                resource,
                status,
                generation,
            },
        );
        key
    }

    /// Drop every trace of `key`. Returns true if it was desired.
    pub fn remove(&self, key: &ResourceKey) -> bool {
        let mut state = self.lock();
        state.retained.remove(key);
        state.fail_fns.remove(key);
        state.parked.remove(key);
        state.desired.remove(key).is_some()
    }

    /// Protect `key` from garbage collection.
    pub fn retain(&self, key: &ResourceKey) {
        self.lock().retained.insert(key.clone());
    }

    /// Register (or replace) the fail callback for `key`.
    pub fn register_fail_fn(&self, key: &ResourceKey, on_fail: FailFn) {
        self.lock().fail_fns.insert(key.clone(), on_fail);
    }

    /// Fail callback registered for `key`.
    pub fn fail_fn(&self, key: &ResourceKey) -> Option<FailFn> {
        self.lock().fail_fns.get(key).cloned()
    }

    /// Stop reconciling `key` until its next add or delete.
    ///
    /// No-op unless the desired entry is still at `generation`: a value added
    /// while the failing attempt ran gets its own budget.
    pub fn park(&self, key: &ResourceKey, generation: u64) {
        let mut state = self.lock();
        if state
            .desired
            .get(key)
            .is_some_and(|entry| entry.generation == generation)
        {
            state.parked.insert(key.clone());
        }
    }

    /// Record a successful write: a still-desired key joins the retain set
    /// and is unparked.
    pub fn adopt(&self, key: &ResourceKey) {
        let mut state = self.lock();
        if state.desired.contains_key(key) {
            state.retained.insert(key.clone());
            state.parked.remove(key);
        }
    }

    /// Read desired entry, retain and park flags for `key` at once.
    pub fn snapshot(&self, key: &ResourceKey) -> KeySnapshot<R> {
        let state = self.lock();
        KeySnapshot {
            desired: state.desired.get(key).cloned(),
            retained: state.retained.contains(key),
            parked: state.parked.contains(key),
        }
    }

    /// Desired entry for `key`.
    pub fn get(&self, key: &ResourceKey) -> Option<DesiredEntry<R>> {
        self.lock().desired.get(key).cloned()
    }

    /// Returns true if `key` is in the retain set.
    pub fn is_retained(&self, key: &ResourceKey) -> bool {
        self.lock().retained.contains(key)
    }

    /// Returns true if `key` is parked after exhausting its retries.
    pub fn is_parked(&self, key: &ResourceKey) -> bool {
        self.lock().parked.contains(key)
    }

    /// Desired keys, parked ones excluded.
    pub fn active_keys(&self) -> Vec<ResourceKey> {
        let state = self.lock();
        state
            .desired
            .keys()
            .filter(|k| !state.parked.contains(*k))
            .cloned()
            .collect()
    }

    /// Status sinks of desired keys that are still being reconciled.
    pub fn active_status_sinks(&self) -> Vec<Arc<dyn StatusSink>> {
        let state = self.lock();
        state
            .desired
            .iter()
            .filter(|(k, _)| !state.parked.contains(*k))
            .map(|(_, entry)| Arc::clone(&entry.status))
            .collect()
    }

    /// Number of desired entries.
    pub fn len(&self) -> usize {
        self.lock().desired.len()
    }

    /// Returns true if nothing is desired.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::TestSet;
    use crate::status::FeedStatus;

    fn noop() -> FailFn {
        Arc::new(|| {})
    }

    fn status() -> Arc<dyn StatusSink> {
        Arc::new(FeedStatus::new("test"))
    }

    #[test]
    fn test_upsert_latest_wins_and_folds_retain() {
        let tracker = DesiredState::new();
        let key = ResourceKey::from("ns1");

        tracker.retain(&key);
        let first = tracker.upsert(TestSet::new("ns1", &["10.0.0.0/8"]), status(), noop());
        tracker.park(&first, 1);
        tracker.upsert(TestSet::new("ns1", &["192.168.0.0/16"]), status(), noop());

        let snap = tracker.snapshot(&key);
        assert!(!snap.retained);
        assert!(!snap.parked);
        assert_eq!(snap.desired.unwrap().resource.members, vec!["192.168.0.0/16"]);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_remove_clears_everything() {
        let tracker = DesiredState::new();
        let key = ResourceKey::from("ns1");

        tracker.upsert(TestSet::new("ns1", &[]), status(), noop());
        tracker.retain(&key);
        tracker.park(&key, 1);

        assert!(tracker.remove(&key));
        assert!(tracker.get(&key).is_none());
        assert!(!tracker.is_retained(&key));
        assert!(!tracker.is_parked(&key));
        assert!(tracker.fail_fn(&key).is_none());
        assert!(!tracker.remove(&key));
    }

    #[test]
    fn test_retain_without_desired_entry() {
        let tracker: DesiredState<TestSet> = DesiredState::new();
        let key = ResourceKey::from("ns2");

        tracker.retain(&key);
        let snap = tracker.snapshot(&key);
        assert!(snap.retained);
        assert!(snap.desired.is_none());
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_park_and_adopt_require_desired_entry() {
        let tracker = DesiredState::new();
        let key = ResourceKey::from("gone");

        tracker.park(&key, 0);
        tracker.adopt(&key);
        assert!(!tracker.is_parked(&key));
        assert!(!tracker.is_retained(&key));

        tracker.upsert(TestSet::new("gone", &[]), status(), noop());
        tracker.upsert(TestSet::new("gone", &["1.2.3.4/32"]), status(), noop());
        tracker.park(&key, 1);
        assert!(!tracker.is_parked(&key), "stale generation must not park");
        tracker.park(&key, 2);
        assert!(tracker.is_parked(&key));
        tracker.adopt(&key);
        assert!(tracker.is_retained(&key));
        assert!(!tracker.is_parked(&key));
    }

    #[test]
    fn test_active_keys_skip_parked() {
        let tracker = DesiredState::new();
        tracker.upsert(TestSet::new("a", &[]), status(), noop());
        tracker.upsert(TestSet::new("b", &[]), status(), noop());
        tracker.park(&ResourceKey::from("b"), 2);

        assert_eq!(tracker.active_keys(), vec![ResourceKey::from("a")]);
        assert_eq!(tracker.active_status_sinks().len(), 1);
    }
}
