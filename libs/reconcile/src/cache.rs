//! Actual-state cache fed by the change feed.
//!
//! Besides feed updates, the reconciler folds the results of its own writes
//! in. Those local writes are sequenced: an enumeration that started before a
//! local write must not undo it, so [`ActualState::replace_all`] takes the
//! [`ActualState::mark`] read before the list call and keeps newer local state.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::resource::{Resource, ResourceKey};
use crate::store::WatchEvent;

struct CacheState<R> {
    items: HashMap<ResourceKey, R>,
    local_writes: HashMap<ResourceKey, u64>,
    seq: u64,
}

impl<R: Resource> CacheState<R> {
    fn record_local(&mut self, key: ResourceKey) {
        self.seq += 1;
        let seq = self.seq;
        self.local_writes.insert(key, seq);
    }
}

/// Last observed remote state, keyed like the desired state.
pub struct ActualState<R> {
    state: Mutex<CacheState<R>>,
}

impl<R: Resource> Default for ActualState<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Resource> ActualState<R> {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CacheState {
                items: HashMap::new(),
                local_writes: HashMap::new(),
                seq: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState<R>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Position of the latest local write. Read before starting an enumeration.
    pub fn mark(&self) -> u64 {
        self.lock().seq
    }

    /// Replace the cache with an enumeration started at `mark`.
    ///
    /// Keys written locally after `mark` keep their local state. Returns every
    /// key present before or after, sorted.
    pub fn replace_all(&self, items: Vec<R>, mark: u64) -> Vec<ResourceKey> {
        let mut fresh: HashMap<ResourceKey, R> =
            items.into_iter().map(|r| (r.key(), r)).collect();

        let mut state = self.lock();
        for (key, seq) in &state.local_writes {
            if *seq <= mark {
                continue;
            }
            match state.items.get(key) {
                Some(local) => fresh.insert(key.clone(), local.clone()),
                None => fresh.remove(key),
            };
        }
        state.local_writes.retain(|_, seq| *seq > mark);

        let mut touched: BTreeSet<ResourceKey> = state.items.keys().cloned().collect();
        touched.extend(fresh.keys().cloned());
        state.items = fresh;

        touched.into_iter().collect()
    }

    /// Apply one watch event. Returns the affected key.
    pub fn apply(&self, event: WatchEvent<R>) -> ResourceKey {
        let mut state = self.lock();
        match event {
            WatchEvent::Added(r) | WatchEvent::Modified(r) => {
                let key = r.key();
                state.items.insert(key.clone(), r);
                key
            }
            WatchEvent::Deleted(r) => {
                let key = r.key();
                state.items.remove(&key);
                key
            }
        }
    }

    /// Fold in the stored object returned by a local create or update.
    pub fn upsert(&self, resource: R) {
        let key = resource.key();
        let mut state = self.lock();
        state.items.insert(key.clone(), resource);
        state.record_local(key);
    }

    /// Forget `key` after a local delete or a not-found answer.
    pub fn remove(&self, key: &ResourceKey) -> Option<R> {
        let mut state = self.lock();
        let removed = state.items.remove(key);
        state.record_local(key.clone());
        removed
    }

    /// Cached resource for `key`.
    pub fn get(&self, key: &ResourceKey) -> Option<R> {
        self.lock().items.get(key).cloned()
    }

    /// All cached keys.
    pub fn keys(&self) -> Vec<ResourceKey> {
        self.lock().items.keys().cloned().collect()
    }

    /// Number of cached resources.
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::TestSet;

    #[test]
    fn test_replace_all_reports_union_of_keys() {
        let cache = ActualState::new();
        cache.replace_all(vec![TestSet::new("a", &[]), TestSet::new("b", &[])], 0);

        let touched = cache.replace_all(
            vec![TestSet::new("b", &[]), TestSet::new("c", &[])],
            cache.mark(),
        );
        assert_eq!(
            touched,
            vec![
                ResourceKey::from("a"),
                ResourceKey::from("b"),
                ResourceKey::from("c")
            ]
        );
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&ResourceKey::from("a")).is_none());
    }

    #[test]
    fn test_local_writes_survive_older_enumeration() {
        let cache = ActualState::new();
        let mark = cache.mark();

        // Written while the enumeration was in flight.
        cache.upsert(TestSet::new("new", &["1.2.3.4/32"]));
        cache.remove(&ResourceKey::from("old"));

        cache.replace_all(vec![TestSet::new("old", &[])], mark);
        assert!(cache.get(&ResourceKey::from("new")).is_some());
        assert!(cache.get(&ResourceKey::from("old")).is_none());

        // A later enumeration is authoritative again.
        let mark = cache.mark();
        cache.replace_all(vec![TestSet::new("old", &[])], mark);
        assert!(cache.get(&ResourceKey::from("new")).is_none());
        assert!(cache.get(&ResourceKey::from("old")).is_some());
    }

    #[test]
    fn test_apply_events() {
        let cache = ActualState::new();

        let key = cache.apply(WatchEvent::Added(TestSet::new("a", &["1.2.3.4/32"])));
        assert_eq!(key, ResourceKey::from("a"));

        cache.apply(WatchEvent::Modified(TestSet::new("a", &["5.6.7.8/32"])));
        assert_eq!(cache.get(&key).unwrap().members, vec!["5.6.7.8/32"]);

        cache.apply(WatchEvent::Deleted(TestSet::new("a", &[])));
        assert!(cache.is_empty());
    }
}
