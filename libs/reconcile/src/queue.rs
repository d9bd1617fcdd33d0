//! Rate-limited, per-key deduplicating work queue.
//!
//! Semantics:
//!
//! - A key is queued at most once, no matter how often it is added.
//! - A key handed out by [`WorkQueue::get`] is "processing" until
//!   [`WorkQueue::done`]. Adding it meanwhile marks it dirty; `done` then puts
//!   it back so the change is reconciled by a fresh attempt.
//! - [`WorkQueue::add_rate_limited`] counts a failure against the key and
//!   re-adds it after the backoff delay; [`WorkQueue::forget`] resets the count.
//! - After [`WorkQueue::shut_down`], adds are silently dropped and `get`
//!   returns `None`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::trace;

use crate::backoff::BackoffPolicy;
use crate::resource::ResourceKey;

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<ResourceKey>,
    dirty: HashSet<ResourceKey>,
    processing: HashSet<ResourceKey>,
    requeues: HashMap<ResourceKey, u32>,
    shutting_down: bool,
}

/// Work queue driving a reconciler loop.
#[derive(Debug)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    backoff: BackoffPolicy,
}

impl WorkQueue {
    /// Create a new queue using `backoff` for rate-limited adds.
    pub fn new(backoff: BackoffPolicy) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            backoff,
        })
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a key. No-op if it is already pending or the queue is shut down.
    pub fn add(&self, key: &ResourceKey) {
        let mut state = self.lock();
        if state.shutting_down || state.dirty.contains(key) {
            return;
        }

        state.dirty.insert(key.clone());
        if !state.processing.contains(key) {
            state.queue.push_back(key.clone());
            drop(state);
            self.notify.notify_waiters();
        }
    }

    /// Add a key after `delay`.
    pub fn add_after(self: &Arc<Self>, key: &ResourceKey, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(key);
            return;
        }

        let queue = Arc::clone(self);
        let key = key.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Count a failure against `key` and re-add it after its backoff delay.
    ///
    /// Returns the delay applied.
    pub fn add_rate_limited(self: &Arc<Self>, key: &ResourceKey) -> Duration {
        let attempt = {
            let mut state = self.lock();
            let count = state.requeues.entry(key.clone()).or_insert(0);
            let attempt = *count;
            *count = count.saturating_add(1);
            attempt
        };

        let delay = self.backoff.delay(attempt);
        trace!(key = %key, attempt, delay_ms = delay.as_millis() as u64, "Rate-limited requeue");
        self.add_after(key, delay);
        delay
    }

    /// Number of rate-limited requeues recorded for `key`.
    pub fn num_requeues(&self, key: &ResourceKey) -> u32 {
        self.lock().requeues.get(key).copied().unwrap_or(0)
    }

    /// Reset the failure count of `key`.
    pub fn forget(&self, key: &ResourceKey) {
        self.lock().requeues.remove(key);
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<ResourceKey> {
        loop {
            // Registered before checking so a concurrent add cannot be missed.
            let notified = self.notify.notified();
            {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Mark `key` as processed. Re-queues it if it was added meanwhile.
    pub fn done(&self, key: &ResourceKey) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.notify.notify_waiters();
        }
    }

    /// Stop handing out keys and drop all future adds.
    pub fn shut_down(&self) {
        let mut state = self.lock();
        state.shutting_down = true;
        state.queue.clear();
        state.dirty.clear();
        drop(state);
        self.notify.notify_waiters();
    }

    /// Returns true once [`WorkQueue::shut_down`] has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Number of keys waiting to be handed out.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Returns true if no key is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
