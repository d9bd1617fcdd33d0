//! Reconciler loop and the producer-facing controller handle.
//!
//! One [`Controller`] owns one work queue and one worker loop. All remote
//! mutations for the controller happen sequentially on that loop, which is
//! what keeps at most one reconciliation in flight per key. Producers talk to
//! it through a [`ControllerHandle`]: they change the desired state and
//! enqueue keys, nothing else.
//!
//! Per-key states on each dequeue:
//!
//! | desired | retained | actual | state         | action          |
//! |---------|----------|--------|---------------|-----------------|
//! | no      | -        | no     | `Absent`      | none            |
//! | yes     | -        | no     | `DesiredOnly` | create          |
//! | yes     | -        | differs| `Divergent`   | update          |
//! | yes     | -        | equal  | `Synced`      | clear error     |
//! | no      | yes      | yes    | `Retained`    | none            |
//! | no      | no       | yes    | `ActualOnly`  | garbage collect |

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, instrument, trace};

use crate::backoff::RetryPolicy;
use crate::cache::ActualState;
use crate::error::{classify, FailureClass, Operation, ReconcileError, StoreError};
use crate::feed::{self, FeedMode};
use crate::queue::WorkQueue;
use crate::resource::{OwnerLabel, Resource, ResourceKey};
use crate::status::StatusSink;
use crate::store::RemoteStore;
use crate::tracker::{DesiredEntry, DesiredState, FailFn};

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Controller name, used in logs.
    pub name: String,

    /// Label stamped on every created resource and used to scope list/watch.
    pub owner: OwnerLabel,

    /// Error-condition type recorded on status sinks.
    pub error_type: String,

    /// Per-key retry budget.
    pub retry: RetryPolicy,

    /// Change feed variant.
    pub feed: FeedMode,

    /// Leave unwanted remote resources alone until
    /// [`ControllerHandle::ready_for_gc`] is called.
    pub hold_gc_until_ready: bool,
}

impl ControllerConfig {
    /// Configuration with default retry policy and a watching feed.
    pub fn new(name: impl Into<String>, owner: OwnerLabel, error_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            owner,
            error_type: error_type.into(),
            retry: RetryPolicy::default(),
            feed: FeedMode::default(),
            hold_gc_until_ready: false,
        }
    }
}

/// Reconciliation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    /// Resources created.
    pub created: u64,

    /// Resources updated.
    pub updated: u64,

    /// Resources deleted by garbage collection.
    pub garbage_collected: u64,

    /// Deletes that found the resource already gone.
    pub already_absent: u64,

    /// Failed attempts scheduled for retry.
    pub retries: u64,

    /// Keys that exhausted their retry budget.
    pub exhausted: u64,
}

#[derive(Debug, Default)]
struct StatsCounters {
    created: AtomicU64,
    updated: AtomicU64,
    garbage_collected: AtomicU64,
    already_absent: AtomicU64,
    retries: AtomicU64,
    exhausted: AtomicU64,
}

impl StatsCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ReconcileStats {
        ReconcileStats {
            created: self.created.load(Ordering::Relaxed),
            updated: self.updated.load(Ordering::Relaxed),
            garbage_collected: self.garbage_collected.load(Ordering::Relaxed),
            already_absent: self.already_absent.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
        }
    }
}

/// Reconciliation state of one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Absent,
    DesiredOnly,
    ActualOnly,
    Retained,
    Synced,
    Divergent,
}

impl KeyState {
    /// Derive the state from the desired entry, retain flag and cached actual.
    pub fn of<R: Resource>(desired: Option<&R>, retained: bool, actual: Option<&R>) -> Self {
        match (desired, actual) {
            (Some(want), Some(have)) if want.same_content(have) => KeyState::Synced,
            (Some(_), Some(_)) => KeyState::Divergent,
            (Some(_), None) => KeyState::DesiredOnly,
            (None, Some(_)) if retained => KeyState::Retained,
            (None, Some(_)) => KeyState::ActualOnly,
            (None, None) => KeyState::Absent,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            KeyState::Absent => "absent",
            KeyState::DesiredOnly => "desired_only",
            KeyState::ActualOnly => "actual_only",
            KeyState::Retained => "retained",
            KeyState::Synced => "synced",
            KeyState::Divergent => "divergent",
        }
    }
}

impl fmt::Display for KeyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State shared between the handle, the feed and the worker.
pub(crate) struct Shared<R: Resource> {
    pub(crate) name: String,
    pub(crate) owner: OwnerLabel,
    pub(crate) error_type: String,
    pub(crate) desired: DesiredState<R>,
    pub(crate) actual: ActualState<R>,
    pub(crate) queue: Arc<WorkQueue>,
    gc_ready: AtomicBool,
    cache_synced: watch::Sender<bool>,
    stats: StatsCounters,
}

impl<R: Resource> Shared<R> {
    /// Enqueue a key surfaced by the feed, unless it is parked.
    pub(crate) fn enqueue_observed(&self, key: &ResourceKey) {
        if !self.desired.is_parked(key) {
            self.queue.add(key);
        }
    }

    pub(crate) fn mark_cache_synced(&self) {
        self.cache_synced.send_replace(true);
    }

    fn gc_ready(&self) -> bool {
        self.gc_ready.load(Ordering::SeqCst)
    }
}

/// Producer interface of a controller.
pub trait SetController<R: Resource>: Send + Sync {
    /// Declare `resource` desired. Replaces any previous entry for its key,
    /// resets the key's retry budget, and enqueues it.
    fn add(&self, resource: R, on_fail: FailFn, status: Arc<dyn StatusSink>);

    /// Stop desiring `key`. Clears its retain mark and fail callback, and
    /// enqueues it so the remote copy is removed.
    fn delete(&self, key: &ResourceKey);

    /// Protect `key` from garbage collection. Does not enqueue.
    fn mark_retained(&self, key: &ResourceKey);

    /// Register the callback run when `key` exhausts its retries.
    fn register_fail_func(&self, key: &ResourceKey, on_fail: FailFn);

    /// Allow garbage collection once producers have registered their state.
    fn ready_for_gc(&self);
}

/// Cloneable producer handle of a [`Controller`].
pub struct ControllerHandle<R: Resource> {
    shared: Arc<Shared<R>>,
}

impl<R: Resource> Clone for ControllerHandle<R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<R: Resource> ControllerHandle<R> {
    /// Controller name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Counter snapshot.
    pub fn stats(&self) -> ReconcileStats {
        self.shared.stats.snapshot()
    }

    /// Returns true if `key` exhausted its retries and waits for a fresh add or delete.
    pub fn is_parked(&self, key: &ResourceKey) -> bool {
        self.shared.desired.is_parked(key)
    }

    /// Number of desired entries.
    pub fn desired_len(&self) -> usize {
        self.shared.desired.len()
    }
}

impl<R: Resource> SetController<R> for ControllerHandle<R> {
    fn add(&self, mut resource: R, on_fail: FailFn, status: Arc<dyn StatusSink>) {
        resource.stamp_owner(&self.shared.owner);
        resource.set_resource_version(None);

        let key = self.shared.desired.upsert(resource, status, on_fail);
        self.shared.queue.forget(&key);
        self.shared.queue.add(&key);
    }

    fn delete(&self, key: &ResourceKey) {
        self.shared.desired.remove(key);
        self.shared.queue.forget(key);
        self.shared.queue.add(key);
    }

    fn mark_retained(&self, key: &ResourceKey) {
        self.shared.desired.retain(key);
    }

    fn register_fail_func(&self, key: &ResourceKey, on_fail: FailFn) {
        self.shared.desired.register_fail_fn(key, on_fail);
    }

    fn ready_for_gc(&self) {
        if self.shared.gc_ready.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(controller = %self.shared.name, "Garbage collection enabled");
        for key in self.shared.actual.keys() {
            self.shared.enqueue_observed(&key);
        }
    }
}

/// A reconciliation controller for one resource kind.
pub struct Controller<S: RemoteStore> {
    store: Arc<S>,
    shared: Arc<Shared<S::Resource>>,
    retry: RetryPolicy,
    feed: FeedMode,
}

impl<S: RemoteStore> Controller<S> {
    /// Create a controller over `store`.
    pub fn new(store: S, config: ControllerConfig) -> Self {
        let (cache_synced, _) = watch::channel(false);
        let shared = Shared {
            name: config.name,
            owner: config.owner,
            error_type: config.error_type,
            desired: DesiredState::new(),
            actual: ActualState::new(),
            queue: WorkQueue::new(config.retry.backoff.clone()),
            gc_ready: AtomicBool::new(!config.hold_gc_until_ready),
            cache_synced,
            stats: StatsCounters::default(),
        };

        Self {
            store: Arc::new(store),
            shared: Arc::new(shared),
            retry: config.retry,
            feed: config.feed,
        }
    }

    /// Producer handle. Usable before and after [`Controller::run`] starts.
    pub fn handle(&self) -> ControllerHandle<S::Resource> {
        ControllerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Run the change feed and the reconciler loop until `shutdown` is signalled.
    ///
    /// Keys are only processed once the first enumeration has completed.
    /// Returns an error only for invariant violations and for a change feed
    /// that stops before shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), ReconcileError> {
        info!(
            controller = %self.shared.name,
            kind = S::Resource::KIND,
            owner = %self.shared.owner,
            "Starting controller"
        );

        let mut feed_task = tokio::spawn(feed::run(
            Arc::clone(&self.store),
            Arc::clone(&self.shared),
            self.feed.clone(),
            shutdown.clone(),
        ));

        let result = self.work(&mut shutdown, &mut feed_task).await;

        self.shared.queue.shut_down();
        if !feed_task.is_finished() {
            feed_task.abort();
            let _ = feed_task.await;
        }

        match &result {
            Ok(()) => info!(controller = %self.shared.name, "Controller stopped"),
            Err(e) => error!(controller = %self.shared.name, error = %e, "Controller failed"),
        }
        result
    }

    async fn work(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        feed_task: &mut JoinHandle<()>,
    ) -> Result<(), ReconcileError> {
        let mut synced = self.shared.cache_synced.subscribe();
        tokio::select! {
            _ = feed::cancelled(shutdown) => return Ok(()),
            joined = &mut *feed_task => return self.feed_exited(joined, shutdown),
            _ = async { synced.wait_for(|synced| *synced).await.is_ok() } => {}
        }
        debug!(controller = %self.shared.name, "Actual state synced, processing queue");

        loop {
            let key = tokio::select! {
                _ = feed::cancelled(shutdown) => return Ok(()),
                joined = &mut *feed_task => return self.feed_exited(joined, shutdown),
                key = self.shared.queue.get() => key,
            };
            let Some(key) = key else {
                return Ok(());
            };

            let result = self.reconcile_key(&key).await;
            self.shared.queue.done(&key);
            result?;
        }
    }

    /// The feed only returns on shutdown. Any other exit leaves the actual
    /// cache frozen, so the controller stops.
    fn feed_exited(
        &self,
        joined: Result<(), JoinError>,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<(), ReconcileError> {
        if *shutdown.borrow() || shutdown.has_changed().is_err() {
            return Ok(());
        }

        let detail = match joined {
            Ok(()) => "returned before shutdown".to_string(),
            Err(e) if e.is_panic() => {
                let payload = e.into_panic();
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|m| m.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic payload".to_string());
                format!("panicked: {message}")
            }
            Err(e) => e.to_string(),
        };
        error!(controller = %self.shared.name, detail = %detail, "Change feed stopped");

        Err(ReconcileError::FeedStopped {
            controller: self.shared.name.clone(),
            detail,
        })
    }

    /// Diff desired against actual for `key` and issue at most one mutation.
    #[instrument(skip(self), fields(controller = %self.shared.name))]
    async fn reconcile_key(&self, key: &ResourceKey) -> Result<(), ReconcileError> {
        let snapshot = self.shared.desired.snapshot(key);
        if snapshot.parked {
            trace!("Parked after exhausting retries, skipping");
            return Ok(());
        }
        let actual = self.shared.actual.get(key);
        let state = KeyState::of(
            snapshot.desired.as_ref().map(|e| &e.resource),
            snapshot.retained,
            actual.as_ref(),
        );
        trace!(state = %state, "Reconciling");

        match (snapshot.desired, actual) {
            (Some(entry), None) => self.create(key, entry).await,
            (Some(entry), Some(current)) if state == KeyState::Divergent => {
                self.update(key, entry, current).await
            }
            (Some(entry), Some(_)) => {
                self.shared.queue.forget(key);
                self.shared.desired.adopt(key);
                entry.status.clear_error(&self.shared.error_type);
                Ok(())
            }
            (None, Some(current)) if state == KeyState::ActualOnly => {
                self.collect(key, current).await;
                Ok(())
            }
            (None, _) => {
                self.shared.queue.forget(key);
                Ok(())
            }
        }
    }

    async fn create(
        &self,
        key: &ResourceKey,
        entry: DesiredEntry<S::Resource>,
    ) -> Result<(), ReconcileError> {
        match self.store.create(&entry.resource).await {
            Ok(stored) => self.written(key, KeyState::DesiredOnly, Operation::Create, stored, &entry),
            Err(e) => {
                self.failed(key, Operation::Create, e, Some(&entry));
                Ok(())
            }
        }
    }

    async fn update(
        &self,
        key: &ResourceKey,
        entry: DesiredEntry<S::Resource>,
        current: S::Resource,
    ) -> Result<(), ReconcileError> {
        let mut resource = entry.resource.clone();
        resource.set_resource_version(current.resource_version().map(str::to_owned));

        match self.store.update(&resource).await {
            Ok(stored) => self.written(key, KeyState::Divergent, Operation::Update, stored, &entry),
            Err(e) => {
                if e.is_not_found() {
                    // Stale cache: the next attempt creates.
                    self.shared.actual.remove(key);
                }
                self.failed(key, Operation::Update, e, Some(&entry));
                Ok(())
            }
        }
    }

    async fn collect(&self, key: &ResourceKey, current: S::Resource) {
        if !self.shared.gc_ready() {
            trace!(key = %key, "Garbage collection held");
            return;
        }

        match self.store.delete(key, current.resource_version()).await {
            Ok(()) => {
                self.shared.actual.remove(key);
                self.shared.queue.forget(key);
                StatsCounters::bump(&self.shared.stats.garbage_collected);
                info!(
                    controller = %self.shared.name,
                    kind = S::Resource::KIND,
                    key = %key,
                    "garbage collected"
                );
            }
            Err(e) => match classify(Operation::Delete, &e) {
                FailureClass::AlreadyAbsent => {
                    self.shared.actual.remove(key);
                    self.shared.queue.forget(key);
                    StatsCounters::bump(&self.shared.stats.already_absent);
                    debug!(key = %key, "Already absent");
                }
                FailureClass::Retryable => self.failed(key, Operation::Delete, e, None),
            },
        }
    }

    fn written(
        &self,
        key: &ResourceKey,
        state: KeyState,
        op: Operation,
        stored: S::Resource,
        entry: &DesiredEntry<S::Resource>,
    ) -> Result<(), ReconcileError> {
        let stored_key = stored.key();
        if stored_key != *key {
            error!(key = %key, state = %state, stored_key = %stored_key, "Store returned a different key");
            return Err(ReconcileError::InvariantViolation {
                key: key.clone(),
                state: state.as_str(),
                detail: format!("{op} returned {stored_key}"),
            });
        }

        self.shared.actual.upsert(stored);
        self.shared.desired.adopt(key);
        self.shared.queue.forget(key);
        entry.status.clear_error(&self.shared.error_type);

        let counter = match op {
            Operation::Create => &self.shared.stats.created,
            _ => &self.shared.stats.updated,
        };
        StatsCounters::bump(counter);
        debug!(key = %key, op = %op, "Reconciled");
        Ok(())
    }

    fn failed(
        &self,
        key: &ResourceKey,
        op: Operation,
        source: StoreError,
        entry: Option<&DesiredEntry<S::Resource>>,
    ) {
        let err = ReconcileError::store(op, key, source);
        let failures = self.shared.queue.num_requeues(key) + 1;

        if self.retry.should_retry(failures) {
            let delay = self.shared.queue.add_rate_limited(key);
            StatsCounters::bump(&self.shared.stats.retries);
            debug!(
                key = %key,
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Scheduling retry"
            );
            return;
        }

        error!(
            controller = %self.shared.name,
            key = %key,
            attempts = failures,
            error = %err,
            "Giving up after retries"
        );
        self.shared.queue.forget(key);
        StatsCounters::bump(&self.shared.stats.exhausted);

        if let Some(entry) = entry {
            self.shared.desired.park(key, entry.generation);
            entry.status.error(&self.shared.error_type, &err);
        }
        if let Some(on_fail) = self.shared.desired.fail_fn(key) {
            on_fail();
        }
    }
}
