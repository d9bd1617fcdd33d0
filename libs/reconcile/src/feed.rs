//! Change feeds: surface the remote store's owned resources into the actual cache.
//!
//! Two variants:
//!
//! - [`FeedMode::Watch`]: list, then stream incremental events until the
//!   stream ends or errors, then relist.
//! - [`FeedMode::Poll`]: list on a fixed period.
//!
//! Both enqueue keys only. The reconciler re-diffs on every dequeue and never
//! trusts an event payload, so relists and duplicate events are harmless.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::controller::Shared;
use crate::error::{Operation, ReconcileError, StoreError};
use crate::resource::{Resource, ResourceKey};
use crate::store::{RemoteStore, WatchEvent};

/// Default pause before relisting after a watch ends or a list fails.
pub const DEFAULT_RELIST_DELAY: Duration = Duration::from_secs(1);

/// Shortest period a polling feed runs at. Shorter periods are raised to it.
pub const MIN_POLL_PERIOD: Duration = Duration::from_millis(10);

/// Change feed variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedMode {
    /// List, then watch; relist after `relist_delay` when the watch ends.
    Watch { relist_delay: Duration },

    /// Full enumeration every `period`.
    Poll { period: Duration },
}

impl Default for FeedMode {
    fn default() -> Self {
        FeedMode::Watch {
            relist_delay: DEFAULT_RELIST_DELAY,
        }
    }
}

impl FeedMode {
    /// Periodic full enumeration, at least [`MIN_POLL_PERIOD`] apart.
    pub fn poll(period: Duration) -> Self {
        FeedMode::Poll {
            period: period.max(MIN_POLL_PERIOD),
        }
    }
}

/// Resolves once `shutdown` reads true or its sender is gone.
pub(crate) async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Sleep for `delay`. Returns false if shutdown was signalled first.
async fn pause(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = cancelled(shutdown) => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

pub(crate) async fn run<S: RemoteStore>(
    store: Arc<S>,
    shared: Arc<Shared<S::Resource>>,
    mode: FeedMode,
    mut shutdown: watch::Receiver<bool>,
) {
    match mode {
        FeedMode::Watch { relist_delay } => {
            run_watch(&*store, &shared, relist_delay, &mut shutdown).await
        }
        FeedMode::Poll { period } => run_poll(&*store, &shared, period, &mut shutdown).await,
    }
    debug!(controller = %shared.name, "Change feed stopped");
}

async fn run_poll<S: RemoteStore>(
    store: &S,
    shared: &Shared<S::Resource>,
    period: Duration,
    shutdown: &mut watch::Receiver<bool>,
) {
    let period = period.max(MIN_POLL_PERIOD);
    info!(
        controller = %shared.name,
        period_secs = period.as_secs_f64(),
        "Starting polling change feed"
    );

    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancelled(shutdown) => return,
            _ = ticker.tick() => {}
        }
        enumerate(store, shared).await;
    }
}

async fn run_watch<S: RemoteStore>(
    store: &S,
    shared: &Shared<S::Resource>,
    relist_delay: Duration,
    shutdown: &mut watch::Receiver<bool>,
) {
    info!(controller = %shared.name, "Starting watching change feed");

    loop {
        let Some(version) = enumerate(store, shared).await else {
            if !pause(relist_delay, shutdown).await {
                return;
            }
            continue;
        };

        let mut events = match store.watch(&shared.owner, version.as_deref()).await {
            Ok(events) => events,
            Err(e) => {
                warn!(controller = %shared.name, error = %e, "Watch failed, relisting");
                if !pause(relist_delay, shutdown).await {
                    return;
                }
                continue;
            }
        };

        loop {
            let next = tokio::select! {
                _ = cancelled(shutdown) => return,
                next = events.next() => next,
            };

            match next {
                Some(Ok(event)) => {
                    if !event_is_owned(shared, &event) {
                        continue;
                    }
                    let key = shared.actual.apply(event);
                    shared.enqueue_observed(&key);
                }
                Some(Err(e)) => {
                    warn!(controller = %shared.name, error = %e, "Watch stream error, relisting");
                    break;
                }
                None => {
                    debug!(controller = %shared.name, "Watch stream closed, relisting");
                    break;
                }
            }
        }

        if !pause(relist_delay, shutdown).await {
            return;
        }
    }
}

fn event_is_owned<R: Resource>(shared: &Shared<R>, event: &WatchEvent<R>) -> bool {
    match event {
        WatchEvent::Added(r) | WatchEvent::Modified(r) | WatchEvent::Deleted(r) => {
            r.is_owned_by(&shared.owner)
        }
    }
}

/// Run one full enumeration and enqueue every affected key.
///
/// Returns the collection version on success. On failure the pass is
/// abandoned and the error recorded against every pending desired key.
async fn enumerate<S: RemoteStore>(
    store: &S,
    shared: &Shared<S::Resource>,
) -> Option<Option<String>> {
    let mark = shared.actual.mark();
    match store.list(&shared.owner).await {
        Ok(listing) => {
            let items: Vec<S::Resource> = listing
                .items
                .into_iter()
                .filter(|r| r.is_owned_by(&shared.owner))
                .collect();
            let count = items.len();

            let touched = shared.actual.replace_all(items, mark);
            shared.mark_cache_synced();

            let desired = shared.desired.active_keys();
            for key in touched.iter().chain(desired.iter()) {
                shared.enqueue_observed(key);
            }

            debug!(
                controller = %shared.name,
                resources = count,
                queued = shared.queue.len(),
                "Enumerated remote store"
            );
            Some(listing.version)
        }
        Err(e) => {
            record_enumeration_failure(shared, e);
            None
        }
    }
}

fn record_enumeration_failure<R: Resource>(shared: &Shared<R>, error: StoreError) {
    let error = ReconcileError::store(Operation::List, &ResourceKey::new(R::KIND), error);
    warn!(
        controller = %shared.name,
        error = %error,
        "Enumeration failed, abandoning pass"
    );
    for status in shared.desired.active_status_sinks() {
        status.error(&shared.error_type, &error);
    }
}
