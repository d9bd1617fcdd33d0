//! Feed producer tests over a temporary feeds directory.

use std::fs;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use setkeeper_reconcile::status::{
    ELASTIC_SYNC_FAILED, GLOBAL_NETWORK_SET_SYNC_FAILED, PULL_FAILED,
};
use setkeeper_reconcile::{
    BackoffPolicy, Controller, ControllerConfig, FailFn, FeedMode, MemoryStore, Operation,
    Resource, ResourceKey, RetryPolicy, SetController, StatusSink, StoreError,
};
use setkeeper_set_controller::feeds::FeedProducer;
use setkeeper_set_controller::globalnetworkset::GlobalNetworkSet;
use setkeeper_set_controller::ipset::IpSet;
use setkeeper_set_controller::owner_label;
use setkeeper_set_controller::status_report::FeedStatuses;
use tempfile::TempDir;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Add(String, Vec<String>),
    Delete(String),
    Retain(String),
    ReadyForGc,
}

/// Records producer calls and keeps the last fail callback per key.
struct Recorder<R> {
    calls: Mutex<Vec<Call>>,
    fail_fns: Mutex<Vec<(String, FailFn)>>,
    members: fn(&R) -> Vec<String>,
}

impl<R> Recorder<R> {
    fn new(members: fn(&R) -> Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            fail_fns: Mutex::new(Vec::new()),
            members,
        })
    }

    fn take(&self) -> Vec<Call> {
        std::mem::take(&mut *self.calls.lock().unwrap())
    }

    fn fail(&self, key: &str) {
        let fail_fns = self.fail_fns.lock().unwrap();
        let (_, on_fail) = fail_fns.iter().rev().find(|(k, _)| k == key).unwrap();
        on_fail();
    }
}

impl<R: Resource> SetController<R> for Recorder<R> {
    fn add(&self, resource: R, on_fail: FailFn, _status: Arc<dyn StatusSink>) {
        let key = resource.key().to_string();
        self.fail_fns.lock().unwrap().push((key.clone(), on_fail));
        self.calls
            .lock()
            .unwrap()
            .push(Call::Add(key, (self.members)(&resource)));
    }

    fn delete(&self, key: &ResourceKey) {
        self.calls.lock().unwrap().push(Call::Delete(key.to_string()));
    }

    fn mark_retained(&self, key: &ResourceKey) {
        self.calls.lock().unwrap().push(Call::Retain(key.to_string()));
    }

    fn register_fail_func(&self, key: &ResourceKey, on_fail: FailFn) {
        self.fail_fns
            .lock()
            .unwrap()
            .push((key.to_string(), on_fail));
    }

    fn ready_for_gc(&self) {
        self.calls.lock().unwrap().push(Call::ReadyForGc);
    }
}

struct Fixture {
    dir: TempDir,
    network_sets: Arc<Recorder<GlobalNetworkSet>>,
    ip_sets: Arc<Recorder<IpSet>>,
    statuses: FeedStatuses,
    producer: FeedProducer,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let network_sets = Recorder::<GlobalNetworkSet>::new(|s| s.spec.nets.clone());
        let ip_sets = Recorder::<IpSet>::new(|s| s.ips.clone());
        let statuses = FeedStatuses::new();
        let producer = FeedProducer::new(
            dir.path(),
            Duration::from_secs(60),
            network_sets.clone(),
            ip_sets.clone(),
            statuses.clone(),
        );
        Self {
            dir,
            network_sets,
            ip_sets,
            statuses,
            producer,
        }
    }

    fn write(&self, name: &str, content: &str) {
        fs::write(self.dir.path().join(name), content).unwrap();
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn first_scan_pushes_feeds_and_releases_gc() {
    let mut fx = Fixture::new();
    fx.write("abuse", "1.2.3.4\n# comment\n2.0.0.0/8\njunk\n");
    fx.write(".hidden", "9.9.9.9\n");

    let summary = fx.producer.scan().await.unwrap();

    assert_eq!(summary.pulled, vec!["abuse"]);
    assert_eq!(
        fx.network_sets.take(),
        vec![
            Call::Add(
                "threatfeed.abuse".to_string(),
                strings(&["1.2.3.4/32", "2.0.0.0/8"])
            ),
            Call::ReadyForGc,
        ]
    );
    assert_eq!(
        fx.ip_sets.take(),
        vec![
            Call::Add("abuse".to_string(), strings(&["1.2.3.4/32", "2.0.0.0/8"])),
            Call::ReadyForGc,
        ]
    );

    let status = fx.statuses.get("abuse").unwrap().status();
    assert!(status.last_successful_sync.is_some());
    assert!(!status.has_errors());
}

#[tokio::test]
async fn unchanged_feeds_are_not_pushed_again() {
    let mut fx = Fixture::new();
    fx.write("abuse", "1.2.3.4\n");
    fx.producer.scan().await.unwrap();
    fx.network_sets.take();

    let summary = fx.producer.scan().await.unwrap();
    assert!(summary.pulled.is_empty());
    assert!(fx.network_sets.take().is_empty());

    fx.write("abuse", "1.2.3.4\n5.6.7.8\n");
    let summary = fx.producer.scan().await.unwrap();
    assert_eq!(summary.pulled, vec!["abuse"]);
    assert_eq!(
        fx.network_sets.take(),
        vec![Call::Add(
            "threatfeed.abuse".to_string(),
            strings(&["1.2.3.4/32", "5.6.7.8/32"])
        )]
    );
}

#[tokio::test]
async fn removed_file_deletes_both_sets() {
    let mut fx = Fixture::new();
    fx.write("abuse", "1.2.3.4\n");
    fx.producer.scan().await.unwrap();
    fx.network_sets.take();
    fx.ip_sets.take();

    fs::remove_file(fx.dir.path().join("abuse")).unwrap();
    let summary = fx.producer.scan().await.unwrap();

    assert_eq!(summary.removed, vec!["abuse"]);
    assert_eq!(
        fx.network_sets.take(),
        vec![Call::Delete("threatfeed.abuse".to_string())]
    );
    assert_eq!(fx.ip_sets.take(), vec![Call::Delete("abuse".to_string())]);
    assert!(fx.statuses.get("abuse").is_none());
}

#[tokio::test]
async fn fail_callback_forces_repull_of_unchanged_feed() {
    let mut fx = Fixture::new();
    fx.write("abuse", "1.2.3.4\n");
    fx.producer.scan().await.unwrap();
    fx.network_sets.take();

    fx.ip_sets.fail("abuse");
    let summary = fx.producer.scan().await.unwrap();

    assert_eq!(summary.pulled, vec!["abuse"]);
    assert_eq!(
        fx.network_sets.take(),
        vec![Call::Add(
            "threatfeed.abuse".to_string(),
            strings(&["1.2.3.4/32"])
        )]
    );

    let summary = fx.producer.scan().await.unwrap();
    assert!(summary.pulled.is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn unreadable_feed_is_retained_and_recorded() {
    let mut fx = Fixture::new();
    std::os::unix::fs::symlink(
        fx.dir.path().join("missing-target"),
        fx.dir.path().join("broken"),
    )
    .unwrap();

    let summary = fx.producer.scan().await.unwrap();

    assert_eq!(summary.failed, vec!["broken"]);
    assert_eq!(
        fx.network_sets.take(),
        vec![
            Call::Retain("threatfeed.broken".to_string()),
            Call::ReadyForGc
        ]
    );
    let status = fx.statuses.get("broken").unwrap().status();
    assert!(status.condition(PULL_FAILED).is_some());

    // Once readable again, the feed is pushed and the condition cleared.
    fs::remove_file(fx.dir.path().join("broken")).unwrap();
    fx.write("broken", "1.2.3.4\n");
    let summary = fx.producer.scan().await.unwrap();
    assert_eq!(summary.pulled, vec!["broken"]);
    let status = fx.statuses.get("broken").unwrap().status();
    assert!(status.condition(PULL_FAILED).is_none());
}

#[tokio::test]
async fn missing_directory_fails_scan_and_holds_gc() {
    let dir = tempfile::tempdir().unwrap();
    let network_sets = Recorder::<GlobalNetworkSet>::new(|s| s.spec.nets.clone());
    let ip_sets = Recorder::<IpSet>::new(|s| s.ips.clone());
    let mut producer = FeedProducer::new(
        dir.path().join("absent"),
        Duration::from_secs(60),
        network_sets.clone(),
        ip_sets.clone(),
        FeedStatuses::new(),
    );

    assert!(producer.scan().await.is_err());
    assert!(network_sets.take().is_empty());
    assert!(ip_sets.take().is_empty());
}

fn test_config(name: &str, error_type: &str) -> ControllerConfig {
    let mut config = ControllerConfig::new(name, owner_label(), error_type);
    config.retry = RetryPolicy {
        max_attempts: 5,
        backoff: BackoffPolicy::fixed_exponential(
            Duration::from_millis(1),
            Duration::from_millis(5),
        ),
    };
    config.feed = FeedMode::poll(Duration::from_millis(20));
    config.hold_gc_until_ready = true;
    config
}

async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out: {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn producer_drives_controllers_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("abuse"), "1.2.3.4\n2000::1\n").unwrap();

    let network_store = Arc::new(MemoryStore::<GlobalNetworkSet>::new());
    let ip_store = Arc::new(MemoryStore::<IpSet>::new());

    // A leftover set from an earlier run, no longer backed by a feed file.
    let mut stale = GlobalNetworkSet::for_feed("retired", vec!["9.9.9.9/32".to_string()]);
    stale.stamp_owner(&owner_label());
    network_store.insert(stale);

    // The search backend rejects every create.
    ip_store.fail_always(
        Operation::Create,
        StoreError::Unavailable("cluster red".to_string()),
    );

    let network_controller = Controller::new(
        Arc::clone(&network_store),
        test_config("globalnetworksets", GLOBAL_NETWORK_SET_SYNC_FAILED),
    );
    let ip_controller = Controller::new(
        Arc::clone(&ip_store),
        test_config("ipsets", ELASTIC_SYNC_FAILED),
    );
    let network_sets = network_controller.handle();
    let ip_sets = ip_controller.handle();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let network_task = tokio::spawn(network_controller.run(shutdown_rx.clone()));
    let ip_task = tokio::spawn(ip_controller.run(shutdown_rx.clone()));

    let statuses = FeedStatuses::new();
    let mut producer = FeedProducer::new(
        dir.path(),
        Duration::from_secs(60),
        Arc::new(network_sets.clone()),
        Arc::new(ip_sets.clone()),
        statuses.clone(),
    );
    producer.scan().await.unwrap();

    let key = ResourceKey::new("threatfeed.abuse");
    eventually("network set created", || network_store.get(&key).is_some()).await;
    let created = network_store.get(&key).unwrap();
    assert_eq!(created.spec.nets, strings(&["1.2.3.4/32", "2000::1/128"]));
    assert!(created.is_owned_by(&owner_label()));

    let retired = ResourceKey::new("threatfeed.retired");
    eventually("stale set collected", || network_store.get(&retired).is_none()).await;

    eventually("ip set exhausted", || ip_sets.stats().exhausted == 1).await;
    assert_eq!(ip_store.calls(Operation::Create), 5);
    let status = statuses.get("abuse").unwrap().status();
    assert!(status.condition(ELASTIC_SYNC_FAILED).is_some());

    // The fail callback makes the next scan push again, which unparks the key.
    ip_store.clear_faults();
    let summary = producer.scan().await.unwrap();
    assert_eq!(summary.pulled, vec!["abuse"]);
    eventually("ip set created", || {
        ip_store.get(&ResourceKey::new("abuse")).is_some()
    })
    .await;
    eventually("error cleared", || {
        statuses
            .get("abuse")
            .unwrap()
            .status()
            .condition(ELASTIC_SYNC_FAILED)
            .is_none()
    })
    .await;

    shutdown_tx.send(true).unwrap();
    network_task.await.unwrap().unwrap();
    ip_task.await.unwrap().unwrap();
}
