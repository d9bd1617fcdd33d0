//! Periodic feed status reporting.
//!
//! Feed statuses are shared between the feed producer (which creates one per
//! feed), both controllers (which record sync failures on them) and the
//! reporter (which snapshots them).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use setkeeper_reconcile::{ControllerHandle, FeedStatus, Resource, StatusRecord, StatusSink};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Registry of per-feed statuses, keyed by feed name.
#[derive(Debug, Clone, Default)]
pub struct FeedStatuses {
    inner: Arc<Mutex<BTreeMap<String, Arc<FeedStatus>>>>,
}

impl FeedStatuses {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Arc<FeedStatus>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Status of `feed`, created empty on first use.
    pub fn get_or_insert(&self, feed: &str) -> Arc<FeedStatus> {
        self.lock()
            .entry(feed.to_string())
            .or_insert_with(|| Arc::new(FeedStatus::new(feed)))
            .clone()
    }

    /// Status of `feed`, if registered.
    pub fn get(&self, feed: &str) -> Option<Arc<FeedStatus>> {
        self.lock().get(feed).cloned()
    }

    /// Forget `feed`.
    pub fn remove(&self, feed: &str) {
        self.lock().remove(feed);
    }

    /// Snapshot every feed's status.
    pub fn snapshot(&self) -> BTreeMap<String, StatusRecord> {
        self.lock()
            .iter()
            .map(|(name, status)| (name.clone(), status.status()))
            .collect()
    }
}

/// Counters of one controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerReport {
    pub name: String,
    pub desired: usize,
    pub created: u64,
    pub updated: u64,
    pub garbage_collected: u64,
    pub already_absent: u64,
    pub retries: u64,
    pub exhausted: u64,
}

impl ControllerReport {
    /// Read the counters of `handle`.
    pub fn of<R: Resource>(handle: &ControllerHandle<R>) -> Self {
        let stats = handle.stats();
        Self {
            name: handle.name().to_string(),
            desired: handle.desired_len(),
            created: stats.created,
            updated: stats.updated,
            garbage_collected: stats.garbage_collected,
            already_absent: stats.already_absent,
            retries: stats.retries,
            exhausted: stats.exhausted,
        }
    }
}

/// One status snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub generated_at: DateTime<Utc>,
    pub feeds: BTreeMap<String, StatusRecord>,
    pub controllers: Vec<ControllerReport>,
}

impl StatusReport {
    /// Names of feeds with at least one error condition.
    pub fn failing_feeds(&self) -> Vec<&str> {
        self.feeds
            .iter()
            .filter(|(_, record)| record.has_errors())
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

type ControllerSnapshotFn = Box<dyn Fn() -> ControllerReport + Send + Sync>;

/// Logs feed status periodically and optionally mirrors it to a file.
pub struct StatusReporter {
    statuses: FeedStatuses,
    controllers: Vec<ControllerSnapshotFn>,
    interval: Duration,
    file: Option<PathBuf>,
}

impl StatusReporter {
    pub fn new(statuses: FeedStatuses, interval: Duration, file: Option<PathBuf>) -> Self {
        Self {
            statuses,
            controllers: Vec::new(),
            interval,
            file,
        }
    }

    /// Include the counters of `handle` in every report.
    pub fn with_controller<R: Resource>(mut self, handle: ControllerHandle<R>) -> Self {
        self.controllers
            .push(Box::new(move || ControllerReport::of(&handle)));
        self
    }

    /// Build a snapshot.
    pub fn snapshot(&self) -> StatusReport {
        StatusReport {
            generated_at: Utc::now(),
            feeds: self.statuses.snapshot(),
            controllers: self.controllers.iter().map(|snapshot| snapshot()).collect(),
        }
    }

    /// Log a snapshot and write it to the status file, if configured.
    pub fn report(&self) -> Result<StatusReport> {
        let report = self.snapshot();

        for (feed, record) in report.feeds.iter().filter(|(_, r)| r.has_errors()) {
            for condition in &record.error_conditions {
                warn!(
                    feed = %feed,
                    error_type = %condition.error_type,
                    message = %condition.message,
                    "Feed has error condition"
                );
            }
        }
        for controller in &report.controllers {
            info!(
                controller = %controller.name,
                desired = controller.desired,
                created = controller.created,
                updated = controller.updated,
                garbage_collected = controller.garbage_collected,
                retries = controller.retries,
                exhausted = controller.exhausted,
                "Controller status"
            );
        }
        info!(
            feeds = report.feeds.len(),
            failing = report.failing_feeds().len(),
            "Feed status"
        );

        if let Some(path) = &self.file {
            write_report(path, &report)?;
        }
        Ok(report)
    }

    /// Report every interval until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            file = ?self.file,
            "Starting status reporter"
        );

        let mut ticker = tokio::time::interval(self.interval);
        // The first tick completes immediately; nothing is worth reporting yet.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.report() {
                        error!(error = %e, "Failed to write status report");
                    }
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        info!("Status reporter shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// Write `report` as JSON, replacing `path` atomically.
pub fn write_report(path: &Path, report: &StatusReport) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let body = serde_json::to_vec_pretty(report).context("Failed to encode status report")?;
    let tmp: PathBuf = path.with_extension("tmp");
    fs::write(&tmp, body).with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| {
        format!(
            "Failed to move status file into place ({} -> {})",
            tmp.display(),
            path.display()
        )
    })?;

    Ok(())
}
