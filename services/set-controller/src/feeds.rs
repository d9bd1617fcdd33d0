//! File-backed threat feeds.
//!
//! Every regular file in the feeds directory is one feed, named after the
//! file. Each scan re-reads the files, and a feed whose content hash changed
//! is parsed and pushed to both controllers. Removing a file deletes the
//! feed's sets. A file that cannot be read keeps its remote sets.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use setkeeper_networking::parse_feed;
use setkeeper_reconcile::status::PULL_FAILED;
use setkeeper_reconcile::{fail_fn, ContentHash, FeedStatus, SetController, StatusSink};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::globalnetworkset::{self, GlobalNetworkSet};
use crate::ipset::{self, IpSet};
use crate::status_report::FeedStatuses;

/// Longest accepted feed name.
const MAX_FEED_NAME_LEN: usize = 200;

/// Per-feed producer state.
#[derive(Debug)]
struct FeedState {
    /// Hash of the last content pushed to the controllers.
    hash: Option<ContentHash>,

    /// Set by a controller's fail callback: push again on the next scan.
    repull: Arc<AtomicBool>,

    status: Arc<FeedStatus>,
}

/// Outcome of one scan.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanSummary {
    /// Feeds pushed to the controllers.
    pub pulled: Vec<String>,

    /// Feeds that could not be read.
    pub failed: Vec<String>,

    /// Feeds whose file disappeared.
    pub removed: Vec<String>,
}

/// Turns feed files into desired network sets and IP sets.
pub struct FeedProducer {
    dir: PathBuf,
    period: Duration,
    network_sets: Arc<dyn SetController<GlobalNetworkSet>>,
    ip_sets: Arc<dyn SetController<IpSet>>,
    statuses: FeedStatuses,
    feeds: HashMap<String, FeedState>,
    gc_released: bool,
}

impl FeedProducer {
    pub fn new(
        dir: impl Into<PathBuf>,
        period: Duration,
        network_sets: Arc<dyn SetController<GlobalNetworkSet>>,
        ip_sets: Arc<dyn SetController<IpSet>>,
        statuses: FeedStatuses,
    ) -> Self {
        Self {
            dir: dir.into(),
            period,
            network_sets,
            ip_sets,
            statuses,
            feeds: HashMap::new(),
            gc_released: false,
        }
    }

    /// Scan on every period until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            dir = %self.dir.display(),
            period_secs = self.period.as_secs(),
            "Starting feed producer"
        );

        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.scan().await {
                        warn!(dir = %self.dir.display(), error = %e, "Feed scan failed");
                    }
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        info!("Feed producer shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Scan the feeds directory once.
    ///
    /// Fails only if the directory itself cannot be listed. The first
    /// successful scan releases garbage collection on both controllers.
    pub async fn scan(&mut self) -> Result<ScanSummary> {
        let files = list_feed_files(&self.dir).await?;
        let mut summary = ScanSummary::default();
        let mut seen = HashSet::new();

        for (name, path) in files {
            seen.insert(name.clone());
            match tokio::fs::read(&path).await {
                Ok(bytes) => {
                    if self.pull(&name, &bytes) {
                        summary.pulled.push(name);
                    }
                }
                Err(e) => {
                    self.pull_failed(&name, &path, &e);
                    summary.failed.push(name);
                }
            }
        }

        let gone: Vec<String> = self
            .feeds
            .keys()
            .filter(|name| !seen.contains(*name))
            .cloned()
            .collect();
        for name in gone {
            self.remove(&name);
            summary.removed.push(name);
        }

        if !self.gc_released {
            self.network_sets.ready_for_gc();
            self.ip_sets.ready_for_gc();
            self.gc_released = true;
            info!(feeds = self.feeds.len(), "Initial feed scan complete, releasing garbage collection");
        }

        debug!(
            pulled = summary.pulled.len(),
            failed = summary.failed.len(),
            removed = summary.removed.len(),
            "Feed scan complete"
        );
        Ok(summary)
    }

    fn state(&mut self, name: &str) -> &mut FeedState {
        let statuses = &self.statuses;
        self.feeds.entry(name.to_string()).or_insert_with(|| FeedState {
            hash: None,
            repull: Arc::new(AtomicBool::new(false)),
            status: statuses.get_or_insert(name),
        })
    }

    /// Push `bytes` as the content of `name` if it changed. Returns true if pushed.
    fn pull(&mut self, name: &str, bytes: &[u8]) -> bool {
        let hash = ContentHash::of_bytes(bytes);
        let network_sets = Arc::clone(&self.network_sets);
        let ip_sets = Arc::clone(&self.ip_sets);
        let feed = self.state(name);

        let forced = feed.repull.swap(false, Ordering::SeqCst);
        if !forced && feed.hash.as_ref() == Some(&hash) {
            return false;
        }

        let parsed = parse_feed(&String::from_utf8_lossy(bytes));
        if let Some(first) = parsed.rejected.first() {
            warn!(
                feed = %name,
                rejected = parsed.rejected.len(),
                line = first.line,
                error = %first.error,
                "Skipping invalid feed entries"
            );
        }

        let on_fail = {
            let repull = Arc::clone(&feed.repull);
            fail_fn(move || repull.store(true, Ordering::SeqCst))
        };
        let status: Arc<dyn StatusSink> = feed.status.clone();
        let entries = parsed.entries.len();

        network_sets.add(
            GlobalNetworkSet::for_feed(name, parsed.entries.clone()),
            on_fail.clone(),
            Arc::clone(&status),
        );
        ip_sets.add(IpSet::for_feed(name, parsed.entries), on_fail, Arc::clone(&status));

        status.clear_error(PULL_FAILED);
        status.successful_sync();
        feed.hash = Some(hash);

        info!(feed = %name, entries, forced, "Pulled threat feed");
        true
    }

    fn pull_failed(&mut self, name: &str, path: &Path, error: &std::io::Error) {
        let network_sets = Arc::clone(&self.network_sets);
        let ip_sets = Arc::clone(&self.ip_sets);
        let feed = self.state(name);

        warn!(feed = %name, path = %path.display(), error = %error, "Failed to read feed");
        feed.status
            .error(PULL_FAILED, &format!("failed to read {}: {}", path.display(), error));

        // Keep whatever is stored remotely until the file can be read again.
        network_sets.mark_retained(&globalnetworkset::feed_key(name));
        ip_sets.mark_retained(&ipset::feed_key(name));
        feed.hash = None;
    }

    fn remove(&mut self, name: &str) {
        info!(feed = %name, "Feed removed, deleting its sets");
        self.network_sets.delete(&globalnetworkset::feed_key(name));
        self.ip_sets.delete(&ipset::feed_key(name));
        self.feeds.remove(name);
        self.statuses.remove(name);
    }
}

/// Regular files in `dir` whose names are usable as feed names, sorted by name.
async fn list_feed_files(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("Failed to read feeds directory {}", dir.display()))?;

    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("Failed to read feeds directory {}", dir.display()))?
    {
        let path = entry.path();
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        if !is_valid_feed_name(&name) {
            warn!(file = %path.display(), "Ignoring file with invalid feed name");
            continue;
        }
        // Follows symlinks, so linked feed files count.
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => files.push((name, path)),
            Ok(_) => {}
            // Unreadable entries still become feeds so the failure is recorded.
            Err(_) => files.push((name, path)),
        }
    }

    files.sort();
    Ok(files)
}

/// Feed names become object names: lowercase alphanumerics, `-` and `.`,
/// starting and ending with an alphanumeric.
pub fn is_valid_feed_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    let edge_ok = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit();

    !bytes.is_empty()
        && bytes.len() <= MAX_FEED_NAME_LEN
        && bytes.first().is_some_and(edge_ok)
        && bytes.last().is_some_and(edge_ok)
        && bytes
            .iter()
            .all(|b| edge_ok(b) || *b == b'-' || *b == b'.')
}
