//! Set controller configuration.
//!
//! Every value comes from a `SETKEEPER_*` environment variable with a default.

use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};

/// Set controller configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Cluster API base URL (example: http://localhost:8001).
    pub cluster_api_url: String,

    /// Bearer token for the cluster API.
    pub cluster_token: Option<String>,

    /// Search backend base URL (example: http://localhost:9200).
    pub elastic_url: String,

    /// Basic-auth user for the search backend.
    pub elastic_username: Option<String>,

    /// Basic-auth password for the search backend.
    pub elastic_password: Option<String>,

    /// Cluster name, used as the IP-set index suffix.
    pub cluster_name: String,

    /// Directory holding one file per threat feed.
    pub feeds_dir: PathBuf,

    /// How often the feeds directory is rescanned.
    pub feed_poll_interval: Duration,

    /// How often the IP-set controller re-lists the search backend.
    pub elastic_reconcile_period: Duration,

    /// Attempts per key before the fail callback runs.
    pub max_attempts: u32,

    /// Optional file the status snapshot is written to.
    pub status_file: Option<PathBuf>,

    /// How often feed status is reported.
    pub status_interval: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let cluster_api_url = var("SETKEEPER_CLUSTER_API_URL")
            .unwrap_or_else(|| "http://localhost:8001".to_string());
        let cluster_token = var("SETKEEPER_CLUSTER_TOKEN").filter(|v| !v.is_empty());

        let elastic_url =
            var("SETKEEPER_ELASTIC_URL").unwrap_or_else(|| "http://localhost:9200".to_string());
        let elastic_username = var("SETKEEPER_ELASTIC_USERNAME").filter(|v| !v.is_empty());
        let elastic_password = var("SETKEEPER_ELASTIC_PASSWORD").filter(|v| !v.is_empty());

        let cluster_name = var("SETKEEPER_CLUSTER_NAME").unwrap_or_else(|| "cluster".to_string());
        if cluster_name.is_empty() {
            anyhow::bail!("SETKEEPER_CLUSTER_NAME must not be empty.");
        }

        let feeds_dir = var("SETKEEPER_FEEDS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/etc/setkeeper/feeds"));

        let feed_poll_secs: u64 = var("SETKEEPER_FEED_POLL_INTERVAL_SECS")
            .map(|v| v.parse())
            .transpose()
            .context("SETKEEPER_FEED_POLL_INTERVAL_SECS must be an integer (seconds).")?
            .unwrap_or(60);

        let elastic_reconcile_secs: u64 = var("SETKEEPER_ELASTIC_RECONCILE_SECS")
            .map(|v| v.parse())
            .transpose()
            .context("SETKEEPER_ELASTIC_RECONCILE_SECS must be an integer (seconds).")?
            .unwrap_or(15);

        let max_attempts: u32 = var("SETKEEPER_MAX_ATTEMPTS")
            .map(|v| v.parse())
            .transpose()
            .context("SETKEEPER_MAX_ATTEMPTS must be an integer.")?
            .unwrap_or(setkeeper_reconcile::DEFAULT_MAX_ATTEMPTS)
            .max(1);

        let status_file = var("SETKEEPER_STATUS_FILE")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        let status_secs: u64 = var("SETKEEPER_STATUS_INTERVAL_SECS")
            .map(|v| v.parse())
            .transpose()
            .context("SETKEEPER_STATUS_INTERVAL_SECS must be an integer (seconds).")?
            .unwrap_or(30);

        let log_level = var("SETKEEPER_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            cluster_api_url: cluster_api_url.trim_end_matches('/').to_string(),
            cluster_token,
            elastic_url: elastic_url.trim_end_matches('/').to_string(),
            elastic_username,
            elastic_password,
            cluster_name,
            feeds_dir,
            feed_poll_interval: Duration::from_secs(feed_poll_secs.max(1)),
            elastic_reconcile_period: Duration::from_secs(elastic_reconcile_secs.max(1)),
            max_attempts,
            status_file,
            status_interval: Duration::from_secs(status_secs.max(1)),
            log_level,
        })
    }
}
