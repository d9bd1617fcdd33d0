//! setkeeper set controller.
//!
//! Keeps two remote stores in sync with the threat feeds found on disk:
//!
//! - **Network sets** in the cluster API, one `threatfeed.<feed>` object per
//!   feed, driven by a watch on the cluster API.
//! - **IP sets** in the search backend, one document per feed, driven by a
//!   periodic re-list.
//!
//! Both controllers only touch objects carrying the [`OWNER_LABEL_KEY`] label.

pub mod cluster;
pub mod config;
pub mod elastic;
pub mod feeds;
pub mod globalnetworkset;
mod http;
pub mod ipset;
pub mod status_report;

use std::sync::Arc;

use anyhow::{Context, Result};
use setkeeper_reconcile::status::{ELASTIC_SYNC_FAILED, GLOBAL_NETWORK_SET_SYNC_FAILED};
use setkeeper_reconcile::{Controller, ControllerConfig, FeedMode, OwnerLabel};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::cluster::ClusterStore;
use crate::config::Config;
use crate::elastic::ElasticStore;
use crate::feeds::FeedProducer;
use crate::status_report::{FeedStatuses, StatusReporter};

/// Label key stamped on every object this controller creates.
pub const OWNER_LABEL_KEY: &str = "setkeeper.io/creator";

/// Label value stamped on every object this controller creates.
pub const OWNER_LABEL_VALUE: &str = "setkeeper";

/// Ownership label of this controller.
pub fn owner_label() -> OwnerLabel {
    OwnerLabel::new(OWNER_LABEL_KEY, OWNER_LABEL_VALUE)
}

/// Network-set controller configuration: watch-driven, GC held until the
/// first feed scan.
pub fn network_set_controller_config(config: &Config) -> ControllerConfig {
    let mut controller =
        ControllerConfig::new("globalnetworksets", owner_label(), GLOBAL_NETWORK_SET_SYNC_FAILED);
    controller.retry.max_attempts = config.max_attempts;
    controller.feed = FeedMode::default();
    controller.hold_gc_until_ready = true;
    controller
}

/// IP-set controller configuration: re-lists every reconcile period, GC held
/// until the first feed scan.
pub fn ip_set_controller_config(config: &Config) -> ControllerConfig {
    let mut controller = ControllerConfig::new("ipsets", owner_label(), ELASTIC_SYNC_FAILED);
    controller.retry.max_attempts = config.max_attempts;
    controller.feed = FeedMode::poll(config.elastic_reconcile_period);
    controller.hold_gc_until_ready = true;
    controller
}

type TaskResult = (&'static str, Result<()>);

/// The running service: both controllers, the feed producer and the status reporter.
pub struct Daemon {
    tasks: JoinSet<TaskResult>,
}

impl Daemon {
    /// Build every component from `config` and spawn it under `shutdown`.
    pub fn start(config: &Config, shutdown: watch::Receiver<bool>) -> Result<Self> {
        let cluster = ClusterStore::from_config(config).context("Failed to create cluster store")?;
        let elastic = ElasticStore::from_config(config).context("Failed to create search store")?;
        info!(index = %elastic.index(), "IP sets index");

        let network_controller = Controller::new(cluster, network_set_controller_config(config));
        let ip_controller = Controller::new(elastic, ip_set_controller_config(config));
        let network_sets = network_controller.handle();
        let ip_sets = ip_controller.handle();

        let statuses = FeedStatuses::new();
        let producer = FeedProducer::new(
            config.feeds_dir.clone(),
            config.feed_poll_interval,
            Arc::new(network_sets.clone()),
            Arc::new(ip_sets.clone()),
            statuses.clone(),
        );
        let reporter = StatusReporter::new(
            statuses,
            config.status_interval,
            config.status_file.clone(),
        )
        .with_controller(network_sets)
        .with_controller(ip_sets);

        let mut tasks = JoinSet::new();
        tasks.spawn({
            let shutdown = shutdown.clone();
            async move {
                let result = network_controller.run(shutdown).await;
                ("network-set controller", result.map_err(Into::into))
            }
        });
        tasks.spawn({
            let shutdown = shutdown.clone();
            async move {
                let result = ip_controller.run(shutdown).await;
                ("ip-set controller", result.map_err(Into::into))
            }
        });
        tasks.spawn({
            let shutdown = shutdown.clone();
            async move {
                producer.run(shutdown).await;
                ("feed producer", Ok(()))
            }
        });
        tasks.spawn(async move {
            reporter.run(shutdown).await;
            ("status reporter", Ok(()))
        });

        Ok(Self { tasks })
    }

    /// Wait for the next task to exit.
    ///
    /// Returns `None` once every task has exited. A panicked task is reported
    /// as an error.
    pub async fn next_exit(&mut self) -> Option<TaskResult> {
        let joined = self.tasks.join_next().await?;
        Some(match joined {
            Ok(exit) => exit,
            Err(e) => ("task", Err(anyhow::Error::new(e).context("Task panicked"))),
        })
    }

    /// Wait for every remaining task. Returns the first failure.
    pub async fn wait(mut self) -> Result<()> {
        let mut first_error = None;
        while let Some((task, result)) = self.next_exit().await {
            match result {
                Ok(()) => info!(task, "Task stopped"),
                Err(e) => {
                    error!(task, error = %e, "Task failed");
                    first_error.get_or_insert(e.context(task));
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
