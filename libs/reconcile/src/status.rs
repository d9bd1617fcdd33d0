//! Per-feed status: last-success timestamps and named error conditions.
//!
//! Controllers record failures against the status sink passed in with each
//! desired entry; health reporting reads snapshots through [`StatusSink::status`].

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A feed could not be pulled.
pub const PULL_FAILED: &str = "PullFailed";

/// A search against the backend failed.
pub const SEARCH_FAILED: &str = "SearchFailed";

/// A network set could not be synchronized to the cluster API.
pub const GLOBAL_NETWORK_SET_SYNC_FAILED: &str = "GlobalNetworkSetSyncFailed";

/// An IP set could not be synchronized to the search backend.
pub const ELASTIC_SYNC_FAILED: &str = "ElasticSyncFailed";

/// One named error condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCondition {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
}

/// Snapshot of one feed's status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRecord {
    pub last_successful_sync: Option<DateTime<Utc>>,
    pub last_successful_search: Option<DateTime<Utc>>,
    pub error_conditions: Vec<ErrorCondition>,
}

impl StatusRecord {
    /// Find the condition with the given type.
    pub fn condition(&self, error_type: &str) -> Option<&ErrorCondition> {
        self.error_conditions
            .iter()
            .find(|c| c.error_type == error_type)
    }

    /// Returns true if any error condition is set.
    pub fn has_errors(&self) -> bool {
        !self.error_conditions.is_empty()
    }
}

/// Status interface shared by producers, controllers and health reporting.
///
/// Implementations serialize their own mutation.
pub trait StatusSink: Send + Sync {
    /// Snapshot the current status.
    fn status(&self) -> StatusRecord;

    /// Record a successful sync.
    fn successful_sync(&self);

    /// Record a successful search.
    fn successful_search(&self);

    /// Set the condition `error_type`, replacing any previous one of that type.
    fn error(&self, error_type: &str, err: &dyn fmt::Display);

    /// Remove the condition `error_type`, if present.
    fn clear_error(&self, error_type: &str);
}

/// In-memory [`StatusSink`] for one feed.
#[derive(Debug, Default)]
pub struct FeedStatus {
    name: String,
    record: Mutex<StatusRecord>,
}

impl FeedStatus {
    /// Create an empty status for the feed `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            record: Mutex::new(StatusRecord::default()),
        }
    }

    /// Feed name.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, StatusRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StatusSink for FeedStatus {
    fn status(&self) -> StatusRecord {
        self.lock().clone()
    }

    fn successful_sync(&self) {
        self.lock().last_successful_sync = Some(Utc::now());
    }

    fn successful_search(&self) {
        self.lock().last_successful_search = Some(Utc::now());
    }

    fn error(&self, error_type: &str, err: &dyn fmt::Display) {
        let message = err.to_string();
        let mut record = self.lock();
        match record
            .error_conditions
            .iter_mut()
            .find(|c| c.error_type == error_type)
        {
            Some(condition) => condition.message = message,
            None => record.error_conditions.push(ErrorCondition {
                error_type: error_type.to_string(),
                message,
            }),
        }
    }

    fn clear_error(&self, error_type: &str) {
        self.lock()
            .error_conditions
            .retain(|c| c.error_type != error_type);
    }
}
