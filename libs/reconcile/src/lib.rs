//! Reconciliation controller primitives.
//!
//! A controller keeps a remote store in sync with a locally tracked desired
//! state. Key concepts:
//!
//! - **Desired state**: what producers (feed pullers, recommenders) declare
//!   through a [`ControllerHandle`].
//! - **Actual state**: what the remote store holds, surfaced by a change feed.
//! - **Reconciliation**: diffing both for one key and issuing at most one
//!   create, update or delete.
//!
//! # Invariants
//!
//! - A remote resource is garbage collected only if it is observed, not
//!   desired, and not retained.
//! - At most one reconciliation is in flight per key (single worker per controller).
//! - A delete that finds nothing is a success.
//! - A failing key is retried with backoff at most [`DEFAULT_MAX_ATTEMPTS`]
//!   times by default, then its fail callback runs once.

pub mod backoff;
pub mod cache;
pub mod controller;
pub mod error;
pub mod feed;
pub mod memory;
pub mod queue;
pub mod resource;
pub mod status;
pub mod store;
pub mod tracker;

use std::time::Duration;

use sha2::{Digest, Sha256};

pub use backoff::{BackoffPolicy, RetryPolicy};
pub use controller::{
    Controller, ControllerConfig, ControllerHandle, KeyState, ReconcileStats, SetController,
};
pub use error::{FailureClass, Operation, ReconcileError, StoreError};
pub use feed::FeedMode;
pub use memory::{MemoryStore, TestSet};
pub use resource::{OwnerLabel, Resource, ResourceKey};
pub use status::{FeedStatus, StatusRecord, StatusSink};
pub use store::{Listing, RemoteStore, WatchEvent, WatchStream};
pub use tracker::FailFn;

/// Default number of attempts per key before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default period of polling change feeds.
pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(15);

/// A content hash for cheap change detection.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentHash(String);

impl ContentHash {
    /// Hash raw content.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        Self(format!("sha256:{}", hex::encode(&digest[..16])))
    }

    /// Get the hash string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wrap a closure as a [`FailFn`].
pub fn fail_fn(f: impl Fn() + Send + Sync + 'static) -> FailFn {
    std::sync::Arc::new(f)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_deterministic() {
        let a = ContentHash::of_bytes(b"1.2.3.4/32\n");
        let b = ContentHash::of_bytes(b"1.2.3.4/32\n");
        let c = ContentHash::of_bytes(b"5.6.7.8/32\n");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.as_str().starts_with("sha256:"));
        assert_eq!(a.as_str().len(), "sha256:".len() + 32);
    }
}
