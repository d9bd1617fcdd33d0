//! Remote store interface consumed by controllers.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_core::Stream;

use crate::error::StoreError;
use crate::resource::{OwnerLabel, Resource, ResourceKey};

/// Result of a full enumeration.
#[derive(Debug, Clone)]
pub struct Listing<R> {
    /// Owned resources currently in the store.
    pub items: Vec<R>,

    /// Collection version to resume a watch from, if the store has one.
    pub version: Option<String>,
}

impl<R> Listing<R> {
    /// A listing without a collection version.
    pub fn new(items: Vec<R>) -> Self {
        Self {
            items,
            version: None,
        }
    }
}

/// Incremental change notification.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<R> {
    Added(R),
    Modified(R),
    Deleted(R),
}

impl<R: Resource> WatchEvent<R> {
    /// Key of the affected resource.
    pub fn key(&self) -> ResourceKey {
        match self {
            WatchEvent::Added(r) | WatchEvent::Modified(r) | WatchEvent::Deleted(r) => r.key(),
        }
    }
}

/// Stream of watch events. Ends when the server closes the watch.
pub type WatchStream<R> = Pin<Box<dyn Stream<Item = Result<WatchEvent<R>, StoreError>> + Send>>;

/// Client for one resource kind in a backing store.
///
/// `list` and `watch` only surface resources carrying the owner label.
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    /// Resource kind managed through this store.
    type Resource: Resource;

    /// Enumerate all owned resources.
    async fn list(&self, owner: &OwnerLabel) -> Result<Listing<Self::Resource>, StoreError>;

    /// Stream changes to owned resources after collection version `since`.
    async fn watch(
        &self,
        _owner: &OwnerLabel,
        _since: Option<&str>,
    ) -> Result<WatchStream<Self::Resource>, StoreError> {
        Err(StoreError::Unsupported("watch"))
    }

    /// Create a resource. Returns the stored object with its server version.
    async fn create(&self, resource: &Self::Resource) -> Result<Self::Resource, StoreError>;

    /// Replace a resource, conditional on its resource version when set.
    async fn update(&self, resource: &Self::Resource) -> Result<Self::Resource, StoreError>;

    /// Delete a resource, conditional on `expected_version` when given.
    async fn delete(
        &self,
        key: &ResourceKey,
        expected_version: Option<&str>,
    ) -> Result<(), StoreError>;
}

#[async_trait]
impl<S: RemoteStore> RemoteStore for Arc<S> {
    type Resource = S::Resource;

    async fn list(&self, owner: &OwnerLabel) -> Result<Listing<Self::Resource>, StoreError> {
        (**self).list(owner).await
    }

    async fn watch(
        &self,
        owner: &OwnerLabel,
        since: Option<&str>,
    ) -> Result<WatchStream<Self::Resource>, StoreError> {
        (**self).watch(owner, since).await
    }

    async fn create(&self, resource: &Self::Resource) -> Result<Self::Resource, StoreError> {
        (**self).create(resource).await
    }

    async fn update(&self, resource: &Self::Resource) -> Result<Self::Resource, StoreError> {
        (**self).update(resource).await
    }

    async fn delete(
        &self,
        key: &ResourceKey,
        expected_version: Option<&str>,
    ) -> Result<(), StoreError> {
        (**self).delete(key, expected_version).await
    }
}
