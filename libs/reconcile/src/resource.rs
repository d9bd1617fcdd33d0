//! Resource keys, ownership labels, and the trait every managed kind implements.

use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable identifier of one managed resource instance.
///
/// Used as the map key in every cache and as the work-queue dedup token.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceKey(String);

impl ResourceKey {
    /// Create a key from any string-like value.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Get the key string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ResourceKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Borrow<str> for ResourceKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for ResourceKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Label key/value pair identifying a controller as the creator of a resource.
///
/// Every resource a controller creates carries this label, and list/watch are
/// scoped to it, so a controller never observes or deletes foreign objects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerLabel {
    pub key: String,
    pub value: String,
}

impl OwnerLabel {
    /// Create an ownership label.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Returns true if the label set carries this owner label.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        labels.get(&self.key).is_some_and(|v| v == &self.value)
    }

    /// Render as a `key=value` selector.
    pub fn selector(&self) -> String {
        format!("{}={}", self.key, self.value)
    }
}

impl fmt::Display for OwnerLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// A resource kind managed by a controller.
///
/// Implementations separate content (labels and spec, owned by the producer)
/// from server-assigned metadata (versions, timestamps). Only content takes
/// part in [`Resource::same_content`], otherwise reconciliation would chase
/// fields the server rewrites on every write.
pub trait Resource: Clone + fmt::Debug + Send + Sync + 'static {
    /// Kind name used in logs.
    const KIND: &'static str;

    /// Key of this resource.
    fn key(&self) -> ResourceKey;

    /// Resource labels.
    fn labels(&self) -> &BTreeMap<String, String>;

    /// Mutable resource labels.
    fn labels_mut(&mut self) -> &mut BTreeMap<String, String>;

    /// Server-assigned version, if the resource came from the store.
    fn resource_version(&self) -> Option<&str>;

    /// Replace the server-assigned version.
    fn set_resource_version(&mut self, version: Option<String>);

    /// Compare labels and spec, ignoring server-assigned fields.
    fn same_content(&self, other: &Self) -> bool;

    /// Stamp the ownership label onto this resource.
    fn stamp_owner(&mut self, owner: &OwnerLabel) {
        self.labels_mut()
            .insert(owner.key.clone(), owner.value.clone());
    }

    /// Returns true if this resource carries the ownership label.
    fn is_owned_by(&self, owner: &OwnerLabel) -> bool {
        owner.matches(self.labels())
    }
}
