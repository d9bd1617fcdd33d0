//! IP sets stored as search-backend documents, one per threat feed.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use setkeeper_reconcile::{Resource, ResourceKey};

/// Index name pattern; the cluster name is appended.
pub const INDEX_PREFIX: &str = ".setkeeper.ipset.";

/// Index holding the IP sets of `cluster`.
pub fn index_name(cluster: &str) -> String {
    format!("{INDEX_PREFIX}{cluster}")
}

/// An IP set. The document id is the feed name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpSet {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub ips: Vec<String>,

    /// `"<seq_no>:<primary_term>"` of the stored document.
    pub version: Option<String>,

    pub created_at: Option<DateTime<Utc>>,
}

/// Stored document body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpSetDocument {
    #[serde(default)]
    pub ips: Vec<String>,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl IpSet {
    /// The set for the threat feed `feed`.
    pub fn for_feed(feed: &str, ips: Vec<String>) -> Self {
        Self {
            name: feed.to_string(),
            labels: BTreeMap::new(),
            ips,
            version: None,
            created_at: None,
        }
    }

    /// Rebuild a set from a stored document.
    pub fn from_document(name: impl Into<String>, doc: IpSetDocument, version: Option<String>) -> Self {
        Self {
            name: name.into(),
            labels: doc.labels,
            ips: doc.ips,
            version,
            created_at: doc.created_at,
        }
    }

    /// Document body to store. A missing creation time is stamped now.
    pub fn to_document(&self) -> IpSetDocument {
        IpSetDocument {
            ips: self.ips.clone(),
            labels: self.labels.clone(),
            created_at: Some(self.created_at.unwrap_or_else(Utc::now)),
        }
    }
}

/// Resource key of the IP set for `feed`.
pub fn feed_key(feed: &str) -> ResourceKey {
    ResourceKey::new(feed)
}

impl Resource for IpSet {
    const KIND: &'static str = "IPSet";

    fn key(&self) -> ResourceKey {
        ResourceKey::new(self.name.as_str())
    }

    fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    fn labels_mut(&mut self) -> &mut BTreeMap<String, String> {
        &mut self.labels
    }

    fn resource_version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    fn set_resource_version(&mut self, version: Option<String>) {
        self.version = version;
    }

    fn same_content(&self, other: &Self) -> bool {
        self.labels == other.labels && self.ips == other.ips
    }
}

/// Split a `"<seq_no>:<primary_term>"` version.
pub fn parse_version(version: &str) -> Option<(u64, u64)> {
    let (seq_no, primary_term) = version.split_once(':')?;
    Some((seq_no.parse().ok()?, primary_term.parse().ok()?))
}

/// Format a document version.
pub fn format_version(seq_no: u64, primary_term: u64) -> String {
    format!("{seq_no}:{primary_term}")
}
