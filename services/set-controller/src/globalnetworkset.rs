//! Cluster-wide network sets, one per threat feed.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use setkeeper_reconcile::{Resource, ResourceKey};

/// API group/version of network sets.
pub const API_VERSION: &str = "setkeeper.io/v1";

/// Object kind of network sets.
pub const KIND: &str = "GlobalNetworkSet";

/// Name prefix of sets derived from threat feeds.
pub const FEED_SET_PREFIX: &str = "threatfeed.";

/// Label carrying the originating feed name.
pub const FEED_LABEL: &str = "setkeeper.io/threatfeed";

/// Object metadata. Only the fields the controller reads or writes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

/// Network set spec.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalNetworkSetSpec {
    /// Normalized CIDRs.
    #[serde(default)]
    pub nets: Vec<String>,
}

/// A cluster-wide set of networks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalNetworkSet {
    #[serde(default = "default_api_version")]
    pub api_version: String,

    #[serde(default = "default_kind")]
    pub kind: String,

    pub metadata: ObjectMeta,

    #[serde(default)]
    pub spec: GlobalNetworkSetSpec,
}

fn default_api_version() -> String {
    API_VERSION.to_string()
}

fn default_kind() -> String {
    KIND.to_string()
}

impl GlobalNetworkSet {
    /// A set named `name` holding `nets`.
    pub fn new(name: impl Into<String>, nets: Vec<String>) -> Self {
        Self {
            api_version: default_api_version(),
            kind: default_kind(),
            metadata: ObjectMeta {
                name: name.into(),
                ..ObjectMeta::default()
            },
            spec: GlobalNetworkSetSpec { nets },
        }
    }

    /// The set for the threat feed `feed`.
    pub fn for_feed(feed: &str, nets: Vec<String>) -> Self {
        let mut set = Self::new(set_name(feed), nets);
        set.metadata
            .labels
            .insert(FEED_LABEL.to_string(), feed.to_string());
        set
    }
}

/// Set name for the threat feed `feed`.
pub fn set_name(feed: &str) -> String {
    format!("{FEED_SET_PREFIX}{feed}")
}

/// Resource key of the set for `feed`.
pub fn feed_key(feed: &str) -> ResourceKey {
    ResourceKey::new(set_name(feed))
}

impl Resource for GlobalNetworkSet {
    const KIND: &'static str = KIND;

    fn key(&self) -> ResourceKey {
        ResourceKey::new(self.metadata.name.as_str())
    }

    fn labels(&self) -> &BTreeMap<String, String> {
        &self.metadata.labels
    }

    fn labels_mut(&mut self) -> &mut BTreeMap<String, String> {
        &mut self.metadata.labels
    }

    fn resource_version(&self) -> Option<&str> {
        self.metadata.resource_version.as_deref()
    }

    fn set_resource_version(&mut self, version: Option<String>) {
        self.metadata.resource_version = version;
    }

    fn same_content(&self, other: &Self) -> bool {
        self.metadata.labels == other.metadata.labels && self.spec == other.spec
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_feed_names_and_labels() {
        let set = GlobalNetworkSet::for_feed("abuse-ch", vec!["1.2.3.4/32".to_string()]);

        assert_eq!(set.key().as_str(), "threatfeed.abuse-ch");
        assert_eq!(set.metadata.labels[FEED_LABEL], "abuse-ch");
        assert_eq!(feed_key("abuse-ch"), set.key());
    }

    #[test]
    fn test_same_content_ignores_server_metadata() {
        let want = GlobalNetworkSet::for_feed("a", vec!["10.0.0.0/8".to_string()]);
        let mut have = want.clone();
        have.metadata.resource_version = Some("812".to_string());
        have.metadata.uid = Some("5d1c".to_string());
        have.metadata.creation_timestamp = Some(Utc::now());

        assert!(want.same_content(&have));

        have.spec.nets.push("2000::/5".to_string());
        assert!(!want.same_content(&have));
    }

    #[test]
    fn test_wire_format() {
        let json = serde_json::json!({
            "apiVersion": "setkeeper.io/v1",
            "kind": "GlobalNetworkSet",
            "metadata": {
                "name": "threatfeed.a",
                "labels": {"setkeeper.io/creator": "setkeeper"},
                "resourceVersion": "42",
                "creationTimestamp": "2024-05-01T10:00:00Z",
                "uid": "0f9a"
            },
            "spec": {"nets": ["1.2.3.4/32"]}
        });

        let set: GlobalNetworkSet = serde_json::from_value(json).unwrap();
        assert_eq!(set.resource_version(), Some("42"));
        assert_eq!(set.spec.nets, vec!["1.2.3.4/32"]);

        let mut fresh = GlobalNetworkSet::new("threatfeed.b", vec![]);
        fresh.set_resource_version(None);
        let out = serde_json::to_value(&fresh).unwrap();
        assert_eq!(out["kind"], "GlobalNetworkSet");
        assert!(out["metadata"].get("resourceVersion").is_none());
        assert_eq!(out["spec"]["nets"], serde_json::json!([]));
    }
}
