//! Search backend adapter for IP sets.
//!
//! Documents live in one index per cluster. Writes are optimistic: the
//! document's `_seq_no`/`_primary_term` pair is its version, and updates and
//! deletes carry it as `if_seq_no`/`if_primary_term`.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use setkeeper_reconcile::{Listing, OwnerLabel, RemoteStore, Resource, ResourceKey, StoreError};
use tracing::{debug, instrument};

use crate::config::Config;
use crate::http::{decode, status_error, transport};
use crate::ipset::{self, format_version, parse_version, IpSet, IpSetDocument};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Documents fetched per scroll page.
const SCROLL_PAGE_SIZE: usize = 500;

/// Lifetime of a scroll context between pages.
const SCROLL_KEEP_ALIVE: &str = "1m";

/// Overwrites members and labels outright. The stored creation time is kept.
const REPLACE_SCRIPT: &str = "ctx._source.ips = params.ips; ctx._source.labels = params.labels";

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(rename = "_scroll_id")]
    scroll_id: Option<String>,
    hits: Hits,
}

#[derive(Debug, Deserialize)]
struct Hits {
    #[serde(default)]
    hits: Vec<Hit>,
}

#[derive(Debug, Deserialize)]
struct Hit {
    #[serde(rename = "_id")]
    id: String,

    #[serde(rename = "_seq_no")]
    seq_no: Option<u64>,

    #[serde(rename = "_primary_term")]
    primary_term: Option<u64>,

    #[serde(rename = "_source", default)]
    source: IpSetDocument,
}

#[derive(Debug, Deserialize)]
struct WriteResponse {
    #[serde(rename = "_seq_no")]
    seq_no: u64,

    #[serde(rename = "_primary_term")]
    primary_term: u64,
}

/// Search backend client for [`IpSet`]s.
#[derive(Debug, Clone)]
pub struct ElasticStore {
    client: reqwest::Client,
    base_url: String,
    index: String,
    credentials: Option<(String, Option<String>)>,
}

impl ElasticStore {
    /// Create a client for the backend at `base_url`, storing sets of `cluster`.
    pub fn new(base_url: impl Into<String>, cluster: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build search backend client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            index: ipset::index_name(cluster),
            credentials: None,
        })
    }

    /// Authenticate with HTTP basic auth.
    pub fn with_basic_auth(mut self, username: impl Into<String>, password: Option<String>) -> Self {
        self.credentials = Some((username.into(), password));
        self
    }

    /// Create a client from service configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let store = Self::new(config.elastic_url.clone(), &config.cluster_name)?;
        Ok(match &config.elastic_username {
            Some(username) => store.with_basic_auth(username, config.elastic_password.clone()),
            None => store,
        })
    }

    /// Index holding the sets.
    pub fn index(&self) -> &str {
        &self.index
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.credentials {
            Some((username, password)) => request.basic_auth(username, password.as_ref()),
            None => request,
        }
    }

    async fn send(
        &self,
        what: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, StoreError> {
        let response = self.authorized(request).send().await.map_err(transport)?;
        if !response.status().is_success() {
            return Err(status_error(what, response).await);
        }
        Ok(response)
    }

    async fn clear_scroll(&self, scroll_id: String) {
        let request = self
            .client
            .delete(self.url("/_search/scroll"))
            .json(&serde_json::json!({ "scroll_id": [scroll_id] }));
        if let Err(e) = self.send("clear scroll", request).await {
            debug!(error = %e, "Failed to clear scroll context");
        }
    }

    fn version_query(version: Option<&str>) -> Result<Vec<(&'static str, String)>, StoreError> {
        let Some(version) = version else {
            return Ok(Vec::new());
        };
        let (seq_no, primary_term) = parse_version(version)
            .ok_or_else(|| StoreError::Decode(format!("malformed document version: {version}")))?;
        Ok(vec![
            ("if_seq_no", seq_no.to_string()),
            ("if_primary_term", primary_term.to_string()),
        ])
    }
}

fn replace_script(resource: &IpSet) -> serde_json::Value {
    serde_json::json!({
        "script": {
            "source": REPLACE_SCRIPT,
            "lang": "painless",
            "params": {
                "ips": resource.ips,
                "labels": resource.labels,
            },
        },
    })
}

#[async_trait]
impl RemoteStore for ElasticStore {
    type Resource = IpSet;

    #[instrument(skip(self, owner), fields(index = %self.index))]
    async fn list(&self, owner: &OwnerLabel) -> Result<Listing<IpSet>, StoreError> {
        let request = self
            .authorized(
                self.client
                    .post(self.url(&format!("/{}/_search", self.index)))
                    .query(&[("scroll", SCROLL_KEEP_ALIVE)])
                    .json(&serde_json::json!({
                        "size": SCROLL_PAGE_SIZE,
                        "seq_no_primary_term": true,
                        "query": { "match_all": {} },
                    })),
            );
        let response = request.send().await.map_err(transport)?;

        // The index is created lazily by the first write.
        if response.status() == StatusCode::NOT_FOUND {
            debug!("IP set index does not exist yet");
            return Ok(Listing::new(Vec::new()));
        }
        if !response.status().is_success() {
            return Err(status_error("search IP sets", response).await);
        }

        let mut page: SearchResponse = response.json().await.map_err(decode)?;
        let mut items = Vec::new();
        let mut scroll_id = page.scroll_id.take();

        loop {
            let done = page.hits.hits.len() < SCROLL_PAGE_SIZE;
            for hit in page.hits.hits {
                if !owner.matches(&hit.source.labels) {
                    continue;
                }
                let version = match (hit.seq_no, hit.primary_term) {
                    (Some(seq_no), Some(primary_term)) => Some(format_version(seq_no, primary_term)),
                    _ => None,
                };
                items.push(IpSet::from_document(hit.id, hit.source, version));
            }

            let Some(id) = scroll_id.clone().filter(|_| !done) else {
                break;
            };
            let request = self
                .client
                .post(self.url("/_search/scroll"))
                .json(&serde_json::json!({ "scroll": SCROLL_KEEP_ALIVE, "scroll_id": id }));
            let next = self.send("scroll IP sets", request).await;
            page = match next {
                Ok(response) => response.json().await.map_err(decode)?,
                Err(e) => {
                    self.clear_scroll(id).await;
                    return Err(e);
                }
            };
            if let Some(next_id) = page.scroll_id.take() {
                scroll_id = Some(next_id);
            }
        }

        if let Some(id) = scroll_id {
            self.clear_scroll(id).await;
        }

        debug!(count = items.len(), "Listed IP sets");
        Ok(Listing::new(items))
    }

    #[instrument(skip(self, resource), fields(index = %self.index, key = %resource.key()))]
    async fn create(&self, resource: &IpSet) -> Result<IpSet, StoreError> {
        let document = resource.to_document();
        let request = self
            .client
            .put(self.url(&format!("/{}/_create/{}", self.index, resource.name)))
            .query(&[("refresh", "wait_for")])
            .json(&document);
        let response = self.send("create IP set", request).await?;
        let written: WriteResponse = response.json().await.map_err(decode)?;

        Ok(IpSet::from_document(
            resource.name.clone(),
            document,
            Some(format_version(written.seq_no, written.primary_term)),
        ))
    }

    #[instrument(skip(self, resource), fields(index = %self.index, key = %resource.key()))]
    async fn update(&self, resource: &IpSet) -> Result<IpSet, StoreError> {
        let query = Self::version_query(resource.resource_version())?;

        let request = self
            .client
            .post(self.url(&format!("/{}/_update/{}", self.index, resource.name)))
            .query(&query)
            .query(&[("refresh", "wait_for")])
            .json(&replace_script(resource));
        let response = self.send("update IP set", request).await?;
        let written: WriteResponse = response.json().await.map_err(decode)?;

        let mut stored = resource.clone();
        stored.version = Some(format_version(written.seq_no, written.primary_term));
        Ok(stored)
    }

    #[instrument(skip(self, key), fields(index = %self.index, key = %key))]
    async fn delete(
        &self,
        key: &ResourceKey,
        expected_version: Option<&str>,
    ) -> Result<(), StoreError> {
        let query = Self::version_query(expected_version)?;
        let request = self
            .client
            .delete(self.url(&format!("/{}/_doc/{}", self.index, key)))
            .query(&query)
            .query(&[("refresh", "wait_for")]);
        self.send("delete IP set", request).await?;
        Ok(())
    }
}
