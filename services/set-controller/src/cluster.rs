//! Cluster API adapter for network sets.
//!
//! Speaks the cluster's REST conventions:
//! - `GET {collection}?labelSelector=..` lists, returning a collection version
//! - `GET {collection}?watch=true&resourceVersion=..` streams newline-delimited
//!   JSON events (`{"type": "ADDED", "object": {..}}`)
//! - `POST {collection}` creates, `PUT {collection}/{name}` replaces
//! - `DELETE {collection}/{name}` with a resource-version precondition

use std::pin::Pin;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use setkeeper_reconcile::{
    Listing, OwnerLabel, RemoteStore, Resource, ResourceKey, StoreError, WatchEvent, WatchStream,
};
use tracing::{debug, instrument, warn};

use crate::config::Config;
use crate::globalnetworkset::GlobalNetworkSet;
use crate::http::{decode, status_error, transport};

/// Collection path of network sets.
pub const COLLECTION_PATH: &str = "/apis/setkeeper.io/v1/globalnetworksets";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Server-side watch timeout. The feed relists when the server closes the stream.
const WATCH_TIMEOUT_SECS: u64 = 300;

/// Longest watch event line accepted before the stream is abandoned.
const MAX_WATCH_LINE_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Deserialize)]
struct ObjectList<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,

    #[serde(default)]
    metadata: ListMeta,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListMeta {
    #[serde(default)]
    resource_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireEvent {
    #[serde(rename = "type")]
    event_type: String,
    object: serde_json::Value,
}

/// Cluster API client for [`GlobalNetworkSet`]s.
#[derive(Debug, Clone)]
pub struct ClusterStore {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl ClusterStore {
    /// Create a client for the cluster API at `base_url`.
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("Failed to build cluster API client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Create a client from service configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(config.cluster_api_url.clone(), config.cluster_token.clone())
    }

    fn collection_url(&self) -> String {
        format!("{}{}", self.base_url, COLLECTION_PATH)
    }

    fn object_url(&self, name: &str) -> String {
        format!("{}{}/{}", self.base_url, COLLECTION_PATH, name)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send_for_object(
        &self,
        what: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<GlobalNetworkSet, StoreError> {
        let response = self
            .authorized(request)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(transport)?;

        if !response.status().is_success() {
            return Err(status_error(what, response).await);
        }

        response.json().await.map_err(decode)
    }
}

#[async_trait]
impl RemoteStore for ClusterStore {
    type Resource = GlobalNetworkSet;

    #[instrument(skip(self, owner), fields(owner = %owner))]
    async fn list(&self, owner: &OwnerLabel) -> Result<Listing<GlobalNetworkSet>, StoreError> {
        let request = self
            .client
            .get(self.collection_url())
            .query(&[("labelSelector", owner.selector())]);
        let response = self
            .authorized(request)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(transport)?;

        if !response.status().is_success() {
            return Err(status_error("list network sets", response).await);
        }

        let list: ObjectList<GlobalNetworkSet> = response.json().await.map_err(decode)?;
        debug!(
            count = list.items.len(),
            version = ?list.metadata.resource_version,
            "Listed network sets"
        );

        Ok(Listing {
            items: list.items,
            version: list.metadata.resource_version,
        })
    }

    #[instrument(skip(self, owner), fields(owner = %owner))]
    async fn watch(
        &self,
        owner: &OwnerLabel,
        since: Option<&str>,
    ) -> Result<WatchStream<GlobalNetworkSet>, StoreError> {
        let mut query = vec![
            ("watch", "true".to_string()),
            ("labelSelector", owner.selector()),
            ("timeoutSeconds", WATCH_TIMEOUT_SECS.to_string()),
        ];
        if let Some(version) = since {
            query.push(("resourceVersion", version.to_string()));
        }

        let request = self.client.get(self.collection_url()).query(&query);
        let response = self.authorized(request).send().await.map_err(transport)?;

        if !response.status().is_success() {
            return Err(status_error("watch network sets", response).await);
        }

        let events = ndjson_lines(Box::pin(response.bytes_stream()), MAX_WATCH_LINE_BYTES)
            .filter_map(|line| async move { line.and_then(|l| parse_event(&l)).transpose() });
        Ok(Box::pin(events))
    }

    #[instrument(skip(self, resource), fields(key = %resource.key()))]
    async fn create(&self, resource: &GlobalNetworkSet) -> Result<GlobalNetworkSet, StoreError> {
        let request = self.client.post(self.collection_url()).json(resource);
        self.send_for_object("create network set", request).await
    }

    #[instrument(skip(self, resource), fields(key = %resource.key()))]
    async fn update(&self, resource: &GlobalNetworkSet) -> Result<GlobalNetworkSet, StoreError> {
        let request = self
            .client
            .put(self.object_url(&resource.metadata.name))
            .json(resource);
        self.send_for_object("update network set", request).await
    }

    #[instrument(skip(self, key), fields(key = %key))]
    async fn delete(
        &self,
        key: &ResourceKey,
        expected_version: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut request = self.client.delete(self.object_url(key.as_str()));
        if let Some(version) = expected_version {
            request = request.json(&serde_json::json!({
                "kind": "DeleteOptions",
                "apiVersion": "v1",
                "preconditions": { "resourceVersion": version },
            }));
        }

        let response = self
            .authorized(request)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(transport)?;

        if !response.status().is_success() {
            return Err(status_error("delete network set", response).await);
        }
        Ok(())
    }
}

/// Decode one watch line. Returns `Ok(None)` for lines that carry no change.
fn parse_event(line: &[u8]) -> Result<Option<WatchEvent<GlobalNetworkSet>>, StoreError> {
    if line.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }

    let event: WireEvent = serde_json::from_slice(line).map_err(decode)?;
    let object = || serde_json::from_value::<GlobalNetworkSet>(event.object.clone());

    match event.event_type.as_str() {
        "ADDED" => object().map(|o| Some(WatchEvent::Added(o))).map_err(decode),
        "MODIFIED" => object().map(|o| Some(WatchEvent::Modified(o))).map_err(decode),
        "DELETED" => object().map(|o| Some(WatchEvent::Deleted(o))).map_err(decode),
        "BOOKMARK" => Ok(None),
        "ERROR" => {
            let message = event
                .object
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("watch error")
                .to_string();
            Err(StoreError::Unavailable(message))
        }
        other => {
            warn!(event_type = %other, "Ignoring unknown watch event type");
            Ok(None)
        }
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

struct LineReader {
    body: ByteStream,
    buf: Vec<u8>,
    done: bool,
}

/// Split a response body into newline-terminated lines.
///
/// A transport error, or a line longer than `max_line` bytes, is yielded once
/// and ends the stream.
fn ndjson_lines(
    body: ByteStream,
    max_line: usize,
) -> impl Stream<Item = Result<Vec<u8>, StoreError>> + Send {
    let reader = LineReader {
        body,
        buf: Vec::new(),
        done: false,
    };

    stream::unfold(reader, move |mut reader| async move {
        loop {
            if let Some(pos) = reader.buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = reader.buf.drain(..=pos).collect();
                return Some((Ok(line), reader));
            }
            if reader.buf.len() > max_line {
                let len = reader.buf.len();
                reader.done = true;
                reader.buf.clear();
                return Some((
                    Err(StoreError::Decode(format!(
                        "watch line exceeds {max_line} bytes ({len} buffered)"
                    ))),
                    reader,
                ));
            }
            if reader.done {
                if reader.buf.is_empty() {
                    return None;
                }
                let rest = std::mem::take(&mut reader.buf);
                return Some((Ok(rest), reader));
            }
            match reader.body.next().await {
                Some(Ok(chunk)) => reader.buf.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    reader.done = true;
                    reader.buf.clear();
                    return Some((Err(transport(e)), reader));
                }
                None => reader.done = true,
            }
        }
    })
}
