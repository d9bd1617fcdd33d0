//! Search backend adapter tests against a mock server.

use serde_json::json;
use setkeeper_reconcile::{RemoteStore, Resource, ResourceKey, StoreError};
use setkeeper_set_controller::elastic::ElasticStore;
use setkeeper_set_controller::ipset::IpSet;
use setkeeper_set_controller::owner_label;
use wiremock::matchers::{body_json, body_partial_json, header_exists, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const INDEX: &str = ".setkeeper.ipset.test";

fn store(server: &MockServer) -> ElasticStore {
    ElasticStore::new(server.uri(), "test")
        .unwrap()
        .with_basic_auth("elastic", Some("changeme".to_string()))
}

fn hit(id: &str, seq_no: u64, owned: bool) -> serde_json::Value {
    let labels = if owned {
        json!({"setkeeper.io/creator": "setkeeper"})
    } else {
        json!({})
    };
    json!({
        "_id": id,
        "_seq_no": seq_no,
        "_primary_term": 1,
        "_source": {
            "ips": ["1.2.3.4/32"],
            "labels": labels,
            "created_at": "2024-05-01T10:00:00Z",
        },
    })
}

fn owned_set(name: &str, ips: &[&str]) -> IpSet {
    let mut set = IpSet::for_feed(name, ips.iter().map(|ip| ip.to_string()).collect());
    set.stamp_owner(&owner_label());
    set
}

#[tokio::test]
async fn missing_index_lists_empty() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("/{INDEX}/_search")))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error": {"type": "index_not_found_exception"},
            "status": 404,
        })))
        .expect(1)
        .mount(&server)
        .await;

    let listing = store(&server).list(&owner_label()).await.unwrap();
    assert!(listing.items.is_empty());
    assert!(listing.version.is_none());
}

#[tokio::test]
async fn list_follows_scroll_and_filters_foreign_documents() {
    let server = MockServer::start().await;

    let first_page: Vec<_> = (0..500)
        .map(|i| hit(&format!("feed-{i}"), i, i % 2 == 0))
        .collect();
    Mock::given(method("POST"))
        .and(path(format!("/{INDEX}/_search")))
        .and(query_param("scroll", "1m"))
        .and(header_exists("authorization"))
        .and(body_partial_json(json!({"seq_no_primary_term": true})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "_scroll_id": "scroll-1",
            "hits": {"hits": first_page},
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/_search/scroll"))
        .and(body_partial_json(json!({"scroll_id": "scroll-1"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "_scroll_id": "scroll-2",
            "hits": {"hits": [hit("feed-last", 900, true)]},
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/_search/scroll"))
        .and(body_partial_json(json!({"scroll_id": ["scroll-2"]})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"succeeded": true})))
        .expect(1)
        .mount(&server)
        .await;

    let listing = store(&server).list(&owner_label()).await.unwrap();

    assert_eq!(listing.items.len(), 251);
    let last = listing.items.last().unwrap();
    assert_eq!(last.key().as_str(), "feed-last");
    assert_eq!(last.resource_version(), Some("900:1"));
    assert!(last.created_at.is_some());
}

#[tokio::test]
async fn create_uses_create_endpoint_and_returns_version() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path(format!("/{INDEX}/_create/feed-a")))
        .and(body_partial_json(json!({
            "ips": ["1.2.3.4/32"],
            "labels": {"setkeeper.io/creator": "setkeeper"},
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "_id": "feed-a",
            "_seq_no": 3,
            "_primary_term": 2,
            "result": "created",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let created = store(&server)
        .create(&owned_set("feed-a", &["1.2.3.4/32"]))
        .await
        .unwrap();

    assert_eq!(created.resource_version(), Some("3:2"));
    assert!(created.created_at.is_some());
}

#[tokio::test]
async fn create_of_existing_document_conflicts() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path(format!("/{INDEX}/_create/feed-a")))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({
            "error": {"type": "version_conflict_engine_exception"},
        })))
        .mount(&server)
        .await;

    let err = store(&server)
        .create(&owned_set("feed-a", &[]))
        .await
        .unwrap_err();
    assert!(err.is_conflict());
}

#[tokio::test]
async fn update_is_conditional_on_document_version() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("/{INDEX}/_update/feed-a")))
        .and(query_param("if_seq_no", "3"))
        .and(query_param("if_primary_term", "2"))
        .and(body_partial_json(json!({"script": {"params": {"ips": ["5.6.7.8/32"]}}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "_id": "feed-a",
            "_seq_no": 4,
            "_primary_term": 2,
            "result": "updated",
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/{INDEX}/_update/feed-gone")))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let store = store(&server);

    let mut set = owned_set("feed-a", &["5.6.7.8/32"]);
    set.version = Some("3:2".to_string());
    let updated = store.update(&set).await.unwrap();
    assert_eq!(updated.resource_version(), Some("4:2"));

    let mut gone = owned_set("feed-gone", &[]);
    gone.version = Some("1:1".to_string());
    assert!(store.update(&gone).await.unwrap_err().is_not_found());

    let mut malformed = owned_set("feed-a", &[]);
    malformed.version = Some("seventeen".to_string());
    assert!(matches!(
        store.update(&malformed).await,
        Err(StoreError::Decode(_))
    ));
}

#[tokio::test]
async fn update_replaces_labels_instead_of_merging() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("/{INDEX}/_update/feed-a")))
        .and(body_json(json!({
            "script": {
                "source": "ctx._source.ips = params.ips; ctx._source.labels = params.labels",
                "lang": "painless",
                "params": {
                    "ips": ["1.2.3.4/32"],
                    "labels": {"setkeeper.io/creator": "setkeeper"},
                },
            },
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "_id": "feed-a",
            "_seq_no": 5,
            "_primary_term": 1,
            "result": "updated",
        })))
        .expect(1)
        .mount(&server)
        .await;

    // Stored copy carried an extra label the desired set no longer has.
    let mut set = owned_set("feed-a", &["1.2.3.4/32"]);
    set.version = Some("4:1".to_string());
    let updated = store(&server).update(&set).await.unwrap();

    assert_eq!(updated.labels.len(), 1);
    assert_eq!(updated.resource_version(), Some("5:1"));
}

#[tokio::test]
async fn delete_maps_missing_and_raced_documents() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path(format!("/{INDEX}/_doc/feed-a")))
        .and(query_param("if_seq_no", "7"))
        .and(query_param("if_primary_term", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": "deleted"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path(format!("/{INDEX}/_doc/feed-gone")))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"result": "not_found"})))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path(format!("/{INDEX}/_doc/feed-raced")))
        .respond_with(ResponseTemplate::new(409))
        .mount(&server)
        .await;

    let store = store(&server);

    store
        .delete(&ResourceKey::new("feed-a"), Some("7:1"))
        .await
        .unwrap();
    assert!(store
        .delete(&ResourceKey::new("feed-gone"), None)
        .await
        .unwrap_err()
        .is_not_found());
    assert!(store
        .delete(&ResourceKey::new("feed-raced"), Some("1:1"))
        .await
        .unwrap_err()
        .is_conflict());
}

#[tokio::test]
async fn watch_is_unsupported() {
    let server = MockServer::start().await;
    let result = store(&server).watch(&owner_label(), None).await;
    assert!(matches!(result, Err(StoreError::Unsupported("watch"))));
}
