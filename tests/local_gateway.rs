// Integration tests for routing and dispatch through the local gateway
mod common;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use apiman::{
    adapters::{InMemoryEntityStore, LocalGateway},
    config::models::ProtocolMismatchPolicy,
    core::{Api, ApiEntity, DispatchOptions, Status},
    ports::{EntityFilter, EntityStore, FunctionClient, Gateway, RunResponse, StoreResult},
};
use async_trait::async_trait;
use axum::body::Body;
use common::{RecordingClient, body_json, body_string, request, status_error};
use hyper::{StatusCode, header};
use serde_json::json;

async fn gateway_with(client: Arc<RecordingClient>, options: DispatchOptions) -> LocalGateway {
    let client: Arc<dyn FunctionClient> = client;
    LocalGateway::new(None, client, options).await
}

async fn gateway(client: Arc<RecordingClient>) -> LocalGateway {
    gateway_with(client, DispatchOptions::default()).await
}

fn api(name: &str) -> Api {
    Api {
        name: name.to_string(),
        organization_id: "acme".to_string(),
        function: format!("{name}-fn"),
        enabled: true,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_request_after_delete_is_not_found() {
    let client = RecordingClient::new();
    let gw = gateway(client.clone()).await;

    let mut api1 = api("api1");
    api1.uris = vec!["/hello".to_string()];
    api1.methods = vec!["GET".to_string()];
    gw.add_api(&api1).await.unwrap();

    let response = gw
        .handle_request(request("GET", "", "/hello").body(Body::empty()).unwrap(), false)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(client.call_count(), 1);

    gw.delete_api(&api1).await.unwrap();

    let response = gw
        .handle_request(request("GET", "", "/hello").body(Body::empty()).unwrap(), false)
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        body_json(response).await,
        json!({ "message": "no API found with those values" })
    );
    assert_eq!(client.call_count(), 1);
}

#[tokio::test]
async fn test_update_to_wildcard_methods_keeps_routing() {
    let client = RecordingClient::new();
    let gw = gateway(client.clone()).await;

    let mut hosted = api("hosted");
    hosted.hosts = vec!["example.com".to_string()];
    hosted.uris = vec!["/hello".to_string()];
    hosted.methods = vec!["POST".to_string()];
    gw.add_api(&hosted).await.unwrap();

    let post = || {
        request("POST", "example.com:8081", "/hello")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"n":1}"#))
            .unwrap()
    };
    assert_eq!(gw.handle_request(post(), false).await.status(), StatusCode::OK);

    hosted.methods.clear();
    gw.update_api("hosted", &hosted).await.unwrap();

    assert_eq!(gw.handle_request(post(), false).await.status(), StatusCode::OK);
    let other_host = request("POST", "other.com", "/hello")
        .body(Body::empty())
        .unwrap();
    assert_eq!(
        gw.handle_request(other_host, false).await.status(),
        StatusCode::NOT_FOUND
    );
}

#[tokio::test]
async fn test_disable_and_reenable() {
    let client = RecordingClient::new();
    let gw = gateway(client).await;

    let mut toggled = api("toggled");
    toggled.uris = vec!["/toggle".to_string()];
    gw.add_api(&toggled).await.unwrap();

    toggled.enabled = false;
    gw.update_api("toggled", &toggled).await.unwrap();
    assert!(gw.match_api("", "/toggle", "GET").is_none());
    // Disabled records stay known to the driver
    assert!(gw.get_api("toggled").await.is_ok());

    toggled.enabled = true;
    gw.update_api("toggled", &toggled).await.unwrap();
    assert!(gw.match_api("", "/toggle", "GET").is_some());
}

#[tokio::test]
async fn test_json_input_and_http_context() {
    let client = RecordingClient::new();
    let gw = gateway(client.clone()).await;

    let mut echo = api("echo");
    echo.uris = vec!["/echo".to_string()];
    gw.add_api(&echo).await.unwrap();

    let req = request("POST", "gw.local", "/echo?debug=1")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"key":"value"}"#))
        .unwrap();
    let response = gw.handle_request(req, false).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/json"
    );
    assert_eq!(body_string(response).await, "{\"key\":\"value\"}\n");

    let (org, run) = client.last_call().unwrap();
    assert_eq!(org, "acme");
    assert!(run.blocking);
    assert_eq!(run.function_name, "echo-fn");
    assert_eq!(run.http_context["args"], "debug=1");
    assert_eq!(run.http_context["request"], "http://gw.local/echo?debug=1");
    assert_eq!(run.http_context["request_uri"], "/echo?debug=1");
    assert_eq!(run.http_context["uri"], "/echo?debug=1");
    assert_eq!(run.http_context["upstream_uri"], "echo-fn");
    assert_eq!(run.http_context["method"], "POST");
}

#[tokio::test]
async fn test_form_and_unsupported_input() {
    let client = RecordingClient::new();
    let gw = gateway(client.clone()).await;

    let mut form = api("form");
    form.uris = vec!["/form".to_string()];
    gw.add_api(&form).await.unwrap();

    let req = request("POST", "", "/form")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from("name=VMware&place=Palo+Alto"))
        .unwrap();
    let response = gw.handle_request(req, false).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_json(response).await,
        json!({ "name": "VMware", "place": "Palo Alto" })
    );

    let req = request("POST", "", "/form")
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from("hello"))
        .unwrap();
    let calls = client.call_count();
    let response = gw.handle_request(req, false).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(client.call_count(), calls);
}

#[tokio::test]
async fn test_cors_preflight() {
    let client = RecordingClient::new();
    let gw = gateway(client.clone()).await;

    let mut cors = api("cors");
    cors.uris = vec!["/cors".to_string()];
    cors.methods = vec!["POST".to_string()];
    cors.cors = true;
    let added = gw.add_api(&cors).await.unwrap();
    assert!(added.methods.contains(&"OPTIONS".to_string()));

    let response = gw
        .handle_request(request("OPTIONS", "", "/cors").body(Body::empty()).unwrap(), false)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    assert!(body_string(response).await.is_empty());
    assert_eq!(client.call_count(), 0);
}

#[tokio::test]
async fn test_non_blocking_and_function_errors() {
    let client = RecordingClient::new();
    let gw = gateway(client.clone()).await;

    let mut run = api("run");
    run.uris = vec!["/run".to_string()];
    gw.add_api(&run).await.unwrap();

    let req = request("GET", "", "/run?x=1")
        .header("x-dispatch-blocking", "false")
        .body(Body::empty())
        .unwrap();
    let response = gw.handle_request(req, false).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_string(response).await.is_empty());
    assert!(!client.last_call().unwrap().1.blocking);

    client.respond_with(status_error(422, "function input rejected"));
    let response = gw
        .handle_request(request("GET", "", "/run").body(Body::empty()).unwrap(), false)
        .await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(
        body_json(response).await,
        json!({ "message": "function input rejected" })
    );

    client.respond_with(Ok(RunResponse {
        output: Some(json!("")),
    }));
    let response = gw
        .handle_request(request("GET", "", "/run").body(Body::empty()).unwrap(), false)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_string(response).await.is_empty());
}

#[tokio::test]
async fn test_protocol_mismatch_policies() {
    let mut secure_only = api("secure");
    secure_only.uris = vec!["/secure".to_string()];
    secure_only.protocols = vec!["https".to_string()];

    // Historical behavior: the 400 is written and the function still runs.
    let client = RecordingClient::new();
    let gw = gateway(client.clone()).await;
    gw.add_api(&secure_only).await.unwrap();
    let response = gw
        .handle_request(request("GET", "", "/secure").body(Body::empty()).unwrap(), false)
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(body_string(response).await.starts_with("{\"message\":\"Please use HTTPS protocol\"}\n"));
    assert_eq!(client.call_count(), 1);

    let client = RecordingClient::new();
    let gw = gateway_with(
        client.clone(),
        DispatchOptions {
            protocol_mismatch: ProtocolMismatchPolicy::Reject,
            ..Default::default()
        },
    )
    .await;
    gw.add_api(&secure_only).await.unwrap();
    let response = gw
        .handle_request(request("GET", "", "/secure").body(Body::empty()).unwrap(), false)
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(client.call_count(), 0);

    let response = gw
        .handle_request(request("GET", "", "/secure").body(Body::empty()).unwrap(), true)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(client.call_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_requests_during_rebuilds() {
    let client = RecordingClient::new();
    let gw = Arc::new(gateway(client).await);

    let mut stable = api("stable");
    stable.uris = vec!["/stable".to_string()];
    gw.add_api(&stable).await.unwrap();

    let writer = {
        let gw = gw.clone();
        tokio::spawn(async move {
            for i in 0..50 {
                let mut churn = api(&format!("churn-{i}"));
                churn.uris = vec![format!("/churn/{i}")];
                gw.add_api(&churn).await.unwrap();
                gw.delete_api(&churn).await.unwrap();
            }
        })
    };

    let mut readers = Vec::new();
    for _ in 0..4 {
        let gw = gw.clone();
        readers.push(tokio::spawn(async move {
            for _ in 0..50 {
                let response = gw
                    .handle_request(
                        request("GET", "", "/stable").body(Body::empty()).unwrap(),
                        false,
                    )
                    .await;
                assert_eq!(response.status(), StatusCode::OK);
            }
        }));
    }

    writer.await.unwrap();
    for reader in readers {
        reader.await.unwrap();
    }
    assert_eq!(gw.api_count(), 1);
}

/// Store whose next `list_global` returns its result only after a delay,
/// as a slow backend would.
struct SlowListStore {
    inner: InMemoryEntityStore,
    slow_next_list: AtomicBool,
}

impl SlowListStore {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryEntityStore::new(),
            slow_next_list: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl EntityStore for SlowListStore {
    async fn add(&self, entity: &mut ApiEntity) -> StoreResult<String> {
        self.inner.add(entity).await
    }

    async fn get(
        &self,
        organization_id: &str,
        name: &str,
        filter: &EntityFilter,
    ) -> StoreResult<ApiEntity> {
        self.inner.get(organization_id, name, filter).await
    }

    async fn update(&self, expected_revision: u64, entity: &mut ApiEntity) -> StoreResult<u64> {
        self.inner.update(expected_revision, entity).await
    }

    async fn delete(&self, organization_id: &str, name: &str) -> StoreResult<()> {
        self.inner.delete(organization_id, name).await
    }

    async fn list(
        &self,
        organization_id: &str,
        filter: &EntityFilter,
    ) -> StoreResult<Vec<ApiEntity>> {
        self.inner.list(organization_id, filter).await
    }

    async fn list_global(&self, filter: &EntityFilter) -> StoreResult<Vec<ApiEntity>> {
        let listed = self.inner.list_global(filter).await;
        if self.slow_next_list.swap(false, Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        listed
    }
}

fn org_api(name: &str) -> Api {
    let mut record = api(&format!("acme-{name}"));
    record.uris = vec![format!("/{name}")];
    record
}

async fn store_api(store: &dyn EntityStore, name: &str, status: Status) -> ApiEntity {
    let mut entity = ApiEntity::new("acme", name, org_api(name)).with_status(status);
    store.add(&mut entity).await.unwrap();
    entity
}

/// Mark an entity DELETING, remove it from the gateway, then from the store,
/// in the order the controller does.
async fn delete_everywhere(store: &dyn EntityStore, gw: &LocalGateway, mut entity: ApiEntity) {
    entity.status = Status::Deleting;
    let revision = entity.revision;
    store.update(revision, &mut entity).await.unwrap();
    gw.delete_api(&entity.api).await.unwrap();
    store.delete("acme", &entity.name).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_slow_rebuild_does_not_restore_deleted_api() {
    let store = SlowListStore::new();
    let entity_store: Arc<dyn EntityStore> = store.clone();
    let client: Arc<dyn FunctionClient> = RecordingClient::new();
    let gw = Arc::new(
        LocalGateway::new(Some(entity_store.clone()), client, DispatchOptions::default()).await,
    );

    let x = store_api(store.as_ref(), "x", Status::Ready).await;
    gw.add_api(&x.api).await.unwrap();
    let y = store_api(store.as_ref(), "y", Status::Creating).await;

    // The add lists the store while x is still live, then stalls.
    store.slow_next_list.store(true, Ordering::SeqCst);
    let adding = {
        let gw = gw.clone();
        let api = y.api.clone();
        tokio::spawn(async move { gw.add_api(&api).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    delete_everywhere(store.as_ref(), &gw, x).await;
    adding.await.unwrap().unwrap();

    assert!(gw.match_api("", "/x", "GET").is_none(), "deleted api routed again");
    assert!(gw.match_api("", "/y", "GET").is_some());
    assert!(store.get("acme", "x", &EntityFilter::new()).await.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_writers_with_store_converge() {
    let store = Arc::new(InMemoryEntityStore::new());
    let entity_store: Arc<dyn EntityStore> = store.clone();
    let client: Arc<dyn FunctionClient> = RecordingClient::new();
    let gw = Arc::new(
        LocalGateway::new(Some(entity_store.clone()), client, DispatchOptions::default()).await,
    );

    let mut writers = Vec::new();
    for i in 0..16 {
        let gw = gw.clone();
        let store = entity_store.clone();
        writers.push(tokio::spawn(async move {
            let name = format!("api{i}");
            let entity = store_api(store.as_ref(), &name, Status::Creating).await;
            gw.add_api(&entity.api).await.unwrap();
            if i % 2 == 0 {
                delete_everywhere(store.as_ref(), &gw, entity).await;
            }
        }));
    }
    for writer in writers {
        writer.await.unwrap();
    }

    for i in 0..16 {
        let routed = gw.match_api("", &format!("/api{i}"), "GET").is_some();
        assert_eq!(routed, i % 2 == 1, "api{i} routed = {routed}");
    }
    assert_eq!(gw.api_count(), 8);
}
