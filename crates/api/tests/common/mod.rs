#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderName, Method, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use fleet_comfyui::{NodeConnector, ScriptedConnector};
use fleet_core::backoff::BackoffConfig;
use fleet_db::{MemoryStore, TaskStore};
use fleet_events::NotificationBus;
use fleet_pipeline::{BlobStore, MemoryBlobStore};
use fleet_worker::{Scheduler, SchedulerConfig};
use http_body_util::BodyExt;
use tower::ServiceExt;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use fleet_api::config::ServerConfig;
use fleet_api::middleware::requester::USER_ID_HEADER;
use fleet_api::routes;
use fleet_api::state::AppState;

/// Build a test `ServerConfig` with safe defaults.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        database_url: None,
        blob_root: "./data/blobs".to_string(),
        blob_public_url: "/blobs".to_string(),
    }
}

/// The router plus the in-process pieces behind it, for seeding and
/// scripting nodes.
pub struct TestApp {
    pub router: Router,
    pub store: Arc<MemoryStore>,
    pub connector: Arc<ScriptedConnector>,
    pub scheduler: Arc<Scheduler>,
}

impl TestApp {
    pub fn app(&self) -> Router {
        self.router.clone()
    }
}

/// Build the full application router with all middleware layers over the
/// in-memory store, bus and blob store.
///
/// Mirrors the router construction in `main.rs` so tests exercise the same
/// middleware stack.
pub fn build_test_app() -> TestApp {
    let store = Arc::new(MemoryStore::new());
    let connector = Arc::new(ScriptedConnector::default());
    let scheduler = Scheduler::new(
        store.clone() as Arc<dyn TaskStore>,
        NotificationBus::in_memory(),
        connector.clone() as Arc<dyn NodeConnector>,
        Arc::new(MemoryBlobStore::new()) as Arc<dyn BlobStore>,
        SchedulerConfig {
            idle_backoff: BackoffConfig {
                initial_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
                multiplier: 2.0,
                jitter: 0.0,
            },
            ..SchedulerConfig::default()
        },
    );

    let state = AppState {
        scheduler: Arc::clone(&scheduler),
        config: Arc::new(test_config()),
    };

    let cors = CorsLayer::new()
        .allow_origin(["http://localhost:5173".parse().unwrap()])
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([CONTENT_TYPE])
        .allow_credentials(true)
        .max_age(Duration::from_secs(3600));

    let request_id_header = HeaderName::from_static("x-request-id");

    let router = Router::new()
        .merge(routes::health::router())
        .nest("/api/v1", routes::api_routes())
        .layer(CatchPanicLayer::new())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(30),
        ))
        .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid))
        .layer(cors)
        .with_state(state);

    TestApp {
        router,
        store,
        connector,
        scheduler,
    }
}

// ---------------------------------------------------------------------------
// Request helpers
// ---------------------------------------------------------------------------

pub async fn get(app: Router, uri: &str) -> Response {
    let request = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    app.oneshot(request).await.unwrap()
}

pub async fn get_as(app: Router, uri: &str, user_id: i64) -> Response {
    let request = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .header(USER_ID_HEADER, user_id.to_string())
        .body(Body::empty())
        .unwrap();
    app.oneshot(request).await.unwrap()
}

pub async fn post_json(app: Router, uri: &str, body: serde_json::Value) -> Response {
    post_json_with(app, uri, body, &[]).await
}

pub async fn post_json_with(
    app: Router,
    uri: &str,
    body: serde_json::Value,
    headers: &[(&str, String)],
) -> Response {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(CONTENT_TYPE, "application/json");
    for (name, value) in headers {
        builder = builder.header(*name, value);
    }
    let request = builder.body(Body::from(body.to_string())).unwrap();
    app.oneshot(request).await.unwrap()
}

pub async fn delete(app: Router, uri: &str) -> Response {
    let request = Request::builder()
        .method(Method::DELETE)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    app.oneshot(request).await.unwrap()
}

pub async fn body_json(response: Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// Register a minimal txt2img workflow and return its id.
pub async fn create_workflow(app: Router, cost: f64) -> i64 {
    let response = post_json(
        app,
        "/api/v1/workflows",
        serde_json::json!({
            "name": "txt2img",
            "graph": {
                "3": { "class_type": "KSampler", "inputs": { "seed": 0 } },
                "9": { "class_type": "SaveImage", "inputs": { "filename_prefix": "out" } }
            },
            "inputs": {
                "seed": { "kind": "seed", "targets": [{ "node_id": "3", "field": "seed" }] }
            },
            "cost": cost
        }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    body_json(response).await["data"]["id"].as_i64().unwrap()
}
