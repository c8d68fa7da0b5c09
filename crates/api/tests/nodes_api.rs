//! HTTP-level tests for node import, removal and operator actions.

mod common;

use std::time::Duration;

use axum::http::StatusCode;
use common::{body_json, delete, get, post_json};
use serde_json::json;

async fn import(app: &common::TestApp, name: &str) -> i64 {
    let response = post_json(
        app.app(),
        "/api/v1/nodes",
        json!({ "name": name, "host": format!("http://{name}:8188") }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let json = body_json(response).await;
    assert!(json["data"].get("auth").is_none(), "credentials must not be serialized");
    json["data"]["id"].as_i64().unwrap()
}

async fn wait_online(app: &common::TestApp, node_id: i64) {
    for _ in 0..300 {
        let json = body_json(get(app.app(), "/api/v1/nodes").await).await;
        let online = json["data"]
            .as_array()
            .unwrap()
            .iter()
            .any(|n| n["id"] == json!(node_id) && n["status"] == "online");
        if online {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("node {node_id} never came online");
}

#[tokio::test]
async fn imported_node_is_listed_with_live_status() {
    let app = common::build_test_app();
    let node_id = import(&app, "gpu-a").await;
    wait_online(&app, node_id).await;

    let json = body_json(get(app.app(), "/api/v1/nodes").await).await;
    let node = &json["data"][0];
    assert_eq!(node["name"], "gpu-a");
    assert_eq!(node["busy"], false);
    assert!(node["resources"]["checkpoints"].is_array());
}

#[tokio::test]
async fn unreachable_node_returns_502_and_is_not_stored() {
    let app = common::build_test_app();
    app.connector.mark_unreachable("http://gpu-down:8188");

    let response = post_json(
        app.app(),
        "/api/v1/nodes",
        json!({ "name": "gpu-down", "host": "http://gpu-down:8188" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(body_json(response).await["code"], "NODE_UNREACHABLE");

    let json = body_json(get(app.app(), "/api/v1/nodes").await).await;
    assert!(json["data"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn invalid_host_returns_400() {
    let app = common::build_test_app();
    let response = post_json(
        app.app(),
        "/api/v1/nodes",
        json!({ "name": "gpu-a", "host": "gpu-a:8188" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn actions_are_applied_and_recorded() {
    let app = common::build_test_app();
    let node_id = import(&app, "gpu-a").await;
    wait_online(&app, node_id).await;

    let response = post_json(
        app.app(),
        &format!("/api/v1/nodes/{node_id}/actions"),
        json!({ "action": "free_memory" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["data"]["action"], "free_memory");

    let scripted = app.connector.node(node_id).unwrap();
    assert_eq!(scripted.actions().await, vec!["free_memory"]);

    let json = body_json(get(app.app(), &format!("/api/v1/nodes/{node_id}/events")).await).await;
    let actions: Vec<_> = json["data"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|e| e["detail"]["action"].is_string())
        .collect();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0]["detail"]["ok"], true);
}

#[tokio::test]
async fn unknown_action_is_rejected() {
    let app = common::build_test_app();
    let node_id = import(&app, "gpu-a").await;
    let response = post_json(
        app.app(),
        &format!("/api/v1/nodes/{node_id}/actions"),
        json!({ "action": "overclock" }),
    )
    .await;
    assert!(response.status().is_client_error());
}

#[tokio::test]
async fn action_on_unknown_node_returns_404() {
    let app = common::build_test_app();
    let response = post_json(
        app.app(),
        "/api/v1/nodes/77/actions",
        json!({ "action": "interrupt" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn delete_removes_the_node() {
    let app = common::build_test_app();
    let node_id = import(&app, "gpu-a").await;

    let response = delete(app.app(), &format!("/api/v1/nodes/{node_id}")).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let json = body_json(get(app.app(), "/api/v1/nodes").await).await;
    assert!(json["data"].as_array().unwrap().is_empty());
    assert!(app.connector.node(node_id).unwrap().is_shut_down());

    let response = delete(app.app(), &format!("/api/v1/nodes/{node_id}")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
