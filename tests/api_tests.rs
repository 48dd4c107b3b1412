//! HTTP API 集成测试

use authz_controller::{app::ControlPlane, routes};
use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

mod common;
use common::{create_test_config, eventually, start_control_plane};

const NS_PREFIX: &str = "/apis/authz.tkestack.io/v1/namespaces/tenant-a";

fn create_app(plane: &ControlPlane) -> Router {
    routes::create_router(Arc::new(plane.app_state()))
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let body = match body {
        Some(value) => Body::from(value.to_string()),
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .header("content-type", "application/json")
                .body(body)
                .unwrap(),
        )
        .await
        .unwrap();

    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

fn binding_body(name: &str, role: &str, clusters: &[&str]) -> Value {
    json!({
        "metadata": { "name": name },
        "spec": {
            "username": "alice",
            "roleName": role,
            "clusters": clusters,
        }
    })
}

#[tokio::test]
async fn test_health_endpoint() {
    let plane = ControlPlane::new(create_test_config()).unwrap();
    let app = create_app(&plane);

    let (status, json) = send(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
    assert!(json["uptime_secs"].is_number());
}

#[tokio::test]
async fn test_readiness_waits_for_informers() {
    let plane = start_control_plane();
    let app = create_app(&plane);

    let app_ref = &app;
    assert!(
        eventually(move || async move {
            send(app_ref, Method::GET, "/ready", None).await.0 == StatusCode::OK
        })
        .await
    );
    let (_, json) = send(&app, Method::GET, "/ready", None).await;
    assert_eq!(json["ready"], true);
    assert!(json["checks"]
        .as_array()
        .unwrap()
        .iter()
        .all(|check| check["status"] == "synced"));

    plane.stop().await;
}

#[tokio::test]
async fn test_readiness_reports_unsynced_controllers() {
    let plane = ControlPlane::new(create_test_config()).unwrap();
    let app = create_app(&plane);

    let (status, json) = send(&app, Method::GET, "/ready", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["ready"], false);
}

#[tokio::test]
async fn test_policy_crud() {
    let plane = ControlPlane::new(create_test_config()).unwrap();
    let app = create_app(&plane);

    let policy = json!({
        "metadata": { "name": "p1" },
        "spec": {
            "scope": "MultiCluster",
            "rules": [{ "verbs": ["get"], "apiGroups": [""], "resources": ["pods"] }]
        }
    });
    let (status, created) = send(
        &app,
        Method::POST,
        &format!("{}/policies", NS_PREFIX),
        Some(policy.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["kind"], "Policy");
    assert_eq!(created["apiVersion"], "authz.tkestack.io/v1");
    assert_eq!(created["metadata"]["namespace"], "tenant-a");
    assert!(!created["metadata"]["uid"].as_str().unwrap().is_empty());

    let (status, _) = send(
        &app,
        Method::POST,
        &format!("{}/policies", NS_PREFIX),
        Some(policy),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, list) = send(&app, Method::GET, &format!("{}/policies", NS_PREFIX), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list["kind"], "PolicyList");
    assert_eq!(list["items"].as_array().unwrap().len(), 1);

    // Policy 没有终结器，直接删除
    let (status, _) = send(&app, Method::DELETE, &format!("{}/policies/p1", NS_PREFIX), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, json) = send(&app, Method::GET, &format!("{}/policies/p1", NS_PREFIX), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"]["code"], 404);
    assert!(json["error"]["request_id"].is_string());
}

#[tokio::test]
async fn test_rejects_malformed_requests() {
    let plane = ControlPlane::new(create_test_config()).unwrap();
    let app = create_app(&plane);

    // 命名空间与路径不一致
    let (status, json) = send(
        &app,
        Method::POST,
        &format!("{}/policies", NS_PREFIX),
        Some(json!({ "metadata": { "name": "p1", "namespace": "other" }, "spec": {} })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"]["code"], 400);

    // 请求体不是合法 JSON
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri(format!("{}/roles", NS_PREFIX))
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // 通配符与具体集群混用
    let (status, _) = send(
        &app,
        Method::POST,
        &format!("{}/multiclusterrolebindings", NS_PREFIX),
        Some(binding_body("b1", "tenant-a/r1", &["*", "a"])),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // 非法的 Role 引用
    let (status, _) = send(
        &app,
        Method::POST,
        &format!("{}/multiclusterrolebindings", NS_PREFIX),
        Some(binding_body("b1", "r1", &["a"])),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // 集群级资源不能带命名空间
    let (status, _) = send(
        &app,
        Method::POST,
        "/apis/authz.tkestack.io/v1/clusters",
        Some(json!({
            "metadata": { "name": "c1", "namespace": "tenant-a" },
            "spec": { "tenantId": "tenant-a" }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_binding_graceful_deletion_over_http() {
    let plane = ControlPlane::new(create_test_config()).unwrap();
    let app = create_app(&plane);
    let uri = format!("{}/multiclusterrolebindings/b1", NS_PREFIX);

    let (status, created) = send(
        &app,
        Method::POST,
        &format!("{}/multiclusterrolebindings", NS_PREFIX),
        Some(binding_body("b1", "tenant-a/r1", &["a"])),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["metadata"]["labels"]["authz.tkestack.io/role-name"], "r1");
    assert_eq!(created["spec"]["finalizers"], json!(["multiclusterrolebinding"]));

    // 第一次删除：进入 Terminating
    let (status, terminating) = send(&app, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(terminating["status"]["phase"], "Terminating");
    assert!(terminating["metadata"]["deletionTimestamp"].is_string());

    // 终结器未清空前再次删除返回冲突
    let (status, json) = send(&app, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(json["error"]["message"]
        .as_str()
        .unwrap()
        .contains("ensuring all content is removed"));

    // 过期的 UID 前置条件
    let (status, _) = send(
        &app,
        Method::DELETE,
        &uri,
        Some(json!({ "preconditions": { "uid": "stale" } })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let mut finalize = terminating.clone();
    finalize["spec"]["finalizers"] = json!([]);
    let (status, finalized) = send(&app, Method::PUT, &format!("{}/finalize", uri), Some(finalize)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(finalized["spec"].get("finalizers").is_none());

    let (status, _) = send(&app, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&app, Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_list_bindings_by_label_selector() {
    let plane = ControlPlane::new(create_test_config()).unwrap();
    let app = create_app(&plane);
    let collection = format!("{}/multiclusterrolebindings", NS_PREFIX);

    for (name, role) in [("b1", "tenant-a/r1"), ("b2", "tenant-a/r1"), ("b3", "tenant-a/r2")] {
        let (status, _) = send(&app, Method::POST, &collection, Some(binding_body(name, role, &["*"]))).await;
        assert_eq!(status, StatusCode::CREATED);
    }

    let (status, list) = send(
        &app,
        Method::GET,
        &format!("{}?labelSelector=authz.tkestack.io%2Frole-name%3Dr1", collection),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<&str> = list["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|item| item["metadata"]["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["b1", "b2"]);

    let (status, _) = send(
        &app,
        Method::GET,
        &format!("{}?labelSelector=broken", collection),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_cluster_status_subresource() {
    let plane = ControlPlane::new(create_test_config()).unwrap();
    let app = create_app(&plane);
    let uri = "/apis/authz.tkestack.io/v1/clusters/c1";

    let (status, created) = send(
        &app,
        Method::POST,
        "/apis/authz.tkestack.io/v1/clusters",
        Some(json!({ "metadata": { "name": "c1" }, "spec": { "tenantId": "tenant-a" } })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["status"]["phase"], "Initializing");

    let mut running = created.clone();
    running["status"]["phase"] = json!("Running");
    running["spec"]["displayName"] = json!("ignored by the status subresource");
    let (status, updated) = send(&app, Method::PUT, &format!("{}/status", uri), Some(running)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["status"]["phase"], "Running");
    assert_eq!(updated["spec"]["displayName"], created["spec"]["displayName"]);
}
