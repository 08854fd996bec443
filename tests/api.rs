//! HTTP API tests driven through `tower::ServiceExt::oneshot`.

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use planrunner::config::PipelineConfig;
use planrunner::engine::testing::{FakeLauncher, FakeSite};
use planrunner::Services;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

struct TestApp {
    dir: TempDir,
    config: PipelineConfig,
    services: Services,
}

impl TestApp {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PipelineConfig::default();
        config.database.path = dir.path().join("planrunner.db");
        config.executor.artifacts_root = dir.path().join("artifacts");
        let services = Services::build(&config, FakeLauncher::new(FakeSite::new())).unwrap();
        Self {
            dir,
            config,
            services,
        }
    }

    fn router(&self) -> Router {
        planrunner::api::router(self.services.app_state(&self.config))
    }

    async fn call(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let req = match body {
            Some(b) => builder
                .header("content-type", "application/json")
                .body(Body::from(b.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let resp = self.router().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }
}

fn submit_body(run_id: &str) -> Value {
    json!({
        "payload": {
            "runId": run_id,
            "planId": "plan-1",
            "projectId": "proj-1",
            "tenantId": "acme",
            "tasks": [{ "id": "open", "type": "navigate", "url": "https://example.com" }]
        },
        "priority": 5
    })
}

#[tokio::test]
async fn test_health() {
    let app = TestApp::new();
    let (status, body) = app.call(Method::GET, "/api/v1/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "ok");
    assert_eq!(body["data"]["engines"]["instances"], 0);
}

#[tokio::test]
async fn test_submit_status_logs_and_cancel() {
    let app = TestApp::new();

    let (status, body) = app.call(Method::POST, "/api/v1/runs", Some(submit_body("run-1"))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["runId"], "run-1");
    assert_eq!(body["data"]["created"], true);

    let (status, body) = app.call(Method::POST, "/api/v1/runs", Some(submit_body("run-1"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["created"], false);

    let (status, body) = app.call(Method::GET, "/api/v1/runs/run-1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["job"]["state"], "waiting");
    assert_eq!(body["data"]["run"]["status"], "queued");

    let (status, body) = app.call(Method::GET, "/api/v1/runs/run-1/logs", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["meta"]["total"], 0);

    let (status, body) = app.call(Method::DELETE, "/api/v1/runs/run-1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["outcome"], "removed");

    let (status, body) = app.call(Method::GET, "/api/v1/runs/run-1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"]["job"].is_null());
    assert_eq!(body["data"]["run"]["status"], "cancelled");
}

#[tokio::test]
async fn test_unknown_run_is_404() {
    let app = TestApp::new();
    for (method, uri) in [
        (Method::GET, "/api/v1/runs/nope"),
        (Method::DELETE, "/api/v1/runs/nope"),
        (Method::GET, "/api/v1/runs/nope/logs"),
    ] {
        let (status, body) = app.call(method, uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
        assert_eq!(body["error"]["code"], "not_found");
    }
}

#[tokio::test]
async fn test_quota_rejection_is_402_with_numbers() {
    let app = TestApp::new();
    app.services.tenants.upsert_tenant("acme", "free").unwrap();

    let (status, _) = app.call(Method::POST, "/api/v1/runs", Some(submit_body("run-1"))).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = app.call(Method::POST, "/api/v1/runs", Some(submit_body("run-2"))).await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["error"]["code"], "quota_exceeded");
    assert_eq!(body["error"]["subject"], "concurrent_runs");
    assert_eq!(body["error"]["current"], 1);
    assert_eq!(body["error"]["limit"], 1);
    assert_eq!(body["error"]["percentage"], 100.0);
}

#[tokio::test]
async fn test_invalid_payload_is_422() {
    let app = TestApp::new();
    let mut body = submit_body("run-1");
    body["payload"]["tasks"] = json!([{ "id": "click", "type": "click" }]);
    let (status, body) = app.call(Method::POST, "/api/v1/runs", Some(body)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["error"]["message"].as_str().unwrap().contains("selector"));
}

#[tokio::test]
async fn test_usage_increment_and_stats() {
    let app = TestApp::new();

    let (status, body) = app
        .call(Method::POST, "/api/v1/usage/acme/tokens", Some(json!({ "amount": 2500 })))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["current"], 2500);

    let (status, body) = app
        .call(Method::POST, "/api/v1/usage/acme/tokens", Some(json!({ "amount": 0 })))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["recorded"], false);

    let (status, body) = app.call(Method::GET, "/api/v1/usage/acme/tokens", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["current"], 2500);
    assert_eq!(body["data"]["limit"], 10000);
    assert_eq!(body["data"]["percentage"], 25.0);
    assert_eq!(body["data"]["unlimited"], false);

    let (status, _) = app.call(Method::GET, "/api/v1/usage/acme/bandwidth", None).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_admission_endpoint() {
    let app = TestApp::new();
    app.services.tenants.upsert_tenant("acme", "free").unwrap();
    for (id, name) in [("p1", "One"), ("p2", "Two"), ("p3", "Three")] {
        app.services.tenants.add_project("acme", id, name).unwrap();
    }

    let (status, body) = app
        .call(Method::POST, "/api/v1/quota/acme/admission/projects", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["allowed"], false);
    assert_eq!(body["data"]["current"], 3);

    let (status, body) = app
        .call(Method::POST, "/api/v1/quota/acme/admission/members", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["allowed"], true);

    let (status, _) = app
        .call(Method::POST, "/api/v1/quota/acme/admission/widgets", None)
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_artifacts_are_served() {
    let app = TestApp::new();
    let file = app.dir.path().join("artifacts/proj-1/run-1/shot.png");
    std::fs::create_dir_all(file.parent().unwrap()).unwrap();
    std::fs::write(&file, b"png").unwrap();

    let req = Request::builder()
        .uri("/artifacts/proj-1/run-1/shot.png")
        .body(Body::empty())
        .unwrap();
    let resp = app.router().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"png");
}
