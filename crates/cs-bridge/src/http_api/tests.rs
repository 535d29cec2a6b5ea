use super::*;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tower::ServiceExt;

use async_trait::async_trait;
use cs_api_types::{
    DevelopRequest, DevelopResponse, FixRequest, FixResponse, QuickRunRequest, QuickRunResponse,
    StatusSnapshot,
};

use crate::event_bus::EventBus;
use crate::platform::{Platform, PlatformError};
use crate::protocol::BusKind;

#[derive(Default)]
struct StubPlatform {
    develop_calls: AtomicUsize,
}

#[async_trait]
impl Platform for StubPlatform {
    async fn develop(&self, req: DevelopRequest) -> Result<DevelopResponse, PlatformError> {
        self.develop_calls.fetch_add(1, Ordering::SeqCst);
        Ok(DevelopResponse {
            task_id: Some("t-1".into()),
            status: "completed".into(),
            code: format!("# {}", req.description),
            iterations: 1,
            success: true,
            attempts: 1,
            ..Default::default()
        })
    }

    async fn quick_run(&self, req: QuickRunRequest) -> Result<QuickRunResponse, PlatformError> {
        if req.code.contains("docker-down") {
            return Err(PlatformError::Unavailable("container runtime not available".into()));
        }
        Ok(QuickRunResponse {
            success: true,
            stdout: "5\n".into(),
            ..Default::default()
        })
    }

    async fn fix(&self, req: FixRequest) -> Result<FixResponse, PlatformError> {
        Ok(FixResponse {
            success: true,
            cause: req.errors[0].clone(),
            suggestion: "install the missing module".into(),
            corrected_code: None,
        })
    }

    async fn status(&self) -> StatusSnapshot {
        StatusSnapshot::default()
    }
}

fn test_app() -> (axum::Router, Arc<ApiState>, Arc<StubPlatform>) {
    let platform = Arc::new(StubPlatform::default());
    let state = Arc::new(ApiState::new(platform.clone(), EventBus::with_capacity(50)));
    (api_router(state.clone()), state, platform)
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn create_task_returns_envelope_and_logs_to_bus() {
    let (app, state, platform) = test_app();
    let resp = app
        .oneshot(post_json(
            "/tasks",
            serde_json::json!({"description": "sum", "language": "py"}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json = json_body(resp).await;
    assert_eq!(json["taskId"], "t-1");
    assert_eq!(json["success"], true);
    assert_eq!(platform.develop_calls.load(Ordering::SeqCst), 1);

    let kinds: Vec<_> = state
        .bus
        .history(&crate::protocol::BusFilter::all(), 10)
        .into_iter()
        .map(|m| m.kind)
        .collect();
    assert_eq!(kinds, vec![BusKind::Request, BusKind::Response]);
}

#[tokio::test]
async fn create_task_rejects_empty_description() {
    let (app, _state, platform) = test_app();
    let resp = app
        .oneshot(post_json("/tasks", serde_json::json!({"description": "   "})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(platform.develop_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn create_task_rejects_unknown_language() {
    let (app, _state, _) = test_app();
    let resp = app
        .oneshot(post_json(
            "/tasks",
            serde_json::json!({"description": "x", "language": "cobol"}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let json = json_body(resp).await;
    assert!(json["error"].as_str().unwrap().contains("cobol"));
}

#[tokio::test]
async fn create_task_refused_while_draining() {
    let (app, state, _) = test_app();
    state.shutdown.trigger();
    let resp = app
        .oneshot(post_json("/tasks", serde_json::json!({"description": "x"})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn quick_run_maps_unavailable_to_503() {
    let (app, _state, _) = test_app();
    let resp = app
        .oneshot(post_json(
            "/tasks/quick",
            serde_json::json!({"code": "docker-down", "language": "python"}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn quick_run_success_shape() {
    let (app, _state, _) = test_app();
    let resp = app
        .oneshot(post_json(
            "/tasks/quick",
            serde_json::json!({"code": "print(5)"}),
        ))
        .await
        .unwrap();
    let json = json_body(resp).await;
    assert_eq!(json["stdout"], "5\n");
    assert_eq!(json["exitCode"], 0);
}

#[tokio::test]
async fn peer_fix_route_accepts_terminal_error_shape() {
    let (app, _state, _) = test_app();
    let resp = app
        .oneshot(post_json(
            "/agent/fix",
            serde_json::json!({"type": "terminal_error", "errors": ["ModuleNotFoundError"], "context": "x"}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp).await["suggestion"], "install the missing module");
}

#[tokio::test]
async fn fix_requires_errors() {
    let (app, _state, _) = test_app();
    let resp = app
        .oneshot(post_json("/tasks/fix", serde_json::json!({"errors": [""]})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn status_includes_bus_stats() {
    let (app, state, _) = test_app();
    state.bus.log_error("test", "boom");
    let resp = app.oneshot(get("/status")).await.unwrap();
    let json = json_body(resp).await;
    assert_eq!(json["bus"]["totalPublished"], 1);
    assert!(!json["version"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn event_webhook_publishes_and_history_filters() {
    let (app, state, _) = test_app();
    let resp = app
        .clone()
        .oneshot(post_json(
            "/events/task_end",
            serde_json::json!({"source": "ci", "ok": true}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    state.bus.log_error("other", "x");

    let resp = app
        .oneshot(get("/bus/history?kind=task-end&limit=5"))
        .await
        .unwrap();
    let json = json_body(resp).await;
    let items = json.as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["source"], "ci");
    assert_eq!(items[0]["kind"], "task-end");
}

#[tokio::test]
async fn unknown_event_kind_is_rejected() {
    let (app, _state, _) = test_app();
    let resp = app
        .oneshot(post_json("/events/nonsense", serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn history_limit_is_capped_by_capacity() {
    let (app, state, _) = test_app();
    for i in 0..80 {
        state.bus.emit(BusKind::Request, "t", serde_json::json!(i));
    }
    let resp = app.oneshot(get("/bus/history?limit=1000")).await.unwrap();
    let json = json_body(resp).await;
    assert_eq!(json.as_array().unwrap().len(), 50);
}

#[tokio::test]
async fn metrics_endpoint_is_prometheus_text() {
    let (app, _state, _) = test_app();
    let resp = app.oneshot(get("/metrics")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let ct = resp.headers()["content-type"].to_str().unwrap().to_string();
    assert!(ct.starts_with("text/plain"));
}

#[tokio::test]
async fn health_reports_draining() {
    let (app, state, _) = test_app();
    state.shutdown.trigger();
    let json = json_body(app.oneshot(get("/health")).await.unwrap()).await;
    assert_eq!(json["status"], "draining");
}
