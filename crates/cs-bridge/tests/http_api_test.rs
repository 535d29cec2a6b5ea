use std::sync::Arc;

use async_trait::async_trait;
use cs_api_types::{
    DevelopRequest, DevelopResponse, FixRequest, FixResponse, QuickRunRequest, QuickRunResponse,
    StatusSnapshot, WorkerStatus,
};
use cs_bridge::event_bus::EventBus;
use cs_bridge::http_api::{api_router, metrics_router, ApiState};
use cs_bridge::platform::{Platform, PlatformError};

struct EchoPlatform;

#[async_trait]
impl Platform for EchoPlatform {
    async fn develop(&self, req: DevelopRequest) -> Result<DevelopResponse, PlatformError> {
        Ok(DevelopResponse {
            task_id: Some("abc".into()),
            status: if req.run_tests { "completed" } else { "generated" }.into(),
            success: true,
            attempts: 1,
            iterations: 1,
            ..Default::default()
        })
    }

    async fn quick_run(&self, _req: QuickRunRequest) -> Result<QuickRunResponse, PlatformError> {
        Ok(QuickRunResponse {
            success: false,
            stderr: "SyntaxError".into(),
            exit_code: 1,
            ..Default::default()
        })
    }

    async fn fix(&self, _req: FixRequest) -> Result<FixResponse, PlatformError> {
        Err(PlatformError::Internal("llm down".into()))
    }

    async fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            workers: vec![WorkerStatus {
                language: "python".into(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }
}

async fn start_test_server() -> (String, Arc<ApiState>) {
    let state = Arc::new(ApiState::new(Arc::new(EchoPlatform), EventBus::new()));
    let router = api_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind to ephemeral port");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (format!("http://{addr}"), state)
}

#[tokio::test]
async fn test_post_tasks_roundtrip() {
    let (base, _state) = start_test_server().await;
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{base}/tasks"))
        .json(&serde_json::json!({"description": "sum of two integers", "language": "python", "test": false}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: DevelopResponse = resp.json().await.unwrap();
    assert_eq!(body.task_id.as_deref(), Some("abc"));
    assert_eq!(body.status, "generated");
}

#[tokio::test]
async fn test_quick_run_failure_is_still_200() {
    let (base, _state) = start_test_server().await;
    let resp = reqwest::Client::new()
        .post(format!("{base}/tasks/quick"))
        .json(&serde_json::json!({"code": "print(", "language": "python"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: QuickRunResponse = resp.json().await.unwrap();
    assert!(!body.success);
    assert_eq!(body.exit_code, 1);
}

#[tokio::test]
async fn test_fix_internal_error_is_500_with_json() {
    let (base, _state) = start_test_server().await;
    let resp = reqwest::Client::new()
        .post(format!("{base}/tasks/fix"))
        .json(&serde_json::json!({"errors": ["Traceback"]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "llm down");
}

#[tokio::test]
async fn test_request_id_is_echoed() {
    let (base, _state) = start_test_server().await;
    let resp = reqwest::Client::new()
        .get(format!("{base}/health"))
        .header("x-request-id", "req-42")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.headers()["x-request-id"], "req-42");
}

#[tokio::test]
async fn test_status_lists_workers() {
    let (base, _state) = start_test_server().await;
    let body: serde_json::Value = reqwest::get(format!("{base}/status"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["workers"][0]["language"], "python");
}

#[tokio::test]
async fn test_metrics_router_serves_only_metrics() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, metrics_router()).await.unwrap();
    });
    let ok = reqwest::get(format!("http://{addr}/metrics")).await.unwrap();
    assert_eq!(ok.status(), 200);
    let missing = reqwest::get(format!("http://{addr}/status")).await.unwrap();
    assert_eq!(missing.status(), 404);
}
