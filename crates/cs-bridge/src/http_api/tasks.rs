use std::sync::Arc;

use axum::{extract::State, Json};
use serde_json::json;
use tracing::info;

use cs_api_types::{
    DevelopRequest, DevelopResponse, FixRequest, FixResponse, QuickRunRequest, QuickRunResponse,
};
use cs_core::language;

use super::state::ApiState;
use crate::api_error::ApiError;

const MAX_DESCRIPTION_CHARS: usize = 20_000;

fn canonical_language(raw: &str) -> Result<&'static str, ApiError> {
    language::normalize(raw).ok_or_else(|| {
        ApiError::BadRequest(format!(
            "unsupported language '{raw}' (supported: {})",
            language::supported().join(", ")
        ))
    })
}

/// POST /tasks -- create and execute a task.
pub(crate) async fn create_task(
    State(state): State<Arc<ApiState>>,
    Json(mut req): Json<DevelopRequest>,
) -> Result<Json<DevelopResponse>, ApiError> {
    let description = req.description.trim();
    if description.is_empty() {
        return Err(ApiError::BadRequest("description must not be empty".into()));
    }
    if description.chars().count() > MAX_DESCRIPTION_CHARS {
        return Err(ApiError::BadRequest(format!(
            "description exceeds {MAX_DESCRIPTION_CHARS} characters"
        )));
    }
    req.language = canonical_language(&req.language)?.to_string();

    let _guard = state
        .shutdown
        .begin_work()
        .ok_or_else(|| ApiError::Unavailable("daemon is shutting down".into()))?;

    info!(language = %req.language, "develop request");
    state.bus.log_request(
        "api",
        &req.language,
        json!({ "endpoint": "/tasks", "description": req.description }),
    );
    let language = req.language.clone();
    let resp = state.platform.develop(req).await?;
    state.bus.log_response(
        "api",
        &language,
        json!({
            "endpoint": "/tasks",
            "task_id": resp.task_id,
            "success": resp.success,
            "attempts": resp.attempts,
        }),
    );
    Ok(Json(resp))
}

/// POST /tasks/quick -- run a snippet without the task lifecycle.
pub(crate) async fn quick_run(
    State(state): State<Arc<ApiState>>,
    Json(mut req): Json<QuickRunRequest>,
) -> Result<Json<QuickRunResponse>, ApiError> {
    if req.code.trim().is_empty() {
        return Err(ApiError::BadRequest("code must not be empty".into()));
    }
    req.language = canonical_language(&req.language)?.to_string();
    let _guard = state
        .shutdown
        .begin_work()
        .ok_or_else(|| ApiError::Unavailable("daemon is shutting down".into()))?;

    state.bus.log_request(
        "api",
        &req.language,
        json!({ "endpoint": "/tasks/quick", "code_chars": req.code.len() }),
    );
    let resp = state.platform.quick_run(req).await?;
    Ok(Json(resp))
}

/// POST /tasks/fix (also mounted at /agent/fix for peer requests).
pub(crate) async fn fix(
    State(state): State<Arc<ApiState>>,
    Json(mut req): Json<FixRequest>,
) -> Result<Json<FixResponse>, ApiError> {
    req.errors.retain(|e| !e.trim().is_empty());
    if req.errors.is_empty() {
        return Err(ApiError::BadRequest("at least one error is required".into()));
    }
    if let Some(lang) = req.language.as_deref() {
        req.language = Some(canonical_language(lang)?.to_string());
    }
    let _guard = state
        .shutdown
        .begin_work()
        .ok_or_else(|| ApiError::Unavailable("daemon is shutting down".into()))?;

    state.bus.log_request(
        "api",
        req.language.as_deref().unwrap_or("any"),
        json!({ "endpoint": "/tasks/fix", "kind": req.kind, "errors": req.errors.len() }),
    );
    let resp = state.platform.fix(req).await?;
    Ok(Json(resp))
}
