use std::sync::Arc;

use axum::{extract::State, Json};
use serde_json::{json, Value};

use cs_api_types::StatusSnapshot;

use super::state::ApiState;

/// GET /health
pub(crate) async fn health(State(state): State<Arc<ApiState>>) -> Json<Value> {
    let status = if state.shutdown.is_shutting_down() {
        "draining"
    } else {
        "ok"
    };
    Json(json!({
        "status": status,
        "uptime_secs": state.uptime_secs(),
        "inflight": state.shutdown.inflight(),
    }))
}

/// GET /status -- the platform snapshot plus bus stats and uptime owned by
/// the bridge.
pub(crate) async fn get_status(State(state): State<Arc<ApiState>>) -> Json<StatusSnapshot> {
    let mut snapshot = state.platform.status().await;
    snapshot.uptime_secs = state.uptime_secs();
    snapshot.bus = state.bus.stats();
    if snapshot.version.is_empty() {
        snapshot.version = env!("CARGO_PKG_VERSION").to_string();
    }
    Json(snapshot)
}
