use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use cs_api_types::BusStats;
use cs_telemetry::metrics::global_metrics;

use super::state::ApiState;
use crate::api_error::ApiError;
use crate::protocol::{BusFilter, BusKind, BusMessage};

const DEFAULT_HISTORY_LIMIT: usize = 100;

#[derive(Debug, Default, Deserialize)]
pub(crate) struct HistoryQuery {
    /// Comma-separated kinds.
    pub kind: Option<String>,
    pub source: Option<String>,
    pub target: Option<String>,
    pub limit: Option<usize>,
}

impl HistoryQuery {
    fn filter(&self) -> Result<BusFilter, ApiError> {
        let mut filter = BusFilter::all();
        if let Some(kinds) = &self.kind {
            for raw in kinds.split(',').filter(|k| !k.trim().is_empty()) {
                let kind: BusKind = raw
                    .parse()
                    .map_err(|e: crate::protocol::UnknownKind| ApiError::BadRequest(e.to_string()))?;
                filter = filter.with_kind(kind);
            }
        }
        filter.source = self.source.clone();
        filter.target = self.target.clone();
        Ok(filter)
    }
}

/// GET /bus/history
pub(crate) async fn history(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<BusMessage>>, ApiError> {
    let filter = query.filter()?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .min(state.history_limit_cap);
    Ok(Json(state.bus.history(&filter, limit)))
}

/// GET /bus/stats
pub(crate) async fn stats(State(state): State<Arc<ApiState>>) -> Json<BusStats> {
    Json(state.bus.stats())
}

/// POST /events/{kind} -- webhook entry point. The body becomes the message
/// payload; `source`/`target` fields in the body are lifted into the
/// envelope.
pub(crate) async fn post_event(
    State(state): State<Arc<ApiState>>,
    Path(kind): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let kind: BusKind = kind
        .parse()
        .map_err(|e: crate::protocol::UnknownKind| ApiError::BadRequest(e.to_string()))?;

    let source = body
        .get("source")
        .and_then(Value::as_str)
        .unwrap_or("webhook")
        .to_string();
    let target = body
        .get("target")
        .and_then(Value::as_str)
        .map(str::to_string);

    global_metrics().increment_counter("cs_webhook_events_total", &[("kind", kind.as_str())]);
    let seq = state.bus.publish(kind, source, target, body, None);
    Ok(Json(json!({ "accepted": seq.is_some(), "seq": seq })))
}
