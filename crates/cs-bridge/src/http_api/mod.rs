// ---------------------------------------------------------------------------
// HTTP API
// ---------------------------------------------------------------------------
//
// Handlers are grouped by concern; this file owns the axum router and the
// middleware stack.

mod bus;
mod metrics;
mod misc;
pub mod state;
mod tasks;
#[cfg(test)]
mod tests;

pub use state::ApiState;

pub use self::router::{api_router, metrics_router};

mod router {
    use super::*;
    use axum::{
        middleware as axum_middleware,
        routing::{get, post},
        Router,
    };
    use std::sync::Arc;
    use tower_http::cors::CorsLayer;
    use tower_http::trace::TraceLayer;

    use cs_telemetry::middleware::metrics_middleware;
    use cs_telemetry::tracing_setup::request_id_middleware;

    /// Build the full API router.
    pub fn api_router(state: Arc<ApiState>) -> Router {
        Router::new()
            .route("/tasks", post(tasks::create_task))
            .route("/tasks/quick", post(tasks::quick_run))
            .route("/tasks/fix", post(tasks::fix))
            .route("/agent/fix", post(tasks::fix))
            .route("/status", get(misc::get_status))
            .route("/health", get(misc::health))
            .route("/metrics", get(metrics::get_metrics_prometheus))
            .route("/metrics/json", get(metrics::get_metrics_json))
            .route("/bus/history", get(bus::history))
            .route("/bus/stats", get(bus::stats))
            .route("/events/{kind}", post(bus::post_event))
            .layer(axum_middleware::from_fn(metrics_middleware))
            .layer(axum_middleware::from_fn(request_id_middleware))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Router for the optional dedicated metrics listener.
    pub fn metrics_router() -> Router {
        Router::new().route("/metrics", get(metrics::get_metrics_prometheus))
    }
}
