use axum::{body::Body, extract::Request, middleware::Next, response::Response};
use std::time::Instant;

use crate::metrics::global_metrics;

/// Record `api_requests_total{method,path,status}` and
/// `api_request_duration_seconds{path}` for every request.
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response {
    let method = request.method().to_string();
    let path = normalize_path(request.uri().path());
    let start = Instant::now();

    let response = next.run(request).await;

    let status = response.status().as_u16().to_string();
    let m = global_metrics();
    m.increment_counter(
        "api_requests_total",
        &[("method", &method), ("path", &path), ("status", &status)],
    );
    m.record_histogram(
        "api_request_duration_seconds",
        &[("path", &path)],
        start.elapsed().as_secs_f64(),
    );

    response
}

/// Collapse id-like segments so label cardinality stays bounded.
///
/// `/events/task-end` keeps its kind; uuids and numbers become `:id`.
pub fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path
        .split('/')
        .map(|seg| {
            let is_uuid = seg.len() == 36 && seg.chars().filter(|c| *c == '-').count() == 4;
            let is_number = !seg.is_empty() && seg.chars().all(|c| c.is_ascii_digit());
            if is_uuid || is_number {
                ":id"
            } else {
                seg
            }
        })
        .collect();
    segments.join("/")
}
