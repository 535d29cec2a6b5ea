//! Observability for the code-squad services.
//!
//! - **logging**: text or JSON `tracing-subscriber` setup driven by `RUST_LOG`
//! - **metrics**: labelled counters, gauges and histograms with Prometheus export
//! - **middleware**: axum layer recording per-route request metrics
//! - **tracing_setup**: request-id propagation and task/coordinator spans

pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod tracing_setup;
