use cs_telemetry::logging::{self, LogFormat};

#[test]
fn init_logging_is_idempotent() {
    logging::init_logging("test-service", "debug");
    logging::init_logging("test-service", "info");
    tracing::info!(key = "value", "human-readable log line");
}

#[test]
fn json_init_after_text_is_a_noop() {
    logging::init_with_format("test-service-json", "info", LogFormat::Json);
    tracing::info!(key = "value", "json log line");
}
