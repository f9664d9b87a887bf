// HTTP handlers for the optional metrics endpoint. Thin wrappers around the
// shared Prometheus `Registry`.
use axum::{extract::Extension, http::{HeaderMap, HeaderValue, header::CONTENT_TYPE}};
use prometheus::{Encoder, Registry, TextEncoder};
use std::sync::Arc;

/// Expose Prometheus text-format metrics gathered from the provided
/// `Registry` extension.
pub async fn metrics_handler(Extension(registry): Extension<Arc<Registry>>) -> (HeaderMap, String) {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap_or_default();
    let body = String::from_utf8_lossy(&buffer).to_string();

    let mut headers = HeaderMap::new();
    if let Ok(content_type) = HeaderValue::from_str(encoder.format_type()) {
        headers.insert(CONTENT_TYPE, content_type);
    }
    (headers, body)
}

pub async fn health_handler() -> &'static str {
    "ok"
}
