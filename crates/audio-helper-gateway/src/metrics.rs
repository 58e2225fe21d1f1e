//! Prometheus metrics recording and endpoint.

use std::time::Instant;

use axum::{extract::Request, middleware::Next, response::Response};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus metrics recorder and return the handle for rendering.
pub fn install_prometheus_recorder() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    Ok(handle)
}

/// Record an HTTP request with its status and duration.
pub fn record_request(path: &str, status: u16, duration_secs: f64) {
    let labels = [("path", path.to_string()), ("status", status.to_string())];
    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_request_duration_seconds", &labels).record(duration_secs);
}

/// Record a model construction and how long it took.
pub fn record_model_load(kind: &str, variant: &str, duration_secs: f64) {
    let labels = [("kind", kind.to_string()), ("variant", variant.to_string())];
    metrics::counter!("model_loads_total", &labels).increment(1);
    metrics::histogram!("model_load_duration_seconds", &labels).record(duration_secs);
}

/// Record an error of a given kind.
pub fn record_error(kind: &str) {
    let labels = [("kind", kind.to_string())];
    metrics::counter!("errors_total", &labels).increment(1);
}

/// Middleware timing every request. Stream bodies count until headers are sent.
pub async fn track_requests(request: Request, next: Next) -> Response {
    let path = request.uri().path().to_string();
    let started = Instant::now();
    let response = next.run(request).await;
    record_request(&path, response.status().as_u16(), started.elapsed().as_secs_f64());
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_request_does_not_panic() {
        // The metrics crate falls back to a no-op recorder when none is installed
        record_request("/api/tts/generate", 200, 0.123);
        record_model_load("asr", "sensevoice", 4.2);
    }

    #[test]
    fn test_record_error_does_not_panic() {
        record_error("inference_failure");
    }
}
