//! Prometheus metrics for the gateway.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`,
//! defines metric name constants, provides the request-metrics middleware
//! and exposes the `/metrics` endpoint handler.

use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;
use tracing::warn;

use crate::handlers::META_MARKER;

// -- Metric name constants ----------------------------------------------------

/// Total HTTP requests (counter). Labels: method, path, status.
pub const HTTP_REQUESTS_TOTAL: &str = "gemdrive_http_requests_total";

/// HTTP request duration in seconds (histogram). Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "gemdrive_http_request_duration_seconds";

/// Authorization handshake steps (counter). Labels: stage, outcome.
pub const AUTH_HANDSHAKES_TOTAL: &str = "gemdrive_auth_handshakes_total";

/// Total bytes accepted by backend writes (counter).
pub const BYTES_WRITTEN_TOTAL: &str = "gemdrive_bytes_written_total";

// -- Global recorder installation ---------------------------------------------

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus recorder. Idempotent, so tests may call it
/// repeatedly.
pub fn init_metrics() -> &'static PrometheusHandle {
    PROMETHEUS_HANDLE.get_or_init(|| {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        if let Err(e) = metrics::set_global_recorder(recorder) {
            warn!("Metrics recorder already installed: {}", e);
        }
        handle
    })
}

/// Register metric descriptions. Call once after `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total HTTP requests");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(
        AUTH_HANDSHAKES_TOTAL,
        "Authorization handshake steps by stage and outcome"
    );
    describe_counter!(BYTES_WRITTEN_TOTAL, "Total bytes written to backends");
}

/// Count one handshake step.
pub fn record_handshake(stage: &'static str, outcome: &'static str) {
    counter!(AUTH_HANDSHAKES_TOTAL, "stage" => stage, "outcome" => outcome).increment(1);
}

// -- Metrics middleware -------------------------------------------------------

/// Records request count and latency for every request except `/metrics`.
pub async fn metrics_middleware(
    req: Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    if req.uri().path() == "/metrics" {
        return next.run(req).await;
    }

    let method = req.method().to_string();
    let path = normalize_path(req.uri().path());

    let start = Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path.clone(), "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

// -- Path normalization -------------------------------------------------------

/// Map a request path to a low-cardinality label.
///
/// - `/`, `/healthz`, `/metrics` stay as they are
/// - `/docs/a/gemdrive/meta.json` -> `/{mount}/gemdrive/meta.json`
/// - `/gemdrive/authorize` -> `/gemdrive/authorize`
/// - `/docs` -> `/{mount}`
/// - `/docs/a/b.txt` -> `/{mount}/{path}`
fn normalize_path(path: &str) -> String {
    match path {
        "/" | "/healthz" | "/metrics" => return path.to_string(),
        _ => {}
    }

    if let Some(idx) = path.find(META_MARKER) {
        let op = path[idx + META_MARKER.len()..]
            .split('/')
            .next()
            .unwrap_or_default();
        let op = match op {
            "meta.json" | "images" | "authorize" => op,
            _ => "{op}",
        };
        let prefix = if path[..idx].trim_matches('/').is_empty() {
            ""
        } else {
            "/{mount}"
        };
        return format!("{prefix}/gemdrive/{op}");
    }

    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return "/".to_string();
    }
    match trimmed.find('/') {
        None => "/{mount}".to_string(),
        Some(_) => "/{mount}/{path}".to_string(),
    }
}

// -- Metrics endpoint handler -------------------------------------------------

/// `GET /metrics`: Prometheus exposition text.
pub async fn metrics_handler() -> Response {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "Metrics are disabled").into_response(),
    }
}
