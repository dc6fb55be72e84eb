//! Axum router construction.
//!
//! Only `/healthz` and `/metrics` are real routes.  Every other path is
//! part of the mounted namespace and goes through [`handle_request`], which
//! applies the hostname remap, decodes the path and hands off to the
//! handlers.

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, State},
    http::{header, HeaderMap, HeaderValue, Method, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::handlers::{dispatch, extract_token, parse_query, GatewayRequest};
use crate::metrics::{metrics_handler, metrics_middleware};
use crate::AppState;

/// Build the axum [`Router`].
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/metrics", get(metrics_handler))
        .fallback(handle_request)
        .with_state(state)
        // CORS is innermost so OPTIONS short-circuits after headers are set.
        .layer(middleware::from_fn(cors_middleware))
        .layer(middleware::from_fn(common_headers_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(metrics_middleware))
        // Uploads are streamed; no body size cap.
        .layer(DefaultBodyLimit::disable())
}

/// `GET /healthz`: liveness probe.
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

// -- Common headers ------------------------------------------------------------

/// Stamp every response with a request id and the server name.
async fn common_headers_middleware(req: Request<Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    let request_id = uuid::Uuid::new_v4().simple().to_string();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert("x-request-id", value);
    }
    headers.insert(header::SERVER, HeaderValue::from_static("gemdrive"));
    response
}

// -- CORS ----------------------------------------------------------------------

/// Permissive CORS on every response; `OPTIONS` ends here.
async fn cors_middleware(req: Request<Body>, next: Next) -> Response {
    let mut response = if req.method() == Method::OPTIONS {
        StatusCode::OK.into_response()
    } else {
        next.run(req).await
    };

    let headers = response.headers_mut();
    for name in [
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        header::ACCESS_CONTROL_ALLOW_METHODS,
        header::ACCESS_CONTROL_ALLOW_HEADERS,
    ] {
        headers.insert(name, HeaderValue::from_static("*"));
    }
    response
}

// -- Namespace requests --------------------------------------------------------

async fn handle_request(State(state): State<Arc<AppState>>, req: Request<Body>) -> Response {
    let (parts, body) = req.into_parts();

    let host = request_host(&parts.headers);
    let decoded = percent_encoding::percent_decode_str(parts.uri.path())
        .decode_utf8_lossy()
        .into_owned();
    let path = remap_path(&state, host.as_deref(), decoded);

    debug!(
        "{} {} {}",
        parts.method,
        host.as_deref().unwrap_or("-"),
        path
    );

    let query = parse_query(parts.uri.query());
    let token = extract_token(&query, &parts.headers);
    let request = GatewayRequest {
        method: parts.method,
        path,
        query,
        headers: parts.headers,
        token,
    };

    match dispatch(&state, request, body).await {
        Ok(response) => response,
        Err(err) => {
            debug!("Request failed: {}", err);
            err.into_response()
        }
    }
}

/// Hostname as seen by the client, preferring the proxy's forwarded host.
fn request_host(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-host")
        .or_else(|| headers.get(header::HOST))
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Prefix the path with the root mapped to `host`, if any.
fn remap_path(state: &AppState, host: Option<&str>, path: String) -> String {
    match host.and_then(|h| state.config.domain_map.get(h)) {
        Some(root) => format!("{}{}", root.trim_end_matches('/'), path),
        None => path,
    }
}
