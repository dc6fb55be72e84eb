//! Meta-protocol operations under the `gemdrive/` marker.

use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use tokio_util::io::ReaderStream;
use tracing::info;

use super::{header_number, GatewayRequest, TOKEN_NAME};
use crate::auth::{Key, MAX_KEY_BYTES};
use crate::errors::GatewayError;
use crate::AppState;

/// Cookie lifetime for a minted token (one year).
const COOKIE_MAX_AGE: u64 = 86400 * 365;

/// Dispatch a meta operation.  `target` is the path before the marker
/// (always ending in `/`), `op` the remainder after it.
pub async fn handle(
    state: &AppState,
    req: &GatewayRequest,
    target: &str,
    op: &str,
    body: Body,
) -> Result<Response, GatewayError> {
    if op == "authorize" {
        return authorize(state, req, body).await;
    }

    if !state.auth.can_read(req.token(), target) {
        return Err(GatewayError::Unauthorized);
    }

    if op == "meta.json" {
        return meta_json(state, req, target).await;
    }

    let parts: Vec<&str> = op.split('/').collect();
    match parts.as_slice() {
        ["images", size, filename] if !filename.is_empty() => {
            image(state, target, size, filename).await
        }
        _ => Err(GatewayError::NotFound(format!("Unknown operation: {op}"))),
    }
}

/// `meta.json[?depth=N]`: the listing of `target` as JSON.
async fn meta_json(
    state: &AppState,
    req: &GatewayRequest,
    target: &str,
) -> Result<Response, GatewayError> {
    let depth = match req.param("depth") {
        None => 1,
        Some(raw) => raw
            .parse::<u32>()
            .map_err(|_| GatewayError::BadRequest("Invalid depth param".to_string()))?,
    };

    let item = state.backend.list(target, depth).await?;
    Ok(Json(item).into_response())
}

/// `images/<size>/<filename>`: a JPEG rendition no larger than `size`.
async fn image(
    state: &AppState,
    target: &str,
    size: &str,
    filename: &str,
) -> Result<Response, GatewayError> {
    let max_dimension = size
        .parse::<u32>()
        .map_err(|_| GatewayError::BadRequest(format!("Invalid image size: {size}")))?;

    let images = state
        .backend
        .image_server()
        .ok_or_else(GatewayError::images_unsupported)?;

    let path = format!("{target}{filename}");
    let (item, data) = images
        .get_image(&path, max_dimension)
        .await
        .map_err(|e| match e {
            GatewayError::Unsupported(_) | GatewayError::Internal(_) => e,
            other => GatewayError::Internal(other.to_string()),
        })?;

    let mut response =
        (StatusCode::OK, Body::from_stream(ReaderStream::new(data))).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("image/jpeg"));
    headers.insert(header::CONTENT_LENGTH, header_number(item.size));
    Ok(response)
}

/// `authorize`: with `id` and `code` completes a handshake and sets the
/// token cookie; otherwise starts one from the JSON key in the body.
async fn authorize(
    state: &AppState,
    req: &GatewayRequest,
    body: Body,
) -> Result<Response, GatewayError> {
    if let (Some(id), Some(code)) = (req.param("id"), req.param("code")) {
        let auth = state.auth.clone();
        let (id, code) = (id.to_string(), code.to_string());
        let token = tokio::task::spawn_blocking(move || auth.complete_auth(&id, &code))
            .await
            .map_err(|e| GatewayError::Internal(format!("Authorization task failed: {e}")))??;

        let cookie = format!(
            "{TOKEN_NAME}={token}; HttpOnly; Max-Age={COOKIE_MAX_AGE}; Path=/; SameSite=Lax"
        );
        let mut response = (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            token,
        )
            .into_response();
        let value = HeaderValue::from_str(&cookie)
            .map_err(|e| GatewayError::Internal(format!("Invalid cookie: {e}")))?;
        response.headers_mut().insert(header::SET_COOKIE, value);
        return Ok(response);
    }

    let bytes = axum::body::to_bytes(body, MAX_KEY_BYTES)
        .await
        .map_err(|e| GatewayError::BadRequest(format!("Invalid credential body: {e}")))?;
    let key = Key::parse(&bytes)?;
    let auth_id = state.auth.authorize(key)?;
    info!("Authorization {} pending", auth_id);

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        auth_id,
    )
        .into_response())
}
