//! Direct file access: HEAD, GET, PUT, PATCH and DELETE on a path.

use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::counter;
use tokio::io::AsyncReadExt;
use tokio_util::io::ReaderStream;
use tracing::debug;

use super::{body_stream, content_type_for, header_number, GatewayRequest};
use crate::errors::GatewayError;
use crate::item::{dir_key, is_dir_path, split_parent};
use crate::metrics::BYTES_WRITTEN_TOTAL;
use crate::storage::backend::WritableBackend;
use crate::AppState;

// -- Range parsing ------------------------------------------------------------

/// A single `bytes=<start>-<end>` range.  A missing start means 0, a
/// missing end means end of file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

/// Parse a `Range` header.  Only one range is supported.
pub fn parse_range(value: &str) -> Result<ByteRange, GatewayError> {
    let invalid = || GatewayError::BadRequest(format!("Invalid Range header: {value}"));

    let (unit, bounds) = value.trim().split_once('=').ok_or_else(invalid)?;
    if unit.trim() != "bytes" {
        return Err(invalid());
    }

    let bounds: Vec<&str> = bounds.trim().split('-').collect();
    let [start, end] = bounds.as_slice() else {
        return Err(invalid());
    };

    let start = if start.is_empty() {
        0
    } else {
        start.parse::<u64>().map_err(|_| invalid())?
    };
    let end = if end.is_empty() {
        None
    } else {
        Some(end.parse::<u64>().map_err(|_| invalid())?)
    };

    if matches!(end, Some(end) if end < start) {
        return Err(invalid());
    }
    Ok(ByteRange { start, end })
}

/// Resolve a range against the file size.  Returns inclusive `(start,
/// end)`, clamping the end to the last byte.
pub fn resolve_range(range: ByteRange, size: u64) -> Result<(u64, u64), GatewayError> {
    if range.start >= size {
        return Err(GatewayError::RangeNotSatisfiable { size });
    }
    let last = size - 1;
    let end = range.end.map_or(last, |end| end.min(last));
    Ok((range.start, end))
}

// -- Handlers -----------------------------------------------------------------

/// `HEAD`: size of the named child from its parent's listing.
pub async fn head(state: &AppState, req: &GatewayRequest) -> Result<Response, GatewayError> {
    if !state.auth.can_read(req.token(), &req.path) {
        return Err(GatewayError::Unauthorized);
    }

    let (parent, name) = split_parent(&req.path);
    let size = if name.is_empty() {
        state.backend.list("/", 0).await?.size
    } else {
        let listing = state.backend.list(&parent, 1).await?;
        let key = if is_dir_path(&req.path) {
            dir_key(&name)
        } else {
            name
        };
        listing
            .children
            .get(&key)
            .map(|child| child.size)
            .ok_or_else(|| GatewayError::not_found(&req.path))?
    };

    let mut response = StatusCode::OK.into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, content_type_for(&req.path));
    headers.insert(header::CONTENT_LENGTH, header_number(size));
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    Ok(response)
}

/// `GET`: stream a file, honoring a single byte range.  Directories are
/// served through their `index.html`.
pub async fn get(state: &AppState, req: &GatewayRequest) -> Result<Response, GatewayError> {
    if !state.auth.can_read(req.token(), &req.path) {
        return Err(GatewayError::Unauthorized);
    }

    if is_dir_path(&req.path) {
        return serve_index(state, &req.path).await;
    }

    let range = req
        .headers
        .get(header::RANGE)
        .map(|v| {
            v.to_str()
                .map_err(|_| GatewayError::BadRequest("Invalid Range header".to_string()))
                .and_then(parse_range)
        })
        .transpose()?;

    let (offset, length) = match range {
        Some(r) => (r.start, r.end.map_or(0, |end| (end - r.start).saturating_add(1))),
        None => (0, 0),
    };

    let (item, data) = state.backend.read(&req.path, offset, length).await?;

    let mut response = match range {
        Some(r) => {
            let (start, end) = resolve_range(r, item.size)?;
            let span = end - start + 1;
            let mut response = (
                StatusCode::PARTIAL_CONTENT,
                Body::from_stream(ReaderStream::new(data.take(span))),
            )
                .into_response();
            let headers = response.headers_mut();
            if let Ok(value) =
                HeaderValue::from_str(&format!("bytes {start}-{end}/{}", item.size))
            {
                headers.insert(header::CONTENT_RANGE, value);
            }
            headers.insert(header::CONTENT_LENGTH, header_number(span));
            response
        }
        None => {
            let mut response =
                (StatusCode::OK, Body::from_stream(ReaderStream::new(data))).into_response();
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, header_number(item.size));
            response
        }
    };

    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, content_type_for(&req.path));
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if req.flag("download") {
        headers.insert(
            header::CONTENT_DISPOSITION,
            HeaderValue::from_static("attachment"),
        );
    }
    Ok(response)
}

async fn serve_index(state: &AppState, dir: &str) -> Result<Response, GatewayError> {
    let index = format!("{dir}index.html");
    let (item, data) = state.backend.read(&index, 0, 0).await.map_err(|e| {
        debug!("No index for {}: {}", dir, e);
        GatewayError::BadRequest(format!("Cannot read a directory directly: {dir}"))
    })?;

    let mut response =
        (StatusCode::OK, Body::from_stream(ReaderStream::new(data))).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    headers.insert(header::CONTENT_LENGTH, header_number(item.size));
    Ok(response)
}

/// `PUT`: create a directory (trailing `/`) or replace a whole file.
pub async fn put(
    state: &AppState,
    req: &GatewayRequest,
    body: Body,
) -> Result<Response, GatewayError> {
    let writer = writable(state, req)?;

    if is_dir_path(&req.path) {
        writer.make_dir(&req.path, req.flag("recursive")).await?;
        return Ok(StatusCode::OK.into_response());
    }

    let length = content_length(req)
        .filter(|len| *len > 0)
        .ok_or_else(|| GatewayError::BadRequest("Invalid write size".to_string()))?;

    writer
        .write(
            &req.path,
            body_stream(body),
            0,
            length,
            req.flag("overwrite"),
            true,
        )
        .await?;
    counter!(BYTES_WRITTEN_TOTAL).increment(length);
    Ok(StatusCode::OK.into_response())
}

/// `PATCH`: write the body at `offset`, keeping the rest of the file.
pub async fn patch(
    state: &AppState,
    req: &GatewayRequest,
    body: Body,
) -> Result<Response, GatewayError> {
    let writer = writable(state, req)?;

    let offset = match req.param("offset") {
        None => 0,
        Some(raw) => raw
            .parse::<u64>()
            .map_err(|_| GatewayError::BadRequest("Invalid offset".to_string()))?,
    };
    let length = content_length(req)
        .ok_or_else(|| GatewayError::BadRequest("Invalid content length".to_string()))?;

    writer
        .write(&req.path, body_stream(body), offset, length, true, false)
        .await?;
    counter!(BYTES_WRITTEN_TOTAL).increment(length);
    Ok(StatusCode::OK.into_response())
}

/// `DELETE`: remove a file or directory.
pub async fn delete(state: &AppState, req: &GatewayRequest) -> Result<Response, GatewayError> {
    let writer = writable(state, req)?;
    writer.delete(&req.path, req.flag("recursive")).await?;
    Ok(StatusCode::OK.into_response())
}

/// Authorize a mutation and resolve the write capability.
fn writable<'a>(
    state: &'a AppState,
    req: &GatewayRequest,
) -> Result<&'a dyn WritableBackend, GatewayError> {
    if !state.auth.can_write(req.token(), &req.path) {
        return Err(GatewayError::Unauthorized);
    }
    state
        .backend
        .writable()
        .ok_or_else(GatewayError::write_unsupported)
}

fn content_length(req: &GatewayRequest) -> Option<u64> {
    req.headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}
