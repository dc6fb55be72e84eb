//! Request handlers for the two addressing modes.
//!
//! - [`meta`]: paths containing the `gemdrive/` marker (`meta.json`,
//!   `images/<size>/<name>`, `authorize`).
//! - [`file`]: everything else, dispatched on the HTTP method.

pub mod file;
pub mod meta;

use std::collections::HashMap;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Method};
use axum::response::Response;
use futures_util::StreamExt;

use crate::errors::GatewayError;
use crate::storage::backend::ByteStream;
use crate::AppState;

/// Name of the token in the query string and in the cookie.
pub const TOKEN_NAME: &str = "access_token";

/// Path segment separating the target path from a meta operation.
pub const META_MARKER: &str = "gemdrive/";

/// A request after host remapping and path decoding.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub method: Method,
    /// Logical path, percent-decoded.
    pub path: String,
    pub query: HashMap<String, String>,
    pub headers: HeaderMap,
    pub token: Option<String>,
}

impl GatewayRequest {
    /// `true` when the query parameter equals `"true"`.
    pub fn flag(&self, name: &str) -> bool {
        self.query.get(name).map(String::as_str) == Some("true")
    }

    /// Non-empty query parameter value.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.query
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }
}

/// Entry point for every namespace request.
pub async fn dispatch(
    state: &AppState,
    req: GatewayRequest,
    body: Body,
) -> Result<Response, GatewayError> {
    let parts: Vec<&str> = req.path.split(META_MARKER).collect();
    if let [target, op] = parts.as_slice() {
        let (target, op) = (target.to_string(), op.to_string());
        return meta::handle(state, &req, &target, &op, body).await;
    }

    match req.method {
        Method::HEAD => file::head(state, &req).await,
        Method::GET => file::get(state, &req).await,
        Method::PUT => file::put(state, &req, body).await,
        Method::PATCH => file::patch(state, &req, body).await,
        Method::DELETE => file::delete(state, &req).await,
        _ => Err(GatewayError::BadRequest(format!(
            "Unsupported method: {}",
            req.method
        ))),
    }
}

/// Find the caller's token: query string, then `Authorization`, then the
/// cookie.  The first place that has one wins.
pub fn extract_token(query: &HashMap<String, String>, headers: &HeaderMap) -> Option<String> {
    if let Some(token) = query.get(TOKEN_NAME).filter(|t| !t.is_empty()) {
        return Some(token.clone());
    }

    if let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        // `<scheme> <token>`; a header without a second field carries none.
        return value.split_whitespace().nth(1).map(str::to_string);
    }

    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == TOKEN_NAME && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

/// Parse a raw query string into decoded key/value pairs.
pub fn parse_query(raw: Option<&str>) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if let Some(qs) = raw {
        for part in qs.split('&') {
            if let Some((k, v)) = part.split_once('=') {
                map.insert(decode_component(k), decode_component(v));
            } else if !part.is_empty() {
                map.insert(decode_component(part), String::new());
            }
        }
    }
    map
}

fn decode_component(s: &str) -> String {
    let s = s.replace('+', " ");
    percent_encoding::percent_decode_str(&s)
        .decode_utf8_lossy()
        .into_owned()
}

/// Adapt a request body into a backend byte source.
pub fn body_stream(body: Body) -> ByteStream {
    let stream = body.into_data_stream();
    Box::pin(tokio_util::io::StreamReader::new(
        stream.map(|result| result.map_err(std::io::Error::other)),
    ))
}

/// `Content-Type` for a path, from its extension.
pub fn content_type_for(path: &str) -> HeaderValue {
    let mime = mime_guess::from_path(path.trim_end_matches('/')).first_or_octet_stream();
    HeaderValue::from_str(mime.as_ref())
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"))
}

/// Header value from a number.
pub fn header_number(n: u64) -> HeaderValue {
    HeaderValue::from(n)
}
