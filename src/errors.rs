//! Gateway error types.
//!
//! Every backend and protocol failure is carried by [`GatewayError`], which
//! pairs a status code with a human-readable message.  The enum implements
//! [`axum::response::IntoResponse`] so handlers can simply return
//! `Err(GatewayError::NotFound(..))`; the message becomes the raw body.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Login page served with every 403.
pub const LOGIN_PAGE: &str = include_str!("../assets/login.html");

/// Challenge sent alongside the login page.
pub const WWW_AUTHENTICATE: &str = "emauth realm=\"Everything\", charset=\"UTF-8\"";

/// Structured gateway error.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The path does not exist in the resolved backend.
    #[error("{0}")]
    NotFound(String),

    /// Malformed parameters, existing target without overwrite, non-empty
    /// directory without recursive, and similar client mistakes.
    #[error("{0}")]
    BadRequest(String),

    /// The capability check failed. Deliberately carries no detail.
    #[error("Unauthorized")]
    Unauthorized,

    /// A range whose start lies at or beyond the end of the file.
    #[error("Requested range not satisfiable")]
    RangeNotSatisfiable { size: u64 },

    /// The backend lacks the capability the operation needs.
    #[error("{0}")]
    Unsupported(String),

    /// Catch-all for I/O and serialization failures.
    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    pub fn not_found(path: &str) -> Self {
        GatewayError::NotFound(format!("Not found: {path}"))
    }

    pub fn write_unsupported() -> Self {
        GatewayError::Unsupported("Backend does not support writing".to_string())
    }

    pub fn images_unsupported() -> Self {
        GatewayError::Unsupported("Backend does not support images".to_string())
    }

    /// Return the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthorized => StatusCode::FORBIDDEN,
            GatewayError::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            GatewayError::Unsupported(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => GatewayError::NotFound(err.to_string()),
            std::io::ErrorKind::AlreadyExists => GatewayError::BadRequest(err.to_string()),
            _ => GatewayError::Internal(err.to_string()),
        }
    }
}

impl From<anyhow::Error> for GatewayError {
    fn from(err: anyhow::Error) -> Self {
        GatewayError::Internal(format!("{err:#}"))
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        match self {
            GatewayError::Unauthorized => (
                status,
                [
                    (header::WWW_AUTHENTICATE, WWW_AUTHENTICATE),
                    (header::CONTENT_TYPE, "text/html; charset=utf-8"),
                ],
                LOGIN_PAGE,
            )
                .into_response(),
            GatewayError::RangeNotSatisfiable { size } => {
                let mut response = (status, self.to_string()).into_response();
                if let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}")) {
                    response.headers_mut().insert(header::CONTENT_RANGE, value);
                }
                response
            }
            other => (
                status,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                other.to_string(),
            )
                .into_response(),
        }
    }
}
