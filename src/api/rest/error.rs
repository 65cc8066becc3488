//! `ProxyError` → HTTP response mapping.

use axum::Json;
use axum::response::{IntoResponse, Response};
use http::{HeaderValue, StatusCode};
use serde_json::json;

use crate::domain::error::ProxyError;

/// Client-closed-request; the standard codes have no slot for "the client
/// is already gone", so the nginx convention is used.
const CLIENT_CLOSED_REQUEST: u16 = 499;

fn status_of(err: &ProxyError) -> StatusCode {
    match err {
        ProxyError::NotFound { .. } => StatusCode::NOT_FOUND,
        ProxyError::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
        ProxyError::PathForbidden { .. } => StatusCode::FORBIDDEN,
        ProxyError::Unauthorized => StatusCode::UNAUTHORIZED,
        ProxyError::RateLimited { .. } | ProxyError::QueueFull { .. } => {
            StatusCode::TOO_MANY_REQUESTS
        }
        ProxyError::QueueExpired { .. } | ProxyError::UpstreamTimeout { .. } => {
            StatusCode::GATEWAY_TIMEOUT
        }
        ProxyError::Network { .. } => StatusCode::BAD_GATEWAY,
        ProxyError::Configuration { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        ProxyError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        ProxyError::Canceled => {
            StatusCode::from_u16(CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::BAD_GATEWAY)
        }
    }
}

/// Render a pipeline error as the client-facing response.
#[must_use]
pub fn error_response(err: &ProxyError) -> Response {
    let status = status_of(err);
    let mut response = (
        status,
        Json(json!({
            "error": err.to_string(),
            "kind": err.kind(),
        })),
    )
        .into_response();

    if let ProxyError::RateLimited {
        retry_after: Some(after),
        ..
    } = err
        && let Ok(value) = HeaderValue::from_str(&after.as_secs().max(1).to_string())
    {
        response.headers_mut().insert("retry-after", value);
    }

    response
}
