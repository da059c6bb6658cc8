//! Gateway error types.
//!
//! [`GatewayError`] is the error type of the HTTP surface and maps each
//! variant to a status code and structured JSON body. [`PubSubError`]
//! covers the event bus and its backends, and [`ProtocolError`] covers
//! frame decoding on the subscription transport.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Structured JSON error response body.
///
/// All error responses follow this shape:
/// ```json
/// {
///   "error": {
///     "code": 1001,
///     "message": "invalid request: topic must not be empty",
///     "details": null
///   }
/// }
/// ```
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Structured error payload.
    pub error: ErrorBody,
}

/// Inner error body with numeric code and human-readable message.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Numeric error code.
    pub code: u32,
    /// Human-readable error message.
    pub message: String,
    /// Optional additional details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Server-side error enum with HTTP status code mapping.
///
/// # Error Code Ranges
///
/// | Range     | Category   | HTTP Status               |
/// |-----------|------------|---------------------------|
/// | 1000–1999 | Validation | 400 Bad Request           |
/// | 3000–3999 | Server     | 500 Internal Server Error |
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Request validation failed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The event bus rejected the operation.
    #[error("pubsub error: {0}")]
    PubSub(#[from] PubSubError),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Returns the numeric error code for this variant.
    #[must_use]
    pub const fn error_code(&self) -> u32 {
        match self {
            Self::InvalidRequest(_) => 1001,
            Self::Internal(_) => 3000,
            Self::PubSub(_) => 3001,
        }
    }

    /// Returns the HTTP status code for this variant.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::PubSub(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.error_code(),
                message: self.to_string(),
                details: None,
            },
        };
        let mut response = axum::Json(body).into_response();
        *response.status_mut() = status;
        response
    }
}

/// Failures raised by a [`crate::pubsub::PubSubEngine`] or by one of its
/// subscriber callbacks.
#[derive(Debug, thiserror::Error)]
pub enum PubSubError {
    /// The backend is not connected (out-of-process brokers only).
    #[error("pubsub backend is not connected")]
    NotConnected,

    /// The backend failed to carry out a request.
    #[error("pubsub backend failure: {0}")]
    Backend(String),

    /// A subscriber callback reported a failure for one delivery.
    #[error("subscriber callback failed: {0}")]
    Callback(String),
}

/// Errors raised while decoding an inbound transport frame.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The frame is not valid JSON or not a message envelope.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// A binary frame did not carry UTF-8 text.
    #[error("binary frame is not valid UTF-8")]
    InvalidUtf8,
}
