//! # Error Handling
//!
//! HTTP-facing error type. Every variant turns into a JSON body of the shape:
//!
//! ```json
//! {
//!   "error": {
//!     "type": "service_unavailable",
//!     "message": "relay is at capacity (64 sessions)",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```
//!
//! WebSocket sessions never use this type; failures inside a session are reported
//! to the client as `error` events (see `protocol`).

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Error categories and their HTTP status:
/// - **BadRequest** → 400 (failed WebSocket handshake)
/// - **ServiceUnavailable** → 503 (relay full)
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    ServiceUnavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::ServiceUnavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

impl AppError {
    fn error_type(&self) -> &'static str {
        match self {
            AppError::BadRequest(_) => "bad_request",
            AppError::ServiceUnavailable(_) => "service_unavailable",
        }
    }

    fn message(&self) -> &str {
        match self {
            AppError::BadRequest(msg) | AppError::ServiceUnavailable(msg) => msg,
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": self.error_type(),
                "message": self.message(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

// The upgrade handshake reports protocol violations (missing headers, wrong
// version) as actix errors; they are the client's fault.
impl From<actix_web::Error> for AppError {
    fn from(err: actix_web::Error) -> Self {
        AppError::BadRequest(err.to_string())
    }
}

/// Shorthand for handler results.
pub type AppResult<T> = Result<T, AppError>;
