//! JSON response envelopes.
//!
//! # Responsibilities
//! - Uniform `{success, message, data}` / `{success:false, error}` bodies
//! - Map handler failures to status codes via `ApiError`
//!
//! # Design Decisions
//! - Server errors are also recorded on the active span, so its status
//!   carries the message instead of only `HTTP 500`

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::observability::trace::current_span;

#[derive(Debug, Serialize, Deserialize)]
pub struct SuccessResponse<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub page: usize,
    pub limit: usize,
    pub total: usize,
    pub total_pages: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PaginatedResponse<T> {
    pub success: bool,
    pub data: Vec<T>,
    pub pagination: Pagination,
}

pub fn success<T: Serialize>(status: StatusCode, data: Option<T>, message: Option<&str>) -> Response {
    let body = SuccessResponse {
        success: true,
        message: message.map(str::to_string),
        data,
    };
    (status, Json(body)).into_response()
}

pub fn ok<T: Serialize>(data: T) -> Response {
    success(StatusCode::OK, Some(data), None)
}

/// A failed request: status plus the client-facing message.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            if let Some(span) = current_span() {
                span.record_error_message(self.message.clone());
            }
        }
        let body = ErrorResponse {
            success: false,
            error: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}
