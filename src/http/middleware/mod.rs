//! Request middleware.
//!
//! Order, outermost first: request id → CORS → `telemetry::track` →
//! `logging::log_requests` → timeout → panic catcher → handler.

pub mod logging;
pub mod telemetry;

use std::any::Any;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::http::response::ApiError;
use crate::observability::{self, KeyValue};

pub use logging::log_requests;
pub use telemetry::{status_class, track, HttpMetrics, HttpTelemetry};

/// Response for a handler that panicked.
///
/// The panic layer has no handle on the app state, so the record goes
/// through the process-wide logger when one is installed.
pub fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    match observability::global() {
        Some(telemetry) => telemetry
            .logger()
            .error("Handler panicked", &[KeyValue::new("panic", detail.to_string())]),
        None => tracing::error!(panic = %detail, "Handler panicked"),
    }
    ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
}
