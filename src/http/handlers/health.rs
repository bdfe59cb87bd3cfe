//! Liveness and readiness.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Response;
use serde::Serialize;

use crate::http::response::{success, ApiError};
use crate::http::server::AppState;
use crate::observability::KeyValue;

#[derive(Serialize)]
struct HealthStatus {
    status: &'static str,
    database: &'static str,
}

/// `GET /health`
pub async fn health_check(State(state): State<AppState>) -> Result<Response, ApiError> {
    if let Err(e) = state.health.check_health().await {
        state.logger.warn("Health check failed", &[KeyValue::new("error", e.to_string())]);
        return Err(ApiError::unavailable("Database connection failed"));
    }
    Ok(success(
        StatusCode::OK,
        Some(HealthStatus {
            status: "healthy",
            database: "connected",
        }),
        Some("Service is healthy"),
    ))
}

/// `GET /ready`
pub async fn readiness_check(State(state): State<AppState>) -> Result<Response, ApiError> {
    if state.health.check_health().await.is_err() {
        return Err(ApiError::unavailable("Service not ready"));
    }
    Ok(success::<()>(StatusCode::OK, None, Some("Service is ready")))
}
