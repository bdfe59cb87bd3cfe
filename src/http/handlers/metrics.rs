//! `GET /metrics`: data-layer health plus pool statistics.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::database::PoolStats;
use crate::http::server::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseMetrics {
    pub healthy: bool,
    pub error: String,
    pub stats: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApplicationMetrics {
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MetricsReport {
    pub database: DatabaseMetrics,
    pub application: ApplicationMetrics,
    pub message: String,
}

fn stats_json(stats: &PoolStats) -> serde_json::Value {
    serde_json::to_value(stats).unwrap_or(serde_json::Value::Null)
}

pub async fn get_metrics(State(state): State<AppState>) -> Response {
    let health = state.health.check_health().await;
    let stats = state.health.pool_stats();

    let status = if health.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let report = MetricsReport {
        database: DatabaseMetrics {
            healthy: health.is_ok(),
            error: health.err().map(|e| e.to_string()).unwrap_or_default(),
            stats: stats_json(&stats),
        },
        application: ApplicationMetrics {
            status: "running".to_string(),
        },
        message: "Application and database metrics".to_string(),
    };
    (status, Json(report)).into_response()
}
