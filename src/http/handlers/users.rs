//! `/api/users` handlers.
//!
//! Handlers annotate the server span installed by the telemetry middleware
//! (via `current_span`) and log through the shared `Logger`, so every
//! record they produce is correlated with the request.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use crate::http::response::{ok, success, ApiError, PaginatedResponse, Pagination};
use crate::http::server::AppState;
use crate::models::{CreateUserRequest, UpdateUserRequest};
use crate::observability::trace::current_span;
use crate::observability::{saturating_i64, KeyValue};
use crate::repository::RepositoryError;

pub const DEFAULT_PAGE_SIZE: usize = 10;
pub const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Default, Deserialize)]
pub struct PageParams {
    pub page: Option<String>,
    pub limit: Option<String>,
}

impl PageParams {
    /// Page numbers below 1 become 1; sizes outside `1..=100` become 10.
    pub fn resolve(&self) -> (usize, usize) {
        let page = self
            .page
            .as_deref()
            .and_then(|p| p.parse::<i64>().ok())
            .filter(|p| *p >= 1)
            .map(|p| p as usize)
            .unwrap_or(1);
        let limit = self
            .limit
            .as_deref()
            .and_then(|l| l.parse::<usize>().ok())
            .filter(|l| (1..=MAX_PAGE_SIZE).contains(l))
            .unwrap_or(DEFAULT_PAGE_SIZE);
        (page, limit)
    }
}

fn parse_id(raw: &str) -> Result<i64, ApiError> {
    raw.parse().map_err(|_| ApiError::bad_request("Invalid user ID"))
}

fn invalid_body(detail: impl std::fmt::Display) -> ApiError {
    ApiError::bad_request(format!("Invalid request data: {}", detail))
}

fn annotate(attrs: impl IntoIterator<Item = KeyValue>) {
    if let Some(span) = current_span() {
        span.set_attributes(attrs);
    }
}

/// `GET /api/`
pub async fn api_index() -> Response {
    Json(serde_json::json!({
        "message": "OpenTelemetry Example API",
        "version": "1.0.0",
        "status": "running",
    }))
    .into_response()
}

/// `GET /api/users`
pub async fn get_users(State(state): State<AppState>, Query(params): Query<PageParams>) -> Result<Response, ApiError> {
    annotate([
        KeyValue::new("handler", "GetUsers"),
        KeyValue::new("operation", "list_users"),
    ]);
    state.logger.info("Getting users list", &[]);

    let (page, limit) = params.resolve();
    // Pages past the end read nothing; they must not wrap around.
    let offset = page.saturating_sub(1).saturating_mul(limit);
    annotate([
        KeyValue::new("pagination.page", saturating_i64(page)),
        KeyValue::new("pagination.limit", saturating_i64(limit)),
        KeyValue::new("pagination.offset", saturating_i64(offset)),
    ]);
    if let Some(span) = current_span() {
        span.add_event(
            "pagination_parsed",
            vec![
                KeyValue::new("page", saturating_i64(page)),
                KeyValue::new("limit", saturating_i64(limit)),
                KeyValue::new("offset", saturating_i64(offset)),
            ],
        );
    }

    let users = match state.users.get_all(limit, offset).await {
        Ok(users) => users,
        Err(e) => {
            state.logger.log_error(
                &e,
                "Failed to retrieve users from database",
                &[
                    KeyValue::new("page", saturating_i64(page)),
                    KeyValue::new("limit", saturating_i64(limit)),
                    KeyValue::new("offset", saturating_i64(offset)),
                ],
            );
            return Err(ApiError::internal("Failed to retrieve users"));
        }
    };

    let total = match state.users.count().await {
        Ok(total) => total,
        Err(e) => {
            state.logger.log_error(&e, "Failed to count users in database", &[]);
            return Err(ApiError::internal("Failed to count users"));
        }
    };

    let total_pages = total.div_ceil(limit);
    annotate([
        KeyValue::new("result.users_count", saturating_i64(users.len())),
        KeyValue::new("result.total_count", saturating_i64(total)),
        KeyValue::new("result.total_pages", saturating_i64(total_pages)),
    ]);
    state.logger.info(
        "Successfully retrieved users",
        &[
            KeyValue::new("users_count", saturating_i64(users.len())),
            KeyValue::new("total_count", saturating_i64(total)),
            KeyValue::new("page", saturating_i64(page)),
            KeyValue::new("limit", saturating_i64(limit)),
        ],
    );

    let body = PaginatedResponse {
        success: true,
        data: users,
        pagination: Pagination {
            page,
            limit,
            total,
            total_pages,
        },
    };
    Ok(Json(body).into_response())
}

/// `GET /api/users/{id}`
pub async fn get_user(State(state): State<AppState>, Path(id): Path<String>) -> Result<Response, ApiError> {
    let id = parse_id(&id)?;
    match state.users.get_by_id(id).await {
        Ok(user) => Ok(ok(user)),
        Err(RepositoryError::NotFound) => Err(ApiError::not_found("User not found")),
        Err(e) => {
            state.logger.log_error(&e, "Failed to retrieve user", &[KeyValue::new("user.id", id)]);
            Err(ApiError::internal("Failed to retrieve user"))
        }
    }
}

/// `POST /api/users`
pub async fn create_user(
    State(state): State<AppState>,
    payload: Result<Json<CreateUserRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(req) = payload.map_err(|e| invalid_body(e.body_text()))?;
    req.validate().map_err(invalid_body)?;

    if state.users.get_by_email(&req.email).await.is_ok() {
        return Err(ApiError::conflict("Email already exists"));
    }

    match state.users.create(&req).await {
        Ok(user) => {
            state.logger.info("User created", &[KeyValue::new("user.id", user.id)]);
            Ok(success(StatusCode::CREATED, Some(user), Some("User created successfully")))
        }
        Err(RepositoryError::DuplicateEmail(_)) => Err(ApiError::conflict("Email already exists")),
        Err(e) => {
            state.logger.log_error(&e, "Failed to create user", &[]);
            Err(ApiError::internal("Failed to create user"))
        }
    }
}

/// `PUT /api/users/{id}`
pub async fn update_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<UpdateUserRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let id = parse_id(&id)?;
    let Json(req) = payload.map_err(|e| invalid_body(e.body_text()))?;
    req.validate().map_err(invalid_body)?;

    if let Some(email) = &req.email {
        if let Ok(existing) = state.users.get_by_email(email).await {
            if existing.id != id {
                return Err(ApiError::conflict("Email already exists"));
            }
        }
    }

    match state.users.update(id, &req).await {
        Ok(user) => Ok(success(StatusCode::OK, Some(user), Some("User updated successfully"))),
        Err(RepositoryError::NotFound) => Err(ApiError::not_found("User not found")),
        Err(RepositoryError::DuplicateEmail(_)) => Err(ApiError::conflict("Email already exists")),
        Err(e) => {
            state.logger.log_error(&e, "Failed to update user", &[KeyValue::new("user.id", id)]);
            Err(ApiError::internal("Failed to update user"))
        }
    }
}

/// `DELETE /api/users/{id}`
pub async fn delete_user(State(state): State<AppState>, Path(id): Path<String>) -> Result<Response, ApiError> {
    let id = parse_id(&id)?;
    match state.users.delete(id).await {
        Ok(()) => Ok(success::<()>(StatusCode::OK, None, Some("User deleted successfully"))),
        Err(RepositoryError::NotFound) => Err(ApiError::not_found("User not found")),
        Err(e) => {
            state.logger.log_error(&e, "Failed to delete user", &[KeyValue::new("user.id", id)]);
            Err(ApiError::internal("Failed to delete user"))
        }
    }
}
