//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create the Axum router with all handlers
//! - Wire up middleware (request id, CORS, telemetry, logging, timeout, panics)
//! - Bind the server to a listener and drain it on shutdown

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::middleware;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;

use crate::config::ServerConfig;
use crate::database::{Database, HealthCheck};
use crate::http::handlers;
use crate::http::middleware::{log_requests, panic_response, track, HttpTelemetry};
use crate::http::request::{propagate_request_id_layer, set_request_id_layer};
use crate::observability::{Logger, Telemetry, DB_SCOPE};
use crate::repository::UserRepository;

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub users: Arc<UserRepository>,
    pub health: Arc<dyn HealthCheck>,
    pub logger: Arc<Logger>,
}

impl AppState {
    pub fn new(db: Arc<Database>, telemetry: &Telemetry) -> Self {
        let users = Arc::new(UserRepository::new(Arc::clone(&db), telemetry.tracer(DB_SCOPE)));
        Self {
            users,
            health: db,
            logger: telemetry.logger(),
        }
    }
}

/// Requests still running after `timeout` are answered with 408.
pub fn request_timeout_layer(timeout: Duration) -> TimeoutLayer {
    TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, timeout)
}

/// Build the router with every route and middleware layer.
pub fn build_router(state: AppState, telemetry: &Telemetry, request_timeout: Duration) -> Router {
    let http_telemetry = Arc::new(HttpTelemetry::new(telemetry));
    let logger = state.logger.clone();

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::get_metrics))
        .route("/api/", get(handlers::api_index))
        .route("/api/users", get(handlers::get_users).post(handlers::create_user))
        .route(
            "/api/users/{id}",
            get(handlers::get_user)
                .put(handlers::update_user)
                .delete(handlers::delete_user),
        )
        .with_state(state)
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(request_timeout_layer(request_timeout))
        .layer(middleware::from_fn_with_state(logger, log_requests))
        .layer(middleware::from_fn_with_state(http_telemetry, track))
        .layer(CorsLayer::permissive())
        .layer(propagate_request_id_layer())
        .layer(set_request_id_layer())
}

/// HTTP server for the users API.
pub struct HttpServer {
    router: Router,
    config: ServerConfig,
}

impl HttpServer {
    pub fn new(config: ServerConfig, db: Arc<Database>, telemetry: &Telemetry) -> Self {
        let state = AppState::new(db, telemetry);
        let router = build_router(state, telemetry, config.request_timeout());
        Self { router, config }
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Serve on `listener` until `shutdown` resolves, then drain in-flight requests.
    pub async fn run(self, listener: TcpListener, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}
