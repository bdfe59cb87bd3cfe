//! Users REST API with request-scoped telemetry.
//!
//! Traces, metrics and logs are correlated per request and exported over
//! OTLP/gRPC; see `observability` for the telemetry core.

pub mod config;
pub mod database;
pub mod http;
pub mod lifecycle;
pub mod models;
pub mod observability;
pub mod repository;

pub use config::schema::AppConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
pub use observability::Telemetry;
