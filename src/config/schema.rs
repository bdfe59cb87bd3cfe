//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from config files;
//! every field has a default so an empty file (or no file) is valid.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the service.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// HTTP listener settings.
    pub server: ServerConfig,

    /// Connection pool and monitor settings.
    pub database: DatabaseConfig,

    /// Telemetry providers and exporters.
    pub telemetry: TelemetryConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,

    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,

    /// Grace period for in-flight requests at shutdown.
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout_secs: 30,
            shutdown_timeout_secs: 30,
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Connection pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Logical database name, reported as `db.name`.
    pub name: String,

    pub max_open_connections: usize,
    pub max_idle_connections: usize,

    /// Connections older than this are closed instead of reused.
    pub conn_max_lifetime_secs: u64,

    /// Idle connections unused for this long are closed by the monitor.
    pub conn_max_idle_time_secs: u64,

    /// How long a caller waits for a free connection.
    pub acquire_timeout_secs: u64,

    /// Interval of the pool health monitor.
    pub monitor_interval_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            name: "otel_example".to_string(),
            max_open_connections: 25,
            max_idle_connections: 5,
            conn_max_lifetime_secs: 300,
            conn_max_idle_time_secs: 60,
            acquire_timeout_secs: 5,
            monitor_interval_secs: 30,
        }
    }
}

impl DatabaseConfig {
    pub fn conn_max_lifetime(&self) -> Duration {
        Duration::from_secs(self.conn_max_lifetime_secs)
    }

    pub fn conn_max_idle_time(&self) -> Duration {
        Duration::from_secs(self.conn_max_idle_time_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub service_version: String,

    /// Deployment environment (`development`, `staging`, `production`).
    pub environment: String,

    /// OTLP/gRPC collector endpoint; `http://` is assumed without a scheme.
    pub otlp_endpoint: String,

    pub enable_tracing: bool,
    pub enable_metrics: bool,
    pub enable_logging: bool,
    pub enable_runtime_metrics: bool,

    /// Minimum log level: `debug`, `info`, `warn`, or `error`.
    pub log_level: String,

    /// Periodic metric export interval.
    pub metrics_interval_secs: u64,

    /// Timeout of a single export call.
    pub export_timeout_secs: u64,

    /// Budget for flushing all providers at shutdown.
    pub shutdown_timeout_secs: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "otel-example-api".to_string(),
            service_version: "1.0.0".to_string(),
            environment: "development".to_string(),
            otlp_endpoint: "localhost:4317".to_string(),
            enable_tracing: true,
            enable_metrics: true,
            enable_logging: true,
            enable_runtime_metrics: true,
            log_level: "info".to_string(),
            metrics_interval_secs: 15,
            export_timeout_secs: 10,
            shutdown_timeout_secs: 10,
        }
    }
}

impl TelemetryConfig {
    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs)
    }

    pub fn export_timeout(&self) -> Duration {
        Duration::from_secs(self.export_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }
}
