//! Configuration loading from disk and the environment.

use std::fs;
use std::path::Path;
use std::str::FromStr;

use crate::config::schema::AppConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Validation(Vec<ValidationError>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Validation(errors) => {
                write!(f, "Validation failed: ")?;
                for (i, err) in errors.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", err)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Load configuration: optional TOML file, then process environment, then validation.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let mut config = match path {
        Some(path) => {
            let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
            parse_config(&content)?
        }
        None => AppConfig::default(),
    };

    apply_env(&mut config, |key| std::env::var(key).ok());
    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

pub fn parse_config(content: &str) -> Result<AppConfig, ConfigError> {
    toml::from_str(content).map_err(ConfigError::Parse)
}

/// Overlay environment variables onto `config`.
///
/// Empty values count as unset. Boolean toggles are enabled only by the
/// exact value `true`. Unparseable numbers keep the current value.
pub fn apply_env(config: &mut AppConfig, lookup: impl Fn(&str) -> Option<String>) {
    let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

    let telemetry = &mut config.telemetry;
    if let Some(v) = get("OTEL_SERVICE_NAME") {
        telemetry.service_name = v;
    }
    if let Some(v) = get("OTEL_SERVICE_VERSION") {
        telemetry.service_version = v;
    }
    if let Some(v) = get("OTEL_ENVIRONMENT").or_else(|| get("APP_ENV")) {
        telemetry.environment = v;
    }
    if let Some(v) = get("OTEL_EXPORTER_OTLP_ENDPOINT") {
        telemetry.otlp_endpoint = v;
    }
    for (key, flag) in [
        ("OTEL_ENABLE_TRACING", &mut telemetry.enable_tracing),
        ("OTEL_ENABLE_METRICS", &mut telemetry.enable_metrics),
        ("OTEL_ENABLE_LOGGING", &mut telemetry.enable_logging),
        ("OTEL_ENABLE_RUNTIME_METRICS", &mut telemetry.enable_runtime_metrics),
    ] {
        if let Some(v) = get(key) {
            *flag = v == "true";
        }
    }
    if let Some(v) = get("LOG_LEVEL") {
        telemetry.log_level = v;
    }

    let server = &mut config.server;
    if let Some(v) = get("SERVER_HOST") {
        server.host = v;
    }
    set_parsed(&get, "SERVER_PORT", &mut server.port);

    let db = &mut config.database;
    if let Some(v) = get("DB_NAME") {
        db.name = v;
    }
    set_parsed(&get, "DB_MAX_OPEN_CONNS", &mut db.max_open_connections);
    set_parsed(&get, "DB_MAX_IDLE_CONNS", &mut db.max_idle_connections);
    set_parsed(&get, "DB_CONN_MAX_LIFETIME_SECS", &mut db.conn_max_lifetime_secs);
    set_parsed(&get, "DB_MONITOR_INTERVAL_SECS", &mut db.monitor_interval_secs);
}

fn set_parsed<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T) {
    let Some(raw) = get(key) else { return };
    match raw.parse() {
        Ok(v) => *target = v,
        Err(_) => tracing::warn!(key = %key, value = %raw, "Ignoring unparseable environment value"),
    }
}
