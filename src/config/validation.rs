//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, pool limits consistent)
//! - Reject unknown log levels and empty service identity
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: AppConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;

use crate::config::schema::AppConfig;
use crate::observability::logging::Severity;

/// One semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

pub fn validate_config(config: &AppConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let server = &config.server;
    if server.host.trim().is_empty() {
        errors.push(ValidationError::new("server.host", "must not be empty"));
    }
    if server.request_timeout_secs == 0 {
        errors.push(ValidationError::new("server.request_timeout_secs", "must be greater than 0"));
    }

    let db = &config.database;
    if db.max_open_connections == 0 {
        errors.push(ValidationError::new("database.max_open_connections", "must be greater than 0"));
    }
    if db.max_idle_connections > db.max_open_connections {
        errors.push(ValidationError::new(
            "database.max_idle_connections",
            format!(
                "must not exceed max_open_connections ({})",
                db.max_open_connections
            ),
        ));
    }
    if db.monitor_interval_secs == 0 {
        errors.push(ValidationError::new("database.monitor_interval_secs", "must be greater than 0"));
    }

    let telemetry = &config.telemetry;
    if telemetry.service_name.trim().is_empty() {
        errors.push(ValidationError::new("telemetry.service_name", "must not be empty"));
    }
    if telemetry.log_level.parse::<Severity>().is_err() {
        errors.push(ValidationError::new(
            "telemetry.log_level",
            format!("unknown level '{}' (expected debug, info, warn, error)", telemetry.log_level),
        ));
    }
    let any_export = telemetry.enable_tracing || telemetry.enable_metrics || telemetry.enable_logging;
    if any_export && telemetry.otlp_endpoint.trim().is_empty() {
        errors.push(ValidationError::new("telemetry.otlp_endpoint", "must not be empty when export is enabled"));
    }
    if telemetry.metrics_interval_secs == 0 {
        errors.push(ValidationError::new("telemetry.metrics_interval_secs", "must be greater than 0"));
    }
    if telemetry.export_timeout_secs == 0 {
        errors.push(ValidationError::new("telemetry.export_timeout_secs", "must be greater than 0"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(validate_config(&AppConfig::default()).is_ok());
    }

    #[test]
    fn test_reports_every_error() {
        let mut config = AppConfig::default();
        config.database.max_open_connections = 2;
        config.database.max_idle_connections = 5;
        config.telemetry.log_level = "loud".into();
        config.telemetry.service_name = " ".into();

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "database.max_idle_connections",
                "telemetry.service_name",
                "telemetry.log_level"
            ]
        );
    }

    #[test]
    fn test_empty_endpoint_allowed_when_export_disabled() {
        let mut config = AppConfig::default();
        config.telemetry.otlp_endpoint.clear();
        assert!(validate_config(&config).is_err());

        config.telemetry.enable_tracing = false;
        config.telemetry.enable_metrics = false;
        config.telemetry.enable_logging = false;
        assert!(validate_config(&config).is_ok());
    }
}
