//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! HTTP middleware / repository calls
//!     → context.rs (traceparent in, active Context per request future)
//!     → trace.rs   (spans, status policy) → SdkTracerProvider → batch → OTLP traces
//!     → Meter instruments                  → SdkMeterProvider → periodic reader → OTLP metrics
//!     → logging.rs (log records)           → local tracing stream
//!                                          → SdkLoggerProvider → batch → OTLP logs
//! ```
//!
//! # Design Decisions
//! - One explicitly constructed `Telemetry` bundle, passed by `Arc`
//! - A process-wide accessor exists for code with no handle on the bundle
//!   (panic responses); it is set once and returns the same bundle
//! - Every telemetry failure degrades to noop; none reaches a response

pub mod context;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod provider;
pub mod resource;
pub mod trace;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::Resource;

pub use error::TelemetryError;
pub use logging::{Logger, Severity};
pub use opentelemetry::metrics::Meter;
pub use opentelemetry::{KeyValue, Value};
pub use provider::{init_telemetry, TelemetryBuilder, TelemetryProviders};
pub use trace::Tracer;

use crate::config::TelemetryConfig;

/// Instrumentation scope for the HTTP layer.
pub const HTTP_SCOPE: &str = "otel_user_api.http";
/// Instrumentation scope for the data layer.
pub const DB_SCOPE: &str = "otel_user_api.database";

/// Attribute value for a count or size, saturating at `i64::MAX`.
pub fn saturating_i64(n: impl TryInto<i64>) -> i64 {
    n.try_into().unwrap_or(i64::MAX)
}

/// Providers plus the handles the rest of the process uses.
pub struct Telemetry {
    providers: TelemetryProviders,
    logger: Arc<Logger>,
}

impl Telemetry {
    /// Bundle the providers; attaches the remote log sink when logging is enabled.
    pub fn new(providers: TelemetryProviders, min_level: Severity) -> Self {
        Self::with_logger(providers, Logger::new(min_level))
    }

    pub fn with_logger(providers: TelemetryProviders, logger: Logger) -> Self {
        if let Some(lp) = providers.logger_provider() {
            logger.attach_remote(lp);
        }
        Self {
            providers,
            logger: Arc::new(logger),
        }
    }

    /// Everything off: noop tracer and meter, local logging only.
    pub fn disabled(cfg: &TelemetryConfig) -> Self {
        Self::new(
            TelemetryProviders::disabled(resource::service_resource(cfg)),
            Severity::parse_or_default(&cfg.log_level),
        )
    }

    pub fn tracer(&self, scope: &'static str) -> Tracer {
        self.providers.tracer(scope)
    }

    pub fn meter(&self, scope: &'static str) -> Meter {
        self.providers.meter(scope)
    }

    pub fn logger(&self) -> Arc<Logger> {
        Arc::clone(&self.logger)
    }

    pub fn providers(&self) -> &TelemetryProviders {
        &self.providers
    }

    pub fn resource(&self) -> &Resource {
        self.providers.resource()
    }

    pub async fn shutdown(&self, timeout: Duration) -> Result<(), TelemetryError> {
        let result = self.providers.shutdown(timeout).await;
        self.logger.detach_remote();
        result
    }
}

static GLOBAL: OnceLock<Arc<Telemetry>> = OnceLock::new();

/// Install the process-wide bundle. Fails if one is already installed.
///
/// The first install also registers the W3C propagator and the bundle's
/// providers with the `opentelemetry` globals.
pub fn install_global(telemetry: Arc<Telemetry>) -> Result<(), Arc<Telemetry>> {
    GLOBAL.set(Arc::clone(&telemetry))?;
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());
    if let Some(tp) = telemetry.providers().tracer_provider() {
        opentelemetry::global::set_tracer_provider(tp.clone());
    }
    if let Some(mp) = telemetry.providers().meter_provider() {
        opentelemetry::global::set_meter_provider(mp.clone());
    }
    Ok(())
}

/// The process-wide bundle, if installed.
pub fn global() -> Option<Arc<Telemetry>> {
    GLOBAL.get().cloned()
}
