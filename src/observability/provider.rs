//! Construction and shutdown of the telemetry providers.
//!
//! # Responsibilities
//! - Build the resource once
//! - Build the SDK tracer, meter, and logger providers, each behind its own toggle
//! - Register one shutdown step per constructed provider
//! - Flush and close every provider against one shared deadline
//!
//! # Design Decisions
//! - A disabled provider has no shutdown step at all
//! - Shutdown runs every step even after a failure or an expired deadline,
//!   then reports all failures together
//! - SDK flush and shutdown block the calling thread, so they run on the
//!   blocking pool while the deadline is awaited
//! - Exporters are injected through [`TelemetryBuilder`] so tests read
//!   telemetry back in-process

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use opentelemetry::metrics::{Meter, MeterProvider as _};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::error::OTelSdkResult;
use opentelemetry_sdk::logs::{LogExporter, LoggerProviderBuilder, SdkLoggerProvider};
use opentelemetry_sdk::metrics::exporter::PushMetricExporter;
use opentelemetry_sdk::metrics::{MeterProviderBuilder, PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::trace::{SdkTracerProvider, SpanExporter, TracerProviderBuilder};
use opentelemetry_sdk::Resource;

use crate::config::TelemetryConfig;
use crate::observability::error::{ProviderShutdownError, TelemetryError};
use crate::observability::metrics::{noop_meter, register_runtime_metrics};
use crate::observability::resource;
use crate::observability::trace::Tracer;

/// Default budget for flushing every provider at shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

type ShutdownFn = Box<dyn FnOnce() -> OTelSdkResult + Send>;

struct ShutdownStep {
    provider: &'static str,
    run: ShutdownFn,
}

/// The constructed providers and their shutdown steps.
pub struct TelemetryProviders {
    resource: Resource,
    tracer_provider: Option<SdkTracerProvider>,
    meter_provider: Option<SdkMeterProvider>,
    logger_provider: Option<SdkLoggerProvider>,
    steps: Mutex<Vec<ShutdownStep>>,
}

impl TelemetryProviders {
    /// No providers and nothing to shut down.
    pub fn disabled(resource: Resource) -> Self {
        Self {
            resource,
            tracer_provider: None,
            meter_provider: None,
            logger_provider: None,
            steps: Mutex::new(Vec::new()),
        }
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    pub fn tracer_provider(&self) -> Option<&SdkTracerProvider> {
        self.tracer_provider.as_ref()
    }

    pub fn meter_provider(&self) -> Option<&SdkMeterProvider> {
        self.meter_provider.as_ref()
    }

    pub fn logger_provider(&self) -> Option<&SdkLoggerProvider> {
        self.logger_provider.as_ref()
    }

    /// Tracer for `scope`; a noop tracer when tracing is off.
    pub fn tracer(&self, scope: &'static str) -> Tracer {
        match &self.tracer_provider {
            Some(tp) => Tracer::new(tp.tracer(scope)),
            None => Tracer::noop(),
        }
    }

    /// Meter for `scope`; a noop meter when metrics are off.
    pub fn meter(&self, scope: &'static str) -> Meter {
        match &self.meter_provider {
            Some(mp) => mp.meter(scope),
            None => noop_meter(scope),
        }
    }

    /// Names of the providers that still have a pending shutdown step.
    pub fn pending_shutdown(&self) -> Vec<&'static str> {
        self.steps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|s| s.provider)
            .collect()
    }

    fn register_step(&self, provider: &'static str, run: ShutdownFn) {
        self.steps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ShutdownStep { provider, run });
    }

    /// Export whatever each provider has buffered.
    pub async fn force_flush(&self) -> Result<(), TelemetryError> {
        let mut flushes: Vec<(&'static str, ShutdownFn)> = Vec::new();
        if let Some(tp) = self.tracer_provider.clone() {
            flushes.push(("tracer", Box::new(move || tp.force_flush())));
        }
        if let Some(mp) = self.meter_provider.clone() {
            flushes.push(("meter", Box::new(move || mp.force_flush())));
        }
        if let Some(lp) = self.logger_provider.clone() {
            flushes.push(("logger", Box::new(move || lp.force_flush())));
        }

        let mut errors = Vec::new();
        for (provider, flush) in flushes {
            let reason = match tokio::task::spawn_blocking(flush).await {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(e) => e.to_string(),
            };
            errors.push(ProviderShutdownError { provider, reason });
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(TelemetryError::Shutdown(errors))
        }
    }

    /// Flush and close every provider within `timeout`.
    ///
    /// Every step runs, in registration order, against one shared deadline.
    /// A second call finds no steps and returns `Ok`.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), TelemetryError> {
        let steps = std::mem::take(&mut *self.steps.lock().unwrap_or_else(PoisonError::into_inner));
        if steps.is_empty() {
            return Ok(());
        }

        let deadline = tokio::time::Instant::now() + timeout;
        let started = Instant::now();
        let mut errors = Vec::new();

        for step in steps {
            let reason = match tokio::time::timeout_at(deadline, tokio::task::spawn_blocking(step.run)).await {
                Ok(Ok(Ok(()))) => {
                    tracing::debug!(provider = step.provider, "Telemetry provider shut down");
                    continue;
                }
                Ok(Ok(Err(e))) => e.to_string(),
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("deadline of {:?} exceeded", timeout),
            };
            errors.push(ProviderShutdownError {
                provider: step.provider,
                reason,
            });
        }

        tracing::info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            failures = errors.len(),
            "Telemetry shutdown complete"
        );

        if errors.is_empty() {
            Ok(())
        } else {
            Err(TelemetryError::Shutdown(errors))
        }
    }
}

/// Assembles providers for the signals enabled in config.
///
/// An enabled signal with no exporter still gets a provider: spans and
/// logs are discarded, metrics are recorded but never read.
pub struct TelemetryBuilder {
    enable_tracing: bool,
    enable_metrics: bool,
    enable_logging: bool,
    enable_runtime_metrics: bool,
    metrics_interval: Duration,
    resource: Resource,
    traces: TracerProviderBuilder,
    metrics: MeterProviderBuilder,
    logs: LoggerProviderBuilder,
}

impl TelemetryBuilder {
    pub fn new(cfg: &TelemetryConfig) -> Self {
        let resource = resource::service_resource(cfg);
        Self {
            enable_tracing: cfg.enable_tracing,
            enable_metrics: cfg.enable_metrics,
            enable_logging: cfg.enable_logging,
            enable_runtime_metrics: cfg.enable_runtime_metrics,
            metrics_interval: cfg.metrics_interval(),
            traces: SdkTracerProvider::builder().with_resource(resource.clone()),
            metrics: SdkMeterProvider::builder().with_resource(resource.clone()),
            logs: SdkLoggerProvider::builder().with_resource(resource.clone()),
            resource,
        }
    }

    /// Batch spans into `exporter`. Ignored when tracing is off.
    pub fn with_span_exporter<E: SpanExporter + 'static>(mut self, exporter: E) -> Self {
        if self.enable_tracing {
            self.traces = self.traces.with_batch_exporter(exporter);
        }
        self
    }

    /// Push metrics to `exporter` every configured interval.
    pub fn with_metric_exporter<E: PushMetricExporter>(mut self, exporter: E) -> Self {
        if self.enable_metrics {
            let reader = PeriodicReader::builder(exporter)
                .with_interval(self.metrics_interval)
                .build();
            self.metrics = self.metrics.with_reader(reader);
        }
        self
    }

    /// Batch log records into `exporter`. Ignored when logging is off.
    pub fn with_log_exporter<E: LogExporter + 'static>(mut self, exporter: E) -> Self {
        if self.enable_logging {
            self.logs = self.logs.with_batch_exporter(exporter);
        }
        self
    }

    pub fn build(self) -> TelemetryProviders {
        let mut providers = TelemetryProviders::disabled(self.resource);

        if self.enable_tracing {
            let tp = self.traces.build();
            let handle = tp.clone();
            providers.register_step("tracer", Box::new(move || handle.shutdown()));
            providers.tracer_provider = Some(tp);
        }

        if self.enable_metrics {
            let mp = self.metrics.build();
            if self.enable_runtime_metrics {
                register_runtime_metrics(&mp.meter("runtime"));
            }
            let handle = mp.clone();
            providers.register_step("meter", Box::new(move || handle.shutdown()));
            providers.meter_provider = Some(mp);
        }

        if self.enable_logging {
            let lp = self.logs.build();
            let handle = lp.clone();
            providers.register_step("logger", Box::new(move || handle.shutdown()));
            providers.logger_provider = Some(lp);
        }

        providers
    }
}

/// Build providers with OTLP/gRPC exporters for every enabled signal.
///
/// Must be called inside a tokio runtime: the gRPC channel is created here.
pub fn init_telemetry(cfg: &TelemetryConfig) -> Result<TelemetryProviders, TelemetryError> {
    let endpoint = endpoint_uri(&cfg.otlp_endpoint);
    let mut builder = TelemetryBuilder::new(cfg);

    if cfg.enable_tracing {
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint.clone())
            .with_timeout(cfg.export_timeout())
            .build()
            .map_err(|source| TelemetryError::Exporter {
                signal: "traces",
                source,
            })?;
        builder = builder.with_span_exporter(exporter);
    }

    if cfg.enable_metrics {
        let exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint.clone())
            .with_timeout(cfg.export_timeout())
            .build()
            .map_err(|source| TelemetryError::Exporter {
                signal: "metrics",
                source,
            })?;
        builder = builder.with_metric_exporter(exporter);
    }

    if cfg.enable_logging {
        let exporter = opentelemetry_otlp::LogExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint.clone())
            .with_timeout(cfg.export_timeout())
            .build()
            .map_err(|source| TelemetryError::Exporter {
                signal: "logs",
                source,
            })?;
        builder = builder.with_log_exporter(exporter);
    }

    let providers = builder.build();
    tracing::info!(
        endpoint = %endpoint,
        tracing = cfg.enable_tracing,
        metrics = cfg.enable_metrics,
        logging = cfg.enable_logging,
        "Telemetry initialized"
    );
    Ok(providers)
}

/// `host:port` becomes `http://host:port`; explicit schemes are kept.
pub fn endpoint_uri(endpoint: &str) -> String {
    if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("http://{}", endpoint)
    }
}
