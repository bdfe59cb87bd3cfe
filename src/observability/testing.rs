//! In-memory SDK pipelines for unit tests.

use std::sync::{Arc, OnceLock};

use opentelemetry::metrics::{Meter, MeterProvider as _};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_sdk::metrics::data::{AggregatedMetrics, MetricData, ResourceMetrics};
use opentelemetry_sdk::metrics::{InMemoryMetricExporter, PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::trace::{InMemorySpanExporter, SdkTracerProvider, SpanData};

use crate::config::TelemetryConfig;
use crate::observability::logging::{Logger, MemorySink, Severity};
use crate::observability::provider::TelemetryProviders;
use crate::observability::trace::Tracer;
use crate::observability::{install_global, resource, Telemetry};

/// Tracer provider that exports each span as it ends.
pub(crate) struct SpanRecorder {
    provider: SdkTracerProvider,
    exporter: InMemorySpanExporter,
}

impl SpanRecorder {
    pub fn new() -> Self {
        let exporter = InMemorySpanExporter::default();
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        Self { provider, exporter }
    }

    pub fn tracer(&self, scope: &'static str) -> Tracer {
        Tracer::new(self.provider.tracer(scope))
    }

    pub fn finished(&self) -> Vec<SpanData> {
        self.exporter.get_finished_spans().unwrap()
    }
}

/// Meter provider read back on demand.
pub(crate) struct MetricReader {
    pub provider: SdkMeterProvider,
    exporter: InMemoryMetricExporter,
}

impl MetricReader {
    pub fn new() -> Self {
        let exporter = InMemoryMetricExporter::default();
        let provider = SdkMeterProvider::builder()
            .with_reader(PeriodicReader::builder(exporter.clone()).build())
            .build();
        Self { provider, exporter }
    }

    pub fn meter(&self, scope: &'static str) -> Meter {
        self.provider.meter(scope)
    }

    fn collect(&self) -> Option<ResourceMetrics> {
        self.provider.force_flush().unwrap();
        self.exporter.get_finished_metrics().unwrap().pop()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.collect().is_some_and(|rm| find(&rm, name).is_some())
    }

    pub fn sum(&self, name: &str, attrs: &[KeyValue]) -> Option<i64> {
        let rm = self.collect()?;
        sum_points(find(&rm, name)?, Some(attrs)).into_iter().reduce(|a, b| a + b)
    }

    pub fn total(&self, name: &str) -> i64 {
        self.collect()
            .and_then(|rm| find(&rm, name).map(|data| sum_points(data, None).into_iter().sum()))
            .unwrap_or(0)
    }

    /// Count and sum of the histogram point with exactly `attrs`.
    pub fn histogram(&self, name: &str, attrs: &[KeyValue]) -> Option<(u64, f64)> {
        let rm = self.collect()?;
        histogram_points(find(&rm, name)?, Some(attrs)).into_iter().next()
    }

    pub fn histogram_count(&self, name: &str) -> u64 {
        self.collect()
            .and_then(|rm| find(&rm, name).map(|data| histogram_points(data, None).iter().map(|p| p.0).sum()))
            .unwrap_or(0)
    }

    pub fn gauge(&self, name: &str) -> Option<f64> {
        let rm = self.collect()?;
        match find(&rm, name)? {
            AggregatedMetrics::F64(MetricData::Gauge(g)) => g.data_points().map(|p| p.value()).next(),
            AggregatedMetrics::I64(MetricData::Gauge(g)) => g.data_points().map(|p| p.value() as f64).next(),
            AggregatedMetrics::U64(MetricData::Gauge(g)) => g.data_points().map(|p| p.value() as f64).next(),
            _ => None,
        }
    }
}

fn find<'a>(rm: &'a ResourceMetrics, name: &str) -> Option<&'a AggregatedMetrics> {
    rm.scope_metrics()
        .flat_map(|sm| sm.metrics())
        .find(|m| m.name() == name)
        .map(|m| m.data())
}

fn matches<'a>(point: impl Iterator<Item = &'a KeyValue>, want: Option<&[KeyValue]>) -> bool {
    let Some(want) = want else { return true };
    let point: Vec<&KeyValue> = point.collect();
    point.len() == want.len() && want.iter().all(|kv| point.contains(&kv))
}

fn sum_points(data: &AggregatedMetrics, want: Option<&[KeyValue]>) -> Vec<i64> {
    match data {
        AggregatedMetrics::U64(MetricData::Sum(s)) => s
            .data_points()
            .filter(|p| matches(p.attributes(), want))
            .map(|p| p.value() as i64)
            .collect(),
        AggregatedMetrics::I64(MetricData::Sum(s)) => s
            .data_points()
            .filter(|p| matches(p.attributes(), want))
            .map(|p| p.value())
            .collect(),
        _ => Vec::new(),
    }
}

fn histogram_points(data: &AggregatedMetrics, want: Option<&[KeyValue]>) -> Vec<(u64, f64)> {
    match data {
        AggregatedMetrics::F64(MetricData::Histogram(h)) => h
            .data_points()
            .filter(|p| matches(p.attributes(), want))
            .map(|p| (p.count() as u64, p.sum()))
            .collect(),
        _ => Vec::new(),
    }
}

/// The process-wide bundle used by every test that reads `global()`.
pub(crate) fn global_fixture() -> &'static (Arc<Telemetry>, Arc<MemorySink>) {
    static FIXTURE: OnceLock<(Arc<Telemetry>, Arc<MemorySink>)> = OnceLock::new();
    FIXTURE.get_or_init(|| {
        let cfg = TelemetryConfig::default();
        let sink = Arc::new(MemorySink::new());
        let logger = Logger::with_local_sink(Severity::Debug, sink.clone());
        let providers = TelemetryProviders::disabled(resource::service_resource(&cfg));
        let telemetry = Arc::new(Telemetry::with_logger(providers, logger));
        let _ = install_global(Arc::clone(&telemetry));
        (telemetry, sink)
    })
}
