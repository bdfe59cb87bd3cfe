//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::Router;
use opentelemetry::{Key, KeyValue, Value as AttrValue};
use opentelemetry_sdk::logs::{InMemoryLogExporter, SdkLogRecord};
use opentelemetry_sdk::metrics::data::{AggregatedMetrics, MetricData, ResourceMetrics};
use opentelemetry_sdk::metrics::InMemoryMetricExporter;
use opentelemetry_sdk::trace::{InMemorySpanExporter, SpanData};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower::ServiceExt;

use otel_user_api::config::{DatabaseConfig, TelemetryConfig};
use otel_user_api::database::{Database, MemoryConnector};
use otel_user_api::http::server::{build_router, AppState};
use otel_user_api::observability::logging::MemorySink;
use otel_user_api::observability::{Logger, Severity, Telemetry, TelemetryBuilder};

/// Telemetry recording into memory, plus handles on every exporter.
#[derive(Clone)]
pub struct MemoryTelemetry {
    pub telemetry: Arc<Telemetry>,
    pub spans: InMemorySpanExporter,
    pub metrics: InMemoryMetricExporter,
    pub exported_logs: InMemoryLogExporter,
    pub logs: Arc<MemorySink>,
}

impl MemoryTelemetry {
    /// Push every pending span, metric and log record into the exporters.
    pub async fn flush(&self) -> Vec<SpanData> {
        self.telemetry.providers().force_flush().await.unwrap();
        self.spans.get_finished_spans().unwrap()
    }

    pub async fn exported_logs(&self) -> Vec<SdkLogRecord> {
        self.flush().await;
        self.exported_logs
            .get_emitted_logs()
            .unwrap()
            .into_iter()
            .map(|log| log.record)
            .collect()
    }

    /// Latest cumulative metrics, after a flush.
    pub async fn collect(&self) -> Option<ResourceMetrics> {
        self.flush().await;
        self.metrics.get_finished_metrics().unwrap().pop()
    }

    /// Sum over every point of a counter.
    pub async fn metric_sum(&self, name: &str) -> i64 {
        self.collect()
            .await
            .map(|rm| sum_points(&rm, name, None).into_iter().sum())
            .unwrap_or(0)
    }

    /// Value of the counter point with exactly `attrs`.
    pub async fn metric_sum_for(&self, name: &str, attrs: &[KeyValue]) -> Option<i64> {
        let rm = self.collect().await?;
        sum_points(&rm, name, Some(attrs)).into_iter().reduce(|a, b| a + b)
    }

    pub async fn histogram_count(&self, name: &str) -> u64 {
        self.collect()
            .await
            .map(|rm| histogram_points(&rm, name, None).iter().map(|p| p.0).sum())
            .unwrap_or(0)
    }

    pub async fn histogram_sum(&self, name: &str) -> f64 {
        self.collect()
            .await
            .map(|rm| histogram_points(&rm, name, None).iter().map(|p| p.1).sum())
            .unwrap_or(0.0)
    }
}

pub fn telemetry_config() -> TelemetryConfig {
    TelemetryConfig {
        enable_runtime_metrics: false,
        log_level: "debug".to_string(),
        ..TelemetryConfig::default()
    }
}

pub fn memory_telemetry(cfg: &TelemetryConfig) -> MemoryTelemetry {
    let spans = InMemorySpanExporter::default();
    let metrics = InMemoryMetricExporter::default();
    let exported_logs = InMemoryLogExporter::default();
    let providers = TelemetryBuilder::new(cfg)
        .with_span_exporter(spans.clone())
        .with_metric_exporter(metrics.clone())
        .with_log_exporter(exported_logs.clone())
        .build();

    let sink = Arc::new(MemorySink::new());
    let logger = Logger::with_local_sink(Severity::Debug, sink.clone());
    MemoryTelemetry {
        telemetry: Arc::new(Telemetry::with_logger(providers, logger)),
        spans,
        metrics,
        exported_logs,
        logs: sink,
    }
}

/// A router wired to in-memory telemetry.
pub struct Harness {
    pub router: Router,
    pub db: Arc<Database>,
    pub memory: MemoryTelemetry,
}

impl std::ops::Deref for Harness {
    type Target = MemoryTelemetry;

    fn deref(&self) -> &MemoryTelemetry {
        &self.memory
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(&telemetry_config(), &DatabaseConfig::default())
    }

    pub fn with_config(cfg: &TelemetryConfig, db_cfg: &DatabaseConfig) -> Self {
        let memory = memory_telemetry(cfg);
        let telemetry = &memory.telemetry;
        let db = Arc::new(Database::connect(&MemoryConnector, db_cfg, telemetry.as_ref()).unwrap());
        let state = AppState::new(Arc::clone(&db), telemetry);
        let router = build_router(state, telemetry, Duration::from_secs(5));
        Self { router, db, memory }
    }

    pub async fn send(&self, req: Request<Body>) -> Response {
        self.router.clone().oneshot(req).await.unwrap()
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
        into_json(self.send(Request::get(uri).body(Body::empty()).unwrap()).await).await
    }

    pub async fn json(&self, method: &str, uri: &str, body: Value) -> (StatusCode, Value) {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        into_json(self.send(req).await).await
    }
}

/// Attribute of a finished span.
pub fn span_attr<'a>(span: &'a SpanData, key: &str) -> Option<&'a AttrValue> {
    span.attributes.iter().find(|kv| kv.key.as_str() == key).map(|kv| &kv.value)
}

/// Attribute of an exported log record.
pub fn log_attr<'a>(record: &'a SdkLogRecord, key: &'static str) -> Option<&'a opentelemetry::logs::AnyValue> {
    let key = Key::from_static_str(key);
    record.attributes_iter().find(|(k, _)| *k == key).map(|(_, v)| v)
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

fn sum_points(rm: &ResourceMetrics, name: &str, want: Option<&[KeyValue]>) -> Vec<i64> {
    match find(rm, name) {
        Some(AggregatedMetrics::U64(MetricData::Sum(s))) => s
            .data_points()
            .filter(|p| matches(p.attributes(), want))
            .map(|p| p.value() as i64)
            .collect(),
        Some(AggregatedMetrics::I64(MetricData::Sum(s))) => s
            .data_points()
            .filter(|p| matches(p.attributes(), want))
            .map(|p| p.value())
            .collect(),
        _ => Vec::new(),
    }
}

fn histogram_points(rm: &ResourceMetrics, name: &str, want: Option<&[KeyValue]>) -> Vec<(u64, f64)> {
    match find(rm, name) {
        Some(AggregatedMetrics::F64(MetricData::Histogram(h))) => h
            .data_points()
            .filter(|p| matches(p.attributes(), want))
            .map(|p| (p.count() as u64, p.sum()))
            .collect(),
        _ => Vec::new(),
    }
}

pub async fn into_json(response: Response) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

/// Serve `router` on an ephemeral port until the returned sender fires.
pub async fn spawn_server(router: Router) -> (SocketAddr, oneshot::Sender<()>, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel::<()>();

    let handle = tokio::spawn(async move {
        axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(async {
                let _ = rx.await;
            })
            .await
            .unwrap();
    });
    (addr, tx, handle)
}
