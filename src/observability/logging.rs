//! Structured, trace-correlated logging.
//!
//! # Responsibilities
//! - Leveled log calls with key/value fields
//! - Attach the active `trace_id`/`span_id` to every record
//! - Deliver to the local `tracing` stream and, when attached, to the SDK logger
//!
//! # Design Decisions
//! - The remote sink sits behind `ArcSwapOption`: attach/detach at runtime,
//!   lock-free on the logging path, silent no-op when absent
//! - `trace_id`/`span_id` fields are lifted into the exported record's
//!   correlation slot instead of being repeated as attributes
//! - Minimum level filters records; it never changes a record's severity

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

use arc_swap::ArcSwapOption;
use opentelemetry::logs::{AnyValue, LogRecord as _, Logger as _, LoggerProvider as _, Severity as OtelSeverity};
use opentelemetry::trace::{SpanId, TraceId};
use opentelemetry::{KeyValue, Value};
use opentelemetry_sdk::logs::{SdkLogger, SdkLoggerProvider};

use crate::observability::context;

pub const TRACE_ID_FIELD: &str = "trace_id";
pub const SPAN_ID_FIELD: &str = "span_id";

/// Instrumentation scope of exported log records.
pub const LOG_SCOPE: &str = "otel_user_api";

/// Log severity, numbered like OTLP `SeverityNumber`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Debug = 5,
    Info = 9,
    Warn = 13,
    Error = 17,
    Fatal = 21,
}

impl Severity {
    pub fn number(self) -> i32 {
        self as i32
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Error => "error",
            Severity::Fatal => "fatal",
        }
    }

    fn otel(self) -> OtelSeverity {
        match self {
            Severity::Debug => OtelSeverity::Debug,
            Severity::Info => OtelSeverity::Info,
            Severity::Warn => OtelSeverity::Warn,
            Severity::Error => OtelSeverity::Error,
            Severity::Fatal => OtelSeverity::Fatal,
        }
    }

    /// Parse a configured level, falling back to `info` for anything unknown.
    pub fn parse_or_default(s: &str) -> Self {
        s.parse().unwrap_or(Severity::Info)
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" => Ok(Severity::Debug),
            "info" => Ok(Severity::Info),
            "warn" | "warning" => Ok(Severity::Warn),
            "error" => Ok(Severity::Error),
            "fatal" => Ok(Severity::Fatal),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity for a completed HTTP request.
pub fn severity_for_status(code: u16) -> Severity {
    match code {
        500..=u16::MAX => Severity::Error,
        400..=499 => Severity::Warn,
        _ => Severity::Info,
    }
}

/// One log record.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub timestamp: SystemTime,
    pub observed_timestamp: SystemTime,
    pub severity: Severity,
    pub message: String,
    pub fields: Vec<KeyValue>,
    pub trace_id: Option<TraceId>,
    pub span_id: Option<SpanId>,
}

impl LogRecord {
    pub fn new(severity: Severity, message: impl Into<String>, fields: Vec<KeyValue>) -> Self {
        let now = SystemTime::now();
        Self {
            timestamp: now,
            observed_timestamp: now,
            severity,
            message: message.into(),
            fields,
            trace_id: None,
            span_id: None,
        }
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.iter().rev().find(|kv| kv.key.as_str() == key).map(|kv| &kv.value)
    }
}

/// Destination for log records.
pub trait LogSink: Send + Sync {
    fn emit(&self, record: &LogRecord);
}

/// Writes records as `tracing` events into the process subscriber.
///
/// Correlation and request fields become named event fields; anything
/// else is rendered into a single `fields` value.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

const NAMED_FIELDS: [&str; 10] = [
    TRACE_ID_FIELD,
    SPAN_ID_FIELD,
    "method",
    "path",
    "status_code",
    "latency",
    "client_ip",
    "user_agent",
    "request_id",
    "error",
];

struct Rest<'a>(Vec<&'a KeyValue>);

impl fmt::Display for Rest<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, kv) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}={}", kv.key, kv.value)?;
        }
        Ok(())
    }
}

struct EventFields<'a> {
    trace_id: Option<String>,
    span_id: Option<String>,
    method: Option<String>,
    path: Option<String>,
    status_code: Option<i64>,
    latency: Option<String>,
    client_ip: Option<String>,
    user_agent: Option<String>,
    request_id: Option<String>,
    error: Option<String>,
    rest: Option<Rest<'a>>,
}

impl<'a> EventFields<'a> {
    fn of(record: &'a LogRecord) -> Self {
        let text = |key: &str| record.field(key).map(|v| v.as_str().into_owned());
        let rest: Vec<&KeyValue> = record
            .fields
            .iter()
            .filter(|kv| !NAMED_FIELDS.contains(&kv.key.as_str()))
            .collect();
        Self {
            trace_id: text(TRACE_ID_FIELD),
            span_id: text(SPAN_ID_FIELD),
            method: text("method"),
            path: text("path"),
            status_code: record.field("status_code").and_then(|v| match v {
                Value::I64(code) => Some(*code),
                other => other.as_str().parse().ok(),
            }),
            latency: text("latency"),
            client_ip: text("client_ip"),
            user_agent: text("user_agent"),
            request_id: text("request_id"),
            error: text("error"),
            rest: (!rest.is_empty()).then_some(Rest(rest)),
        }
    }
}

macro_rules! sink_event {
    ($level:expr, $record:expr, $f:expr) => {
        tracing::event!(
            target: "app",
            $level,
            severity = $record.severity.as_str(),
            trace_id = $f.trace_id.as_deref(),
            span_id = $f.span_id.as_deref(),
            method = $f.method.as_deref(),
            path = $f.path.as_deref(),
            status_code = $f.status_code,
            latency = $f.latency.as_deref(),
            client_ip = $f.client_ip.as_deref(),
            user_agent = $f.user_agent.as_deref(),
            request_id = $f.request_id.as_deref(),
            error = $f.error.as_deref(),
            fields = $f.rest.as_ref().map(tracing::field::display),
            "{}",
            $record.message
        )
    };
}

impl LogSink for TracingSink {
    fn emit(&self, record: &LogRecord) {
        let f = EventFields::of(record);
        match record.severity {
            Severity::Debug => sink_event!(tracing::Level::DEBUG, record, f),
            Severity::Info => sink_event!(tracing::Level::INFO, record, f),
            Severity::Warn => sink_event!(tracing::Level::WARN, record, f),
            Severity::Error | Severity::Fatal => sink_event!(tracing::Level::ERROR, record, f),
        }
    }
}

/// Keeps records in memory.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<LogRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl LogSink for MemorySink {
    fn emit(&self, record: &LogRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
    }
}

/// Shape of a record on the remote path.
///
/// Reserved correlation fields populate the trace slots; a `level`
/// attribute is added for backends that key on it.
pub fn to_remote(record: &LogRecord) -> LogRecord {
    let mut remote = record.clone();
    let mut fields = Vec::with_capacity(record.fields.len() + 1);
    for kv in &record.fields {
        match kv.key.as_str() {
            TRACE_ID_FIELD => {
                if remote.trace_id.is_none() {
                    remote.trace_id = TraceId::from_hex(&kv.value.as_str()).ok();
                }
            }
            SPAN_ID_FIELD => {
                if remote.span_id.is_none() {
                    remote.span_id = SpanId::from_hex(&kv.value.as_str()).ok();
                }
            }
            _ => fields.push(kv.clone()),
        }
    }
    fields.push(KeyValue::new("level", record.severity.as_str()));
    remote.fields = fields;
    remote
}

fn any_value(value: &Value) -> AnyValue {
    match value {
        Value::Bool(b) => AnyValue::Boolean(*b),
        Value::I64(i) => AnyValue::Int(*i),
        Value::F64(f) => AnyValue::Double(*f),
        Value::String(s) => AnyValue::String(s.clone()),
        other => AnyValue::from(other.to_string()),
    }
}

fn emit_remote(logger: &SdkLogger, record: &LogRecord) {
    let remote = to_remote(record);
    let mut out = logger.create_log_record();
    out.set_timestamp(remote.timestamp);
    out.set_observed_timestamp(remote.observed_timestamp);
    out.set_severity_number(remote.severity.otel());
    out.set_severity_text(remote.severity.as_str());
    out.set_body(AnyValue::from(remote.message));
    if let (Some(trace_id), Some(span_id)) = (remote.trace_id, remote.span_id) {
        out.set_trace_context(trace_id, span_id, None);
    }
    for kv in &remote.fields {
        out.add_attribute(kv.key.clone(), any_value(&kv.value));
    }
    logger.emit(out);
}

/// Leveled logger with trace correlation.
pub struct Logger {
    min_level: Severity,
    local: Arc<dyn LogSink>,
    remote: ArcSwapOption<SdkLogger>,
}

impl Logger {
    /// Logger writing to the process `tracing` subscriber.
    pub fn new(min_level: Severity) -> Self {
        Self::with_local_sink(min_level, Arc::new(TracingSink))
    }

    pub fn with_local_sink(min_level: Severity, local: Arc<dyn LogSink>) -> Self {
        Self {
            min_level,
            local,
            remote: ArcSwapOption::empty(),
        }
    }

    pub fn min_level(&self) -> Severity {
        self.min_level
    }

    pub fn enabled(&self, level: Severity) -> bool {
        level >= self.min_level
    }

    /// Also deliver every record to `provider`.
    pub fn attach_remote(&self, provider: &SdkLoggerProvider) {
        self.remote.store(Some(Arc::new(provider.logger(LOG_SCOPE))));
    }

    pub fn detach_remote(&self) {
        self.remote.store(None);
    }

    pub fn has_remote(&self) -> bool {
        self.remote.load().is_some()
    }

    pub fn log(&self, level: Severity, message: &str, fields: &[KeyValue]) {
        if !self.enabled(level) {
            return;
        }
        let mut record = LogRecord::new(level, message, fields.to_vec());
        if let Some(cx) = context::current_span_context() {
            record.trace_id = Some(cx.trace_id());
            record.span_id = Some(cx.span_id());
            record
                .fields
                .retain(|kv| kv.key.as_str() != TRACE_ID_FIELD && kv.key.as_str() != SPAN_ID_FIELD);
            record.fields.push(KeyValue::new(TRACE_ID_FIELD, cx.trace_id().to_string()));
            record.fields.push(KeyValue::new(SPAN_ID_FIELD, cx.span_id().to_string()));
        }

        self.local.emit(&record);
        if let Some(remote) = self.remote.load().as_ref() {
            emit_remote(remote, &record);
        }
    }

    pub fn debug(&self, message: &str, fields: &[KeyValue]) {
        self.log(Severity::Debug, message, fields);
    }

    pub fn info(&self, message: &str, fields: &[KeyValue]) {
        self.log(Severity::Info, message, fields);
    }

    pub fn warn(&self, message: &str, fields: &[KeyValue]) {
        self.log(Severity::Warn, message, fields);
    }

    pub fn error(&self, message: &str, fields: &[KeyValue]) {
        self.log(Severity::Error, message, fields);
    }

    /// Error record with the error's message in an `error` field.
    pub fn log_error(&self, err: &dyn std::error::Error, message: &str, fields: &[KeyValue]) {
        let mut fields = fields.to_vec();
        fields.push(KeyValue::new("error", err.to_string()));
        self.log(Severity::Error, message, &fields);
    }
}
