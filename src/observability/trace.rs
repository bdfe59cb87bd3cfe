//! Span lifecycle on top of the OpenTelemetry SDK tracer.
//!
//! # Responsibilities
//! - Open nested units of work under a parent `Context`
//! - Collect errors and an HTTP status while a span is open
//! - Resolve the final span status once, when the span ends
//!
//! # Design Decisions
//! - `Span` owns the unit of work and ends it on drop, including unwinds
//! - `SpanRef` is a cloneable handle over the span's `Context`; the pending
//!   outcome rides in the same `Context` so `current_span` can find it
//! - Disabled tracing uses an always-off sampler: spans record nothing but
//!   still carry valid ids for log correlation

use std::borrow::Cow;
use std::error::Error;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use opentelemetry::trace::{TraceContextExt, Tracer as _, TracerProvider as _};
use opentelemetry::{Context, KeyValue};
use opentelemetry_sdk::trace::{Sampler, SdkTracer, SdkTracerProvider};

pub use opentelemetry::trace::{SpanContext, SpanKind, Status};

#[derive(Default)]
struct Outcome {
    errors: Mutex<Vec<String>>,
    explicit: Mutex<Option<Status>>,
    http_status: Mutex<Option<u16>>,
    ended: AtomicBool,
}

/// Context entry linking an open span to its pending outcome.
#[derive(Clone)]
struct SpanOutcome(Arc<Outcome>);

/// Cloneable annotation handle on an open span.
#[derive(Clone)]
pub struct SpanRef {
    cx: Context,
    outcome: Arc<Outcome>,
}

impl SpanRef {
    pub fn context(&self) -> SpanContext {
        self.cx.span().span_context().clone()
    }

    /// The `Context` to run child work under.
    pub fn otel_context(&self) -> &Context {
        &self.cx
    }

    pub fn is_recording(&self) -> bool {
        !self.outcome.ended.load(Ordering::Acquire) && self.cx.span().is_recording()
    }

    pub fn set_attribute(&self, kv: KeyValue) {
        self.cx.span().set_attribute(kv);
    }

    pub fn set_attributes(&self, attrs: impl IntoIterator<Item = KeyValue>) {
        self.cx.span().set_attributes(attrs);
    }

    pub fn add_event(&self, name: impl Into<Cow<'static, str>>, attributes: Vec<KeyValue>) {
        self.cx.span().add_event(name, attributes);
    }

    pub fn record_error(&self, err: &dyn Error) {
        self.record_error_message(err.to_string());
    }

    /// Record an `exception` event; any recorded error makes the span fail.
    pub fn record_error_message(&self, message: impl Into<String>) {
        if self.outcome.ended.load(Ordering::Acquire) {
            return;
        }
        let message = message.into();
        self.cx
            .span()
            .add_event("exception", vec![KeyValue::new("exception.message", message.clone())]);
        lock(&self.outcome.errors).push(message);
    }

    pub fn set_status(&self, status: Status) {
        *lock(&self.outcome.explicit) = Some(status);
    }

    pub fn set_http_status(&self, code: u16) {
        *lock(&self.outcome.http_status) = Some(code);
    }

    /// End the span with its resolved status. Later calls are ignored.
    pub fn end(&self) {
        if self.outcome.ended.swap(true, Ordering::AcqRel) {
            return;
        }
        let status = resolve_status(
            &lock(&self.outcome.errors),
            lock(&self.outcome.explicit).take(),
            *lock(&self.outcome.http_status),
        );
        let span = self.cx.span();
        span.set_status(status);
        span.end();
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owner of an open span; ends it when dropped.
pub struct Span {
    handle: SpanRef,
}

impl Span {
    pub fn handle(&self) -> SpanRef {
        self.handle.clone()
    }
}

impl Deref for Span {
    type Target = SpanRef;

    fn deref(&self) -> &SpanRef {
        &self.handle
    }
}

impl Drop for Span {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.handle.record_error_message("panicked");
        }
        self.handle.end();
    }
}

/// Status applied when a span ends.
///
/// Recorded errors win, then an explicit status, then an HTTP status of
/// 400 or above; otherwise the span is ok.
pub fn resolve_status(errors: &[String], explicit: Option<Status>, http_status: Option<u16>) -> Status {
    if !errors.is_empty() {
        return Status::error(errors.join("; "));
    }
    if let Some(status) = explicit {
        if status != Status::Unset {
            return status;
        }
    }
    match http_status {
        Some(code) if code >= 400 => Status::error(format!("HTTP {}", code)),
        _ => Status::Ok,
    }
}

/// Creates spans for one instrumentation scope.
#[derive(Clone)]
pub struct Tracer {
    inner: SdkTracer,
    enabled: bool,
}

impl Tracer {
    pub(crate) fn new(inner: SdkTracer) -> Self {
        Self { inner, enabled: true }
    }

    /// Tracer whose spans are never sampled.
    pub fn noop() -> Self {
        let provider = SdkTracerProvider::builder().with_sampler(Sampler::AlwaysOff).build();
        Self {
            inner: provider.tracer("noop"),
            enabled: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Child of the span in `parent`, or a new trace when it has none.
    pub fn start_with_context(&self, parent: &Context, name: impl Into<Cow<'static, str>>, kind: SpanKind) -> Span {
        let span = self
            .inner
            .span_builder(name)
            .with_kind(kind)
            .start_with_context(&self.inner, parent);
        let outcome = Arc::new(Outcome::default());
        let cx = parent.with_span(span).with_value(SpanOutcome(Arc::clone(&outcome)));
        Span {
            handle: SpanRef { cx, outcome },
        }
    }

    /// Internal span under the current task's context.
    pub fn start(&self, name: impl Into<Cow<'static, str>>) -> Span {
        self.start_with_context(&Context::current(), name, SpanKind::Internal)
    }
}

/// Handle on the span the current task runs under.
pub fn current_span() -> Option<SpanRef> {
    let cx = Context::current();
    let outcome = Arc::clone(&cx.get::<SpanOutcome>()?.0);
    Some(SpanRef { cx, outcome })
}
