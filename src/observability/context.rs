//! W3C trace context propagation over HTTP headers.
//!
//! # Responsibilities
//! - Read an inbound `traceparent` into a parent `Context`
//! - Write the active span back onto outgoing headers
//! - Expose the current task's span context to logs and query metrics
//!
//! # Design Decisions
//! - A missing or malformed header yields an empty parent, so the next
//!   span starts a new trace instead of failing the request
//! - The active context travels with the request future through
//!   `opentelemetry::trace::FutureExt::with_context`

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use opentelemetry::propagation::{Extractor, Injector, TextMapPropagator};
use opentelemetry::trace::{SpanContext, TraceContextExt};
use opentelemetry::Context;
use opentelemetry_sdk::propagation::TraceContextPropagator;

/// W3C trace context header name.
pub const TRACEPARENT: &str = "traceparent";

struct HeaderExtractor<'a>(&'a HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|k| k.as_str()).collect()
    }
}

struct HeaderInjector<'a>(&'a mut HeaderMap);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        if value.is_empty() {
            return;
        }
        if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(key.as_bytes()), HeaderValue::from_str(&value)) {
            self.0.insert(name, value);
        }
    }
}

/// Parent context carried by `headers`; empty when absent or invalid.
pub fn extract(headers: &HeaderMap) -> Context {
    TraceContextPropagator::new().extract_with_context(&Context::new(), &HeaderExtractor(headers))
}

/// Write the span of `cx` as `traceparent` (and `tracestate` when set).
pub fn inject(cx: &Context, headers: &mut HeaderMap) {
    TraceContextPropagator::new().inject_context(cx, &mut HeaderInjector(headers));
}

/// Span context of the running task, if it carries a valid one.
pub fn current_span_context() -> Option<SpanContext> {
    let cx = Context::current();
    let span_context = cx.span().span_context().clone();
    span_context.is_valid().then_some(span_context)
}
