//! Per-request tracing and metrics.
//!
//! # Responsibilities
//! - Continue or start a trace for every request and open the server span
//! - Install the span as the task's active context for the handler
//! - Record the request-metrics protocol
//! - Echo the server span's `traceparent` on the response
//!
//! # Data Flow
//! ```text
//! request → traceparent? → server span ─┐
//!         → RequestGuard (+1 active, request size)
//!         → handler (inside span scope)
//!         → status, response size → RequestGuard::finish
//!               (-1 active, total, duration, response size)
//!         → unknown size? → MeteredBody counts bytes written,
//!               finishes the guard at end of body
//! ```
//!
//! # Design Decisions
//! - The guard decrements in `Drop`, so cancelled or unwinding requests
//!   still balance the active-requests counter
//! - Route labels come from `MatchedPath` (the route template), never the raw path
//! - A streamed body is only measured once it has been written, so its
//!   completion metrics land when the body ends, not when headers go out

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, MatchedPath, Request, State};
use axum::http::header::{CONTENT_LENGTH, USER_AGENT};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use http_body::{Body as HttpBody, Frame, SizeHint};
use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};
use opentelemetry::trace::FutureExt;

use crate::http::request::RequestIdExt;
use crate::observability::context;
use crate::observability::metrics::SECONDS_BOUNDS;
use crate::observability::trace::SpanKind;
use crate::observability::{saturating_i64, KeyValue, Telemetry, Tracer, HTTP_SCOPE};

pub const REQUESTS_TOTAL: &str = "http_requests_total";
pub const REQUEST_DURATION: &str = "http_request_duration_seconds";
pub const REQUEST_SIZE: &str = "http_request_size_bytes";
pub const RESPONSE_SIZE: &str = "http_response_size_bytes";
pub const ACTIVE_REQUESTS: &str = "http_active_requests";

/// Route label for requests no route matched.
pub const UNMATCHED_ROUTE: &str = "unmatched";

const BYTES_BOUNDS: &[f64] = &[64.0, 256.0, 1024.0, 4096.0, 16384.0, 65536.0, 262144.0, 1048576.0];

/// `1xx`..`5xx` from the hundreds digit; anything outside 100..600 is `1xx`.
pub fn status_class(code: u16) -> &'static str {
    match code / 100 {
        2 => "2xx",
        3 => "3xx",
        4 => "4xx",
        5 => "5xx",
        _ => "1xx",
    }
}

pub struct HttpMetrics {
    requests_total: Counter<u64>,
    request_duration: Histogram<f64>,
    request_size: Histogram<f64>,
    response_size: Histogram<f64>,
    active_requests: UpDownCounter<i64>,
}

impl HttpMetrics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            requests_total: meter
                .u64_counter(REQUESTS_TOTAL)
                .with_description("Total number of HTTP requests")
                .build(),
            request_duration: meter
                .f64_histogram(REQUEST_DURATION)
                .with_description("HTTP request duration in seconds")
                .with_unit("s")
                .with_boundaries(SECONDS_BOUNDS.to_vec())
                .build(),
            request_size: meter
                .f64_histogram(REQUEST_SIZE)
                .with_description("HTTP request size in bytes")
                .with_unit("By")
                .with_boundaries(BYTES_BOUNDS.to_vec())
                .build(),
            response_size: meter
                .f64_histogram(RESPONSE_SIZE)
                .with_description("HTTP response size in bytes")
                .with_unit("By")
                .with_boundaries(BYTES_BOUNDS.to_vec())
                .build(),
            active_requests: meter
                .i64_up_down_counter(ACTIVE_REQUESTS)
                .with_description("Number of active HTTP requests")
                .build(),
        }
    }

    /// Entry half of the protocol. The returned guard performs the exit half.
    pub fn begin(self: &Arc<Self>, method: &str, route: &str, request_size: Option<u64>) -> RequestGuard {
        let common = vec![
            KeyValue::new("method", method.to_string()),
            KeyValue::new("route", route.to_string()),
        ];
        self.active_requests.add(1, &common);
        if let Some(size) = request_size.filter(|n| *n > 0) {
            self.request_size.record(size as f64, &common);
        }
        RequestGuard {
            metrics: Arc::clone(self),
            common,
            started: Instant::now(),
            status: None,
            response_size: None,
        }
    }
}

/// Balances `http_active_requests` and records the completion metrics.
pub struct RequestGuard {
    metrics: Arc<HttpMetrics>,
    common: Vec<KeyValue>,
    started: Instant,
    status: Option<u16>,
    response_size: Option<u64>,
}

impl RequestGuard {
    pub fn finish(mut self, status: u16, response_size: Option<u64>) {
        self.status = Some(status);
        self.response_size = response_size;
    }

    /// Defer completion to the end of `body`, measuring what is written.
    pub fn finish_streamed(mut self, status: u16, body: Body) -> MeteredBody {
        self.status = Some(status);
        MeteredBody {
            inner: body,
            written: 0,
            guard: Some(self),
        }
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        let m = &self.metrics;
        m.active_requests.add(-1, &self.common);

        // No status means the request never produced a response.
        let status = self.status.unwrap_or(500);
        let mut attrs = self.common.clone();
        attrs.push(KeyValue::new("status_code", status.to_string()));
        attrs.push(KeyValue::new("status_class", status_class(status)));

        m.requests_total.add(1, &attrs);
        m.request_duration.record(self.started.elapsed().as_secs_f64(), &attrs);
        if let Some(size) = self.response_size.filter(|n| *n > 0) {
            m.response_size.record(size as f64, &attrs);
        }
    }
}

/// Response body of unknown length that counts the bytes actually polled.
///
/// The guard finishes at end of stream, on a body error, or when the body
/// is dropped early (client gone), with whatever was written by then.
pub struct MeteredBody {
    inner: Body,
    written: u64,
    guard: Option<RequestGuard>,
}

impl MeteredBody {
    fn complete(&mut self) {
        if let Some(mut guard) = self.guard.take() {
            guard.response_size = Some(self.written);
        }
    }
}

impl HttpBody for MeteredBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        let polled = Pin::new(&mut this.inner).poll_frame(cx);
        match &polled {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.written = this.written.saturating_add(data.len() as u64);
                }
            }
            Poll::Ready(Some(Err(_))) | Poll::Ready(None) => this.complete(),
            Poll::Pending => {}
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for MeteredBody {
    fn drop(&mut self) {
        self.complete();
    }
}

/// State for the `track` middleware.
pub struct HttpTelemetry {
    tracer: Tracer,
    metrics: Arc<HttpMetrics>,
}

impl HttpTelemetry {
    pub fn new(telemetry: &Telemetry) -> Self {
        Self {
            tracer: telemetry.tracer(HTTP_SCOPE),
            metrics: Arc::new(HttpMetrics::new(&telemetry.meter(HTTP_SCOPE))),
        }
    }
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// Server span plus request metrics around the rest of the stack.
pub async fn track(State(http): State<Arc<HttpTelemetry>>, req: Request, next: Next) -> Response {
    let method = req.method().as_str().to_string();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| UNMATCHED_ROUTE.to_string());

    let parent = context::extract(req.headers());
    let span = http
        .tracer
        .start_with_context(&parent, format!("{} {}", method, route), SpanKind::Server);

    let request_size = content_length(req.headers());
    span.set_attributes([
        KeyValue::new("http.method", method.clone()),
        KeyValue::new("http.route", route.clone()),
        KeyValue::new("http.target", req.uri().path().to_string()),
        KeyValue::new("http.request.size", saturating_i64(request_size.unwrap_or(0))),
    ]);
    if let Some(agent) = req.headers().get(USER_AGENT).and_then(|v| v.to_str().ok()) {
        span.set_attribute(KeyValue::new("user.agent", agent.to_string()));
    }
    if let Some(ConnectInfo(addr)) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        span.set_attribute(KeyValue::new("client.ip", addr.ip().to_string()));
    }
    if let Some(id) = req.request_id() {
        span.set_attribute(KeyValue::new("http.request_id", id.to_string()));
    }

    let guard = http.metrics.begin(&method, &route, request_size);
    let started = Instant::now();

    let mut response = next.run(req).with_context(span.otel_context().clone()).await;

    let status = response.status().as_u16();
    let response_size = content_length(response.headers()).or_else(|| response.body().size_hint().exact());
    match response_size {
        Some(size) => {
            guard.finish(status, Some(size));
            span.set_attribute(KeyValue::new("http.response.size", saturating_i64(size)));
        }
        None => {
            let body = std::mem::take(response.body_mut());
            *response.body_mut() = Body::new(guard.finish_streamed(status, body));
        }
    }

    span.set_attributes([
        KeyValue::new("http.status_code", i64::from(status)),
        KeyValue::new("http.status_class", status_class(status)),
        KeyValue::new("http.duration", started.elapsed().as_secs_f64()),
    ]);
    if status >= 400 {
        span.set_attribute(KeyValue::new("error", true));
    }
    span.set_http_status(status);

    context::inject(span.otel_context(), response.headers_mut());
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::testing::MetricReader;
    use futures_util::{stream, StreamExt};

    #[test]
    fn test_status_class() {
        assert_eq!(status_class(99), "1xx");
        assert_eq!(status_class(199), "1xx");
        assert_eq!(status_class(200), "2xx");
        assert_eq!(status_class(301), "3xx");
        assert_eq!(status_class(404), "4xx");
        assert_eq!(status_class(500), "5xx");
        assert_eq!(status_class(600), "1xx");
    }

    fn route_attrs() -> Vec<KeyValue> {
        vec![KeyValue::new("method", "GET"), KeyValue::new("route", "/api/users")]
    }

    fn done(status: &'static str, class: &'static str) -> Vec<KeyValue> {
        let mut attrs = route_attrs();
        attrs.push(KeyValue::new("status_code", status));
        attrs.push(KeyValue::new("status_class", class));
        attrs
    }

    fn fixture() -> (MetricReader, Arc<HttpMetrics>) {
        let reader = MetricReader::new();
        let metrics = Arc::new(HttpMetrics::new(&reader.meter(HTTP_SCOPE)));
        (reader, metrics)
    }

    fn chunked(parts: &[&'static str]) -> Body {
        let frames: Vec<Result<Bytes, std::io::Error>> = parts.iter().map(|&p| Ok(Bytes::from_static(p.as_bytes()))).collect();
        Body::from_stream(stream::iter(frames))
    }

    #[test]
    fn test_guard_balances_and_records() {
        let (reader, metrics) = fixture();

        let guard = metrics.begin("GET", "/api/users", Some(12));
        assert_eq!(reader.sum(ACTIVE_REQUESTS, &route_attrs()), Some(1));
        guard.finish(200, Some(48));

        let done = done("200", "2xx");
        assert_eq!(reader.sum(ACTIVE_REQUESTS, &route_attrs()), Some(0));
        assert_eq!(reader.sum(REQUESTS_TOTAL, &done), Some(1));
        assert_eq!(reader.histogram(REQUEST_DURATION, &done).map(|h| h.0), Some(1));
        assert_eq!(reader.histogram_count(REQUEST_SIZE), 1);
        assert_eq!(reader.histogram(RESPONSE_SIZE, &done).map(|h| h.1), Some(48.0));
    }

    #[test]
    fn test_dropped_guard_counts_as_server_error() {
        let (reader, metrics) = fixture();
        drop(metrics.begin("GET", "/api/users", None));

        assert_eq!(reader.sum(ACTIVE_REQUESTS, &route_attrs()), Some(0));
        assert_eq!(reader.sum(REQUESTS_TOTAL, &done("500", "5xx")), Some(1));
        assert_eq!(reader.histogram_count(REQUEST_SIZE), 0);
        assert_eq!(reader.histogram_count(RESPONSE_SIZE), 0);
    }

    #[tokio::test]
    async fn test_streamed_body_records_bytes_written() {
        let (reader, metrics) = fixture();
        let body = metrics
            .begin("GET", "/api/users", None)
            .finish_streamed(200, chunked(&["abc", "defgh", ""]));
        assert_eq!(body.size_hint().exact(), None);

        // Nothing is recorded until the body has been written out.
        assert_eq!(reader.sum(ACTIVE_REQUESTS, &route_attrs()), Some(1));

        let bytes = axum::body::to_bytes(Body::new(body), usize::MAX).await.unwrap();
        assert_eq!(bytes.len(), 8);

        let done = done("200", "2xx");
        assert_eq!(reader.sum(ACTIVE_REQUESTS, &route_attrs()), Some(0));
        assert_eq!(reader.sum(REQUESTS_TOTAL, &done), Some(1));
        assert_eq!(reader.histogram(RESPONSE_SIZE, &done), Some((1, 8.0)));
    }

    #[tokio::test]
    async fn test_abandoned_body_records_partial_size() {
        let (reader, metrics) = fixture();
        let body = metrics
            .begin("GET", "/api/users", None)
            .finish_streamed(200, chunked(&["abcd", "efgh"]));

        let mut data = Body::new(body).into_data_stream();
        assert_eq!(data.next().await.unwrap().unwrap().len(), 4);
        drop(data);

        let done = done("200", "2xx");
        assert_eq!(reader.sum(ACTIVE_REQUESTS, &route_attrs()), Some(0));
        assert_eq!(reader.histogram(RESPONSE_SIZE, &done), Some((1, 4.0)));
    }
}
