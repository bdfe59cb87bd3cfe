//! Request completion logging.
//!
//! Runs inside the server span, so every completion record carries the
//! request's `trace_id`/`span_id`. Severity follows the response status.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::USER_AGENT;
use axum::middleware::Next;
use axum::response::Response;

use crate::http::request::RequestIdExt;
use crate::observability::logging::{severity_for_status, Severity};
use crate::observability::{KeyValue, Logger};

pub fn completion_message(severity: Severity) -> &'static str {
    match severity {
        Severity::Error | Severity::Fatal => "HTTP request completed with server error",
        Severity::Warn => "HTTP request completed with client error",
        Severity::Debug | Severity::Info => "HTTP request completed successfully",
    }
}

pub async fn log_requests(State(logger): State<Arc<Logger>>, req: Request, next: Next) -> Response {
    let started = Instant::now();
    let mut fields = vec![
        KeyValue::new("method", req.method().to_string()),
        KeyValue::new("path", req.uri().path().to_string()),
    ];
    if let Some(agent) = req.headers().get(USER_AGENT).and_then(|v| v.to_str().ok()) {
        fields.push(KeyValue::new("user_agent", agent.to_string()));
    }
    if let Some(ConnectInfo(addr)) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        fields.push(KeyValue::new("client_ip", addr.ip().to_string()));
    }
    if let Some(id) = req.request_id() {
        fields.push(KeyValue::new("request_id", id.to_string()));
    }

    let response = next.run(req).await;

    let status = response.status().as_u16();
    fields.push(KeyValue::new("status_code", i64::from(status)));
    fields.push(KeyValue::new("latency", format!("{:?}", started.elapsed())));

    let severity = severity_for_status(status);
    logger.log(severity, completion_message(severity), &fields);
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_per_severity() {
        assert_eq!(
            completion_message(severity_for_status(503)),
            "HTTP request completed with server error"
        );
        assert_eq!(
            completion_message(severity_for_status(404)),
            "HTTP request completed with client error"
        );
        assert_eq!(completion_message(severity_for_status(201)), "HTTP request completed successfully");
    }
}
