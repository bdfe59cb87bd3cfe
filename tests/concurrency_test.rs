//! Instruments shared across worker threads keep exact totals.

mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tokio::sync::Barrier;
use tower::ServiceExt;

use common::{memory_telemetry, telemetry_config, Harness};
use otel_user_api::database::metrics::QUERY_COUNT;
use otel_user_api::http::middleware::telemetry::{ACTIVE_REQUESTS, REQUESTS_TOTAL, REQUEST_DURATION};
use otel_user_api::http::middleware::HttpMetrics;
use otel_user_api::observability::{KeyValue, HTTP_SCOPE};

const TASKS: usize = 32;
const ROUNDS: usize = 25;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_recordings_sum_exactly() {
    let memory = memory_telemetry(&telemetry_config());
    let meter = memory.telemetry.meter(HTTP_SCOPE);
    let metrics = Arc::new(HttpMetrics::new(&meter));
    let jobs = meter.u64_counter("jobs_total").build();

    let started = Arc::new(Barrier::new(TASKS + 1));
    let release = Arc::new(Barrier::new(TASKS + 1));

    let mut handles = Vec::with_capacity(TASKS);
    for task in 0..TASKS {
        let metrics = Arc::clone(&metrics);
        let jobs = jobs.clone();
        let started = Arc::clone(&started);
        let release = Arc::clone(&release);
        handles.push(tokio::spawn(async move {
            // One request held open across both barriers.
            let held = metrics.begin("GET", "/api/users", None);
            started.wait().await;
            release.wait().await;

            for round in 0..ROUNDS {
                let guard = metrics.begin("GET", "/api/users", Some(16));
                jobs.add(1, &[KeyValue::new("parity", ((task + round) % 2) as i64)]);
                tokio::task::yield_now().await;
                guard.finish(200, Some(64));
            }
            held.finish(200, None);
        }));
    }

    started.wait().await;
    assert_eq!(memory.metric_sum(ACTIVE_REQUESTS).await, TASKS as i64);
    release.wait().await;

    for handle in handles {
        handle.await.unwrap();
    }

    let per_task = (ROUNDS + 1) as i64;
    assert_eq!(memory.metric_sum(ACTIVE_REQUESTS).await, 0);
    assert_eq!(memory.metric_sum(REQUESTS_TOTAL).await, TASKS as i64 * per_task);
    assert_eq!(memory.histogram_count(REQUEST_DURATION).await, TASKS as u64 * per_task as u64);
    assert_eq!(memory.metric_sum("jobs_total").await, (TASKS * ROUNDS) as i64);
    assert_eq!(
        memory.metric_sum_for("jobs_total", &[KeyValue::new("parity", 0i64)]).await,
        Some((TASKS * ROUNDS / 2) as i64)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_requests_balance_active_counter() {
    let h = Harness::new();

    let mut handles = Vec::with_capacity(TASKS);
    for i in 0..TASKS {
        let router = h.router.clone();
        handles.push(tokio::spawn(async move {
            let req = if i % 2 == 0 {
                Request::get("/api/users").body(Body::empty()).unwrap()
            } else {
                Request::get("/api/users/not-a-number").body(Body::empty()).unwrap()
            };
            router.oneshot(req).await.unwrap().status()
        }));
    }

    let mut ok = 0;
    for handle in handles {
        match handle.await.unwrap() {
            StatusCode::OK => ok += 1,
            status => assert_eq!(status, StatusCode::BAD_REQUEST),
        }
    }
    assert_eq!(ok, TASKS / 2);

    assert_eq!(h.metric_sum(ACTIVE_REQUESTS).await, 0);
    assert_eq!(h.metric_sum(REQUESTS_TOTAL).await, TASKS as i64);
    assert_eq!(h.histogram_count(REQUEST_DURATION).await, TASKS as u64);
    // Each list request reads the page and the total.
    assert_eq!(h.metric_sum(QUERY_COUNT).await, TASKS as i64);
}
