//! Shared instrument settings and process gauges.
//!
//! # Design Decisions
//! - Instruments come from the SDK meter. Asking for the same name twice
//!   yields handles that record into one stream, and an invalid name yields
//!   a noop instrument rather than an error
//! - Gauge callbacks run on the SDK reader thread, so anything they need
//!   from the tokio runtime is captured at registration

use std::time::{Duration, Instant};

use opentelemetry::metrics::{Meter, MeterProvider as _};
use opentelemetry_sdk::metrics::SdkMeterProvider;

/// Boundaries for latencies measured in seconds.
pub const SECONDS_BOUNDS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Default interval of the periodic metric reader.
pub const DEFAULT_EXPORT_INTERVAL: Duration = Duration::from_secs(15);

/// Meter with no reader attached; every recording is dropped.
pub fn noop_meter(scope: &'static str) -> Meter {
    SdkMeterProvider::builder().build().meter(scope)
}

/// Uptime, tokio worker count and resident memory.
pub fn register_runtime_metrics(meter: &Meter) {
    let started = Instant::now();
    meter
        .f64_observable_gauge("process.uptime")
        .with_description("Time since process start")
        .with_unit("s")
        .with_callback(move |observer| observer.observe(started.elapsed().as_secs_f64(), &[]))
        .build();

    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        meter
            .i64_observable_gauge("process.runtime.tokio.workers")
            .with_description("Number of tokio worker threads")
            .with_unit("{thread}")
            .with_callback(move |observer| {
                observer.observe(i64::try_from(handle.metrics().num_workers()).unwrap_or(i64::MAX), &[])
            })
            .build();
    }

    meter
        .i64_observable_gauge("process.memory.rss")
        .with_description("Resident set size")
        .with_unit("By")
        .with_callback(|observer| {
            if let Some(bytes) = resident_bytes() {
                observer.observe(bytes, &[]);
            }
        })
        .build();
}

fn resident_bytes() -> Option<i64> {
    const PAGE_SIZE: i64 = 4096;
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let pages: i64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(pages.saturating_mul(PAGE_SIZE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::testing::MetricReader;
    use opentelemetry::KeyValue;

    #[test]
    fn test_same_name_shares_one_stream() {
        let reader = MetricReader::new();
        let meter = reader.meter("test");
        let first = meter.u64_counter("jobs_total").build();
        let second = meter.u64_counter("jobs_total").build();

        first.add(2, &[KeyValue::new("queue", "a")]);
        second.add(3, &[KeyValue::new("queue", "a")]);
        second.add(1, &[KeyValue::new("queue", "b")]);

        assert_eq!(reader.sum("jobs_total", &[KeyValue::new("queue", "a")]), Some(5));
        assert_eq!(reader.total("jobs_total"), 6);
    }

    #[test]
    fn test_invalid_name_degrades_to_noop() {
        let reader = MetricReader::new();
        let meter = reader.meter("test");
        let counter = meter.u64_counter("1 bad name").build();
        counter.add(1, &[]);
        meter.u64_counter("good_total").build().add(1, &[]);

        assert!(!reader.contains("1 bad name"));
        assert_eq!(reader.total("good_total"), 1);
    }

    #[test]
    fn test_histogram_uses_explicit_bounds() {
        let reader = MetricReader::new();
        let histogram = reader
            .meter("test")
            .f64_histogram("latency_seconds")
            .with_boundaries(SECONDS_BOUNDS.to_vec())
            .build();
        histogram.record(0.5, &[]);
        histogram.record(3.0, &[]);

        assert_eq!(reader.histogram("latency_seconds", &[]), Some((2, 3.5)));
    }

    #[test]
    fn test_noop_meter_accepts_recordings() {
        let meter = noop_meter("test");
        meter.u64_counter("ignored_total").build().add(1, &[]);
        meter.f64_histogram("ignored_seconds").build().record(1.0, &[]);
    }

    #[tokio::test]
    async fn test_runtime_gauges_report() {
        let reader = MetricReader::new();
        register_runtime_metrics(&reader.meter("runtime"));

        assert!(reader.gauge("process.uptime").is_some());
        assert_eq!(reader.gauge("process.runtime.tokio.workers"), Some(1.0));
    }
}
