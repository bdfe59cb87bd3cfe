//! Data-layer instruments.
//!
//! Instruments come straight from the SDK meter; an instrument the SDK
//! rejects is a noop, so the data layer keeps running without it.

use std::time::Duration;

use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};
use opentelemetry::trace::SpanContext;

use crate::database::pool::PoolStats;
use crate::database::DbError;
use crate::observability::metrics::{noop_meter, SECONDS_BOUNDS};
use crate::observability::{saturating_i64, KeyValue, DB_SCOPE};

pub const QUERY_DURATION: &str = "db.query.duration";
pub const QUERY_COUNT: &str = "db.query.count";
pub const QUERY_ERRORS: &str = "db.query.errors";
pub const CONNECTIONS_ACTIVE: &str = "db.connections.active";
pub const CONNECTION_ERRORS: &str = "db.connection.errors";
pub const HEALTH_CHECK_DURATION: &str = "db.health_check.duration";

pub struct DbMetrics {
    system: &'static str,
    query_duration: Histogram<f64>,
    query_count: Counter<u64>,
    query_errors: Counter<u64>,
    connections_active: UpDownCounter<i64>,
    connection_errors: Counter<u64>,
    health_check_duration: Histogram<f64>,
}

impl DbMetrics {
    pub fn new(meter: &Meter, system: &'static str) -> Self {
        Self {
            system,
            query_duration: meter
                .f64_histogram(QUERY_DURATION)
                .with_description("Database query duration in seconds")
                .with_unit("s")
                .with_boundaries(SECONDS_BOUNDS.to_vec())
                .build(),
            query_count: meter
                .u64_counter(QUERY_COUNT)
                .with_description("Total number of database queries")
                .build(),
            query_errors: meter
                .u64_counter(QUERY_ERRORS)
                .with_description("Total number of database query errors")
                .build(),
            connections_active: meter
                .i64_up_down_counter(CONNECTIONS_ACTIVE)
                .with_description("Number of active database connections")
                .build(),
            connection_errors: meter
                .u64_counter(CONNECTION_ERRORS)
                .with_description("Total number of database connection errors")
                .build(),
            health_check_duration: meter
                .f64_histogram(HEALTH_CHECK_DURATION)
                .with_description("Database health check duration in seconds")
                .with_unit("s")
                .with_boundaries(SECONDS_BOUNDS.to_vec())
                .build(),
        }
    }

    pub fn noop(system: &'static str) -> Self {
        Self::new(&noop_meter(DB_SCOPE), system)
    }

    /// One count and one duration per query; failures also count as `query_failed`.
    pub fn record_query_metrics(
        &self,
        cx: Option<&SpanContext>,
        operation: &str,
        table: &str,
        duration: Duration,
        error: Option<&DbError>,
    ) {
        let mut attrs = vec![
            KeyValue::new("db.system", self.system),
            KeyValue::new("db.operation", operation.to_string()),
            KeyValue::new("db.table", table.to_string()),
        ];
        self.query_duration.record(duration.as_secs_f64(), &attrs);
        self.query_count.add(1, &attrs);

        if let Some(err) = error {
            attrs.push(KeyValue::new("error.type", "query_failed"));
            self.query_errors.add(1, &attrs);
            match cx {
                Some(cx) => tracing::debug!(
                    trace_id = %cx.trace_id(),
                    operation = %operation,
                    table = %table,
                    error = %err,
                    "Query failed"
                ),
                None => tracing::debug!(operation = %operation, table = %table, error = %err, "Query failed"),
            }
        }
    }

    /// Snapshot-delta push: `+open` as active, `-idle` as idle.
    pub fn record_connection_metrics(&self, stats: &PoolStats) {
        let open = saturating_i64(stats.open_connections);
        let idle = saturating_i64(stats.idle);
        self.connections_active.add(
            open,
            &[
                KeyValue::new("db.system", self.system),
                KeyValue::new("connection.type", "active"),
            ],
        );
        self.connections_active.add(
            -idle,
            &[
                KeyValue::new("db.system", self.system),
                KeyValue::new("connection.type", "idle"),
            ],
        );
    }

    pub fn record_health_check(&self, duration: Duration, healthy: bool) {
        self.health_check_duration.record(
            duration.as_secs_f64(),
            &[
                KeyValue::new("db.system", self.system),
                KeyValue::new("db.health.status", healthy),
            ],
        );
        if !healthy {
            self.connection_errors.add(
                1,
                &[
                    KeyValue::new("db.system", self.system),
                    KeyValue::new("error.type", "health_check_failed"),
                ],
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::testing::MetricReader;

    fn attrs(operation: &'static str) -> Vec<KeyValue> {
        vec![
            KeyValue::new("db.system", "memory"),
            KeyValue::new("db.operation", operation),
            KeyValue::new("db.table", "users"),
        ]
    }

    #[test]
    fn test_query_metrics_success_and_failure() {
        let reader = MetricReader::new();
        let metrics = DbMetrics::new(&reader.meter(DB_SCOPE), "memory");

        metrics.record_query_metrics(None, "SELECT", "users", Duration::from_millis(3), None);
        metrics.record_query_metrics(None, "SELECT", "users", Duration::from_millis(5), Some(&DbError::Closed));

        assert_eq!(reader.sum(QUERY_COUNT, &attrs("SELECT")), Some(2));
        assert_eq!(reader.histogram_count(QUERY_DURATION), 2);

        let mut failed = attrs("SELECT");
        failed.push(KeyValue::new("error.type", "query_failed"));
        assert_eq!(reader.sum(QUERY_ERRORS, &failed), Some(1));
        assert_eq!(reader.total(QUERY_ERRORS), 1);
    }

    #[test]
    fn test_connection_metrics_push_deltas() {
        let reader = MetricReader::new();
        let metrics = DbMetrics::new(&reader.meter(DB_SCOPE), "memory");
        let stats = PoolStats {
            open_connections: 4,
            idle: 3,
            ..PoolStats::default()
        };
        metrics.record_connection_metrics(&stats);
        metrics.record_connection_metrics(&stats);

        let active = [
            KeyValue::new("db.system", "memory"),
            KeyValue::new("connection.type", "active"),
        ];
        let idle = [
            KeyValue::new("db.system", "memory"),
            KeyValue::new("connection.type", "idle"),
        ];
        assert_eq!(reader.sum(CONNECTIONS_ACTIVE, &active), Some(8));
        assert_eq!(reader.sum(CONNECTIONS_ACTIVE, &idle), Some(-6));
    }

    #[test]
    fn test_failed_health_check_counts_connection_error() {
        let reader = MetricReader::new();
        let metrics = DbMetrics::new(&reader.meter(DB_SCOPE), "memory");
        metrics.record_health_check(Duration::from_micros(10), true);
        metrics.record_health_check(Duration::from_micros(10), false);

        assert_eq!(reader.histogram_count(HEALTH_CHECK_DURATION), 2);
        assert_eq!(reader.total(CONNECTION_ERRORS), 1);
    }

    #[test]
    fn test_noop_metrics_accept_recordings() {
        let metrics = DbMetrics::noop("memory");
        metrics.record_query_metrics(None, "DELETE", "users", Duration::ZERO, Some(&DbError::NotFound));
        metrics.record_connection_metrics(&PoolStats::default());
    }
}
