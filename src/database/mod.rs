//! Data layer: connection pool, `users` table and data-layer telemetry.
//!
//! # Responsibilities
//! - Open the pool through a `DatabaseConnector`
//! - Run table operations on a checked-out connection
//! - Record query, connection and health-check metrics
//! - Answer health checks and expose non-blocking pool statistics
//!
//! # Design Decisions
//! - Narrow capability traits (`DatabaseConnector`, `MeterSource`,
//!   `HealthCheck`) are the seams tests substitute
//! - Instrument registration failures never fail `connect`

pub mod metrics;
pub mod monitor;
pub mod pool;
pub mod store;

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use opentelemetry::metrics::Meter;
use opentelemetry_sdk::metrics::SdkMeterProvider;

use crate::config::DatabaseConfig;
use crate::observability::{saturating_i64, Telemetry, DB_SCOPE};

pub use metrics::DbMetrics;
pub use monitor::{ConnectionMonitor, MonitorHandle, MonitorState};
pub use pool::{ConnectionPool, PoolConfig, PoolStats, PooledConnection};
pub use store::{UserTable, USERS_TABLE};

#[derive(Debug, Clone, thiserror::Error)]
pub enum DbError {
    #[error("database is closed")]
    Closed,

    #[error("timed out after {0:?} waiting for a connection")]
    AcquireTimeout(Duration),

    #[error("record not found")]
    NotFound,

    #[error("email already exists: {0}")]
    DuplicateEmail(String),

    #[error("failed to open database: {0}")]
    Open(String),
}

/// Opens pools and publishes their statistics.
pub trait DatabaseConnector: Send + Sync {
    /// Value of the `db.system` attribute.
    fn system(&self) -> &'static str;

    fn open(&self, config: &DatabaseConfig) -> Result<Arc<ConnectionPool>, DbError>;

    /// Register pool-statistics instruments on `meter`.
    fn register_stats(&self, pool: &Arc<ConnectionPool>, meter: &Meter, db_name: &str);
}

/// Anything that can hand out a meter for a scope.
pub trait MeterSource {
    fn meter(&self, scope: &'static str) -> Meter;
}

impl MeterSource for Telemetry {
    fn meter(&self, scope: &'static str) -> Meter {
        Telemetry::meter(self, scope)
    }
}

impl MeterSource for SdkMeterProvider {
    fn meter(&self, scope: &'static str) -> Meter {
        opentelemetry::metrics::MeterProvider::meter(self, scope)
    }
}

/// Liveness of the data layer, as seen by the health and metrics endpoints.
pub trait HealthCheck: Send + Sync {
    fn check_health(&self) -> BoxFuture<'_, Result<(), DbError>>;

    fn pool_stats(&self) -> PoolStats;
}

/// Connector backed by the in-process pool and table.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryConnector;

impl DatabaseConnector for MemoryConnector {
    fn system(&self) -> &'static str {
        "memory"
    }

    fn open(&self, config: &DatabaseConfig) -> Result<Arc<ConnectionPool>, DbError> {
        if config.name.is_empty() {
            return Err(DbError::Open("database name is empty".to_string()));
        }
        Ok(ConnectionPool::new(PoolConfig::from(config)))
    }

    fn register_stats(&self, pool: &Arc<ConnectionPool>, meter: &Meter, db_name: &str) {
        let gauges: [(&'static str, &'static str, fn(&PoolStats) -> i64); 4] = [
            ("db.client.connections.open", "Open connections", |s| saturating_i64(s.open_connections)),
            ("db.client.connections.in_use", "Connections in use", |s| saturating_i64(s.in_use)),
            ("db.client.connections.idle", "Idle connections", |s| saturating_i64(s.idle)),
            ("db.client.connections.wait_count", "Total waits for a connection", |s| {
                saturating_i64(s.wait_count)
            }),
        ];
        for (name, description, read) in gauges {
            let pool = Arc::downgrade(pool);
            meter
                .i64_observable_gauge(name)
                .with_description(description)
                .with_unit("{connection}")
                .with_callback(move |observer| {
                    if let Some(pool) = pool.upgrade() {
                        observer.observe(read(&pool.stats()), &[]);
                    }
                })
                .build();
        }
        tracing::debug!(db = %db_name, "Registered pool statistics gauges");
    }
}

pub struct Database {
    name: String,
    system: &'static str,
    pool: Arc<ConnectionPool>,
    users: UserTable,
    metrics: DbMetrics,
}

impl Database {
    /// Open the pool, verify it with a ping and register data-layer instruments.
    pub fn connect(
        connector: &dyn DatabaseConnector,
        config: &DatabaseConfig,
        meters: &dyn MeterSource,
    ) -> Result<Self, DbError> {
        let pool = connector.open(config)?;
        pool.ping()?;

        let meter = meters.meter(DB_SCOPE);
        connector.register_stats(&pool, &meter, &config.name);
        let metrics = DbMetrics::new(&meter, connector.system());

        tracing::info!(
            db = %config.name,
            system = connector.system(),
            max_open = pool.config().max_open,
            max_idle = pool.config().max_idle,
            "Connected to database"
        );

        Ok(Self {
            name: config.name.clone(),
            system: connector.system(),
            pool,
            users: UserTable::new(),
            metrics,
        })
    }

    /// In-memory database with default pool limits and noop instruments.
    pub fn in_memory() -> Result<Self, DbError> {
        Self::connect(&MemoryConnector, &DatabaseConfig::default(), &SdkMeterProvider::builder().build())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn system(&self) -> &'static str {
        self.system
    }

    pub fn metrics(&self) -> &DbMetrics {
        &self.metrics
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Run `op` against the users table while holding a pooled connection.
    pub async fn with_users<T>(&self, op: impl FnOnce(&UserTable) -> Result<T, DbError>) -> Result<T, DbError> {
        let _conn = self.pool.acquire().await?;
        op(&self.users)
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Ping the pool and record the health-check metrics.
    pub fn health(&self) -> Result<(), DbError> {
        let started = Instant::now();
        let result = self.pool.ping();
        self.metrics.record_health_check(started.elapsed(), result.is_ok());
        result
    }

    pub fn record_connection_metrics(&self) {
        self.metrics.record_connection_metrics(&self.pool.stats());
    }

    pub fn close(&self) {
        self.pool.close();
    }
}

impl HealthCheck for Database {
    fn check_health(&self) -> BoxFuture<'_, Result<(), DbError>> {
        async move { self.health() }.boxed()
    }

    fn pool_stats(&self) -> PoolStats {
        self.stats()
    }
}
