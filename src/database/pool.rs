//! Connection pool with observable statistics.
//!
//! # Responsibilities
//! - Bound concurrent connections (`max_open`) with a semaphore
//! - Reuse idle connections up to `max_idle`, retire them by lifetime and idle time
//! - Expose a non-blocking statistics snapshot
//!
//! # Design Decisions
//! - Every counter is an atomic, so `stats()` never waits on the pool
//! - A checked-out connection is an RAII guard; dropping it returns or retires it
//! - Closing the pool fails pings and acquisitions from then on

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::DatabaseConfig;
use crate::database::DbError;

/// Pool limits.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_open: usize,
    pub max_idle: usize,
    pub max_lifetime: Duration,
    pub max_idle_time: Duration,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from(&DatabaseConfig::default())
    }
}

impl From<&DatabaseConfig> for PoolConfig {
    fn from(cfg: &DatabaseConfig) -> Self {
        Self {
            max_open: cfg.max_open_connections.max(1),
            max_idle: cfg.max_idle_connections,
            max_lifetime: cfg.conn_max_lifetime(),
            max_idle_time: cfg.conn_max_idle_time(),
            acquire_timeout: cfg.acquire_timeout(),
        }
    }
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub open_connections: usize,
    pub in_use: usize,
    pub idle: usize,
    pub wait_count: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub wait_duration: Duration,
    pub max_idle_closed: u64,
    pub max_idle_time_closed: u64,
    pub max_lifetime_closed: u64,
}

fn serialize_duration<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format!("{:?}", d))
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Open: {}, InUse: {}, Idle: {}, WaitCount: {}, WaitDuration: {:?}",
            self.open_connections, self.in_use, self.idle, self.wait_count, self.wait_duration
        )
    }
}

#[derive(Debug)]
struct Connection {
    id: u64,
    created: Instant,
    last_used: Instant,
}

#[derive(Default)]
struct Counters {
    open: AtomicUsize,
    in_use: AtomicUsize,
    idle: AtomicUsize,
    wait_count: AtomicU64,
    wait_nanos: AtomicU64,
    max_idle_closed: AtomicU64,
    max_idle_time_closed: AtomicU64,
    max_lifetime_closed: AtomicU64,
}

pub struct ConnectionPool {
    config: PoolConfig,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Connection>>,
    counters: Counters,
    closed: AtomicBool,
    next_id: AtomicU64,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            permits: Arc::new(Semaphore::new(config.max_open.max(1))),
            config,
            idle: Mutex::new(Vec::new()),
            counters: Counters::default(),
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Check out a connection, waiting up to `acquire_timeout` for a free slot.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConnection, DbError> {
        if self.is_closed() {
            return Err(DbError::Closed);
        }

        let permit = match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.counters.wait_count.fetch_add(1, Ordering::Relaxed);
                let started = Instant::now();
                let waited = tokio::time::timeout(
                    self.config.acquire_timeout,
                    Arc::clone(&self.permits).acquire_owned(),
                )
                .await;
                let nanos = u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);
                self.counters.wait_nanos.fetch_add(nanos, Ordering::Relaxed);
                match waited {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_)) => return Err(DbError::Closed),
                    Err(_) => return Err(DbError::AcquireTimeout(self.config.acquire_timeout)),
                }
            }
        };

        let conn = self.take_idle().unwrap_or_else(|| {
            self.counters.open.fetch_add(1, Ordering::Relaxed);
            let now = Instant::now();
            Connection {
                id: self.next_id.fetch_add(1, Ordering::Relaxed),
                created: now,
                last_used: now,
            }
        });
        self.counters.in_use.fetch_add(1, Ordering::Relaxed);

        Ok(PooledConnection {
            pool: Arc::clone(self),
            conn: Some(conn),
            _permit: permit,
        })
    }

    fn take_idle(&self) -> Option<Connection> {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        while let Some(conn) = idle.pop() {
            self.counters.idle.fetch_sub(1, Ordering::Relaxed);
            if conn.created.elapsed() >= self.config.max_lifetime {
                self.retire(&self.counters.max_lifetime_closed);
                continue;
            }
            return Some(conn);
        }
        None
    }

    fn release(&self, mut conn: Connection) {
        self.counters.in_use.fetch_sub(1, Ordering::Relaxed);
        if self.is_closed() {
            self.counters.open.fetch_sub(1, Ordering::Relaxed);
            return;
        }
        if conn.created.elapsed() >= self.config.max_lifetime {
            self.retire(&self.counters.max_lifetime_closed);
            return;
        }

        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() >= self.config.max_idle {
            drop(idle);
            self.retire(&self.counters.max_idle_closed);
            return;
        }
        conn.last_used = Instant::now();
        idle.push(conn);
        self.counters.idle.fetch_add(1, Ordering::Relaxed);
    }

    fn retire(&self, reason: &AtomicU64) {
        self.counters.open.fetch_sub(1, Ordering::Relaxed);
        reason.fetch_add(1, Ordering::Relaxed);
    }

    /// Close idle connections past their idle time or lifetime. Returns how many.
    pub fn reap_idle(&self) -> usize {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        let before = idle.len();
        idle.retain(|conn| {
            if conn.created.elapsed() >= self.config.max_lifetime {
                self.retire(&self.counters.max_lifetime_closed);
                false
            } else if conn.last_used.elapsed() >= self.config.max_idle_time {
                self.retire(&self.counters.max_idle_time_closed);
                false
            } else {
                true
            }
        });
        let reaped = before - idle.len();
        self.counters.idle.fetch_sub(reaped, Ordering::Relaxed);
        reaped
    }

    /// Verify the pool can serve connections.
    pub fn ping(&self) -> Result<(), DbError> {
        if self.is_closed() {
            Err(DbError::Closed)
        } else {
            Ok(())
        }
    }

    /// Close the pool; idle connections are dropped, in-use ones on release.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.permits.close();
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        let n = idle.len();
        idle.clear();
        self.counters.idle.fetch_sub(n, Ordering::Relaxed);
        self.counters.open.fetch_sub(n, Ordering::Relaxed);
        tracing::info!(closed_idle = n, "Connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolStats {
        let c = &self.counters;
        PoolStats {
            open_connections: c.open.load(Ordering::Relaxed),
            in_use: c.in_use.load(Ordering::Relaxed),
            idle: c.idle.load(Ordering::Relaxed),
            wait_count: c.wait_count.load(Ordering::Relaxed),
            wait_duration: Duration::from_nanos(c.wait_nanos.load(Ordering::Relaxed)),
            max_idle_closed: c.max_idle_closed.load(Ordering::Relaxed),
            max_idle_time_closed: c.max_idle_time_closed.load(Ordering::Relaxed),
            max_lifetime_closed: c.max_lifetime_closed.load(Ordering::Relaxed),
        }
    }
}

/// A checked-out connection; returned to the pool on drop.
pub struct PooledConnection {
    pool: Arc<ConnectionPool>,
    conn: Option<Connection>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    pub fn id(&self) -> u64 {
        self.conn.as_ref().map(|c| c.id).unwrap_or_default()
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection").field("id", &self.id()).finish()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(max_open: usize, max_idle: usize) -> Arc<ConnectionPool> {
        ConnectionPool::new(PoolConfig {
            max_open,
            max_idle,
            max_lifetime: Duration::from_secs(300),
            max_idle_time: Duration::from_secs(60),
            acquire_timeout: Duration::from_millis(50),
        })
    }

    #[tokio::test]
    async fn test_acquire_and_release_updates_stats() {
        let pool = pool(2, 1);
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_eq!(pool.stats().in_use, 2);
        assert_eq!(pool.stats().open_connections, 2);

        drop(a);
        drop(b);
        let stats = pool.stats();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.open_connections, 1);
        assert_eq!(stats.max_idle_closed, 1);
    }

    #[tokio::test]
    async fn test_idle_connection_is_reused() {
        let pool = pool(1, 1);
        let first = pool.acquire().await.unwrap().id();
        let second = pool.acquire().await.unwrap().id();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_exhausted_pool_waits_then_times_out() {
        let pool = pool(1, 1);
        let _held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, DbError::AcquireTimeout(_)));
        let stats = pool.stats();
        assert_eq!(stats.wait_count, 1);
        assert!(stats.wait_duration >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_close_fails_ping_and_acquire() {
        let pool = pool(2, 2);
        drop(pool.acquire().await.unwrap());
        assert!(pool.ping().is_ok());

        pool.close();
        assert!(matches!(pool.ping(), Err(DbError::Closed)));
        assert!(matches!(pool.acquire().await, Err(DbError::Closed)));
        assert_eq!(pool.stats().open_connections, 0);
    }

    #[tokio::test]
    async fn test_reap_idle_time() {
        let pool = ConnectionPool::new(PoolConfig {
            max_idle_time: Duration::ZERO,
            ..PoolConfig::default()
        });
        drop(pool.acquire().await.unwrap());
        assert_eq!(pool.reap_idle(), 1);
        let stats = pool.stats();
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.open_connections, 0);
        assert_eq!(stats.max_idle_time_closed, 1);
    }
}
