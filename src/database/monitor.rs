//! Connection pool monitoring.
//!
//! # Responsibilities
//! - Sample pool statistics on a fixed interval
//! - Feed each sample into the connection-pool metrics
//! - Retire idle-expired connections
//! - Log a one-line summary per sample
//!
//! # Design Decisions
//! - One owned task per process, cancelled through the shared shutdown
//!   broadcast and joined at shutdown
//! - The first sample is taken one interval after start
//! - Cancellation is only observed between samples; a sample in progress completes

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::database::Database;
use crate::observability::{saturating_i64, KeyValue, Logger};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MonitorState {
    Stopped = 0,
    Running = 1,
}

impl From<u8> for MonitorState {
    fn from(v: u8) -> Self {
        match v {
            1 => MonitorState::Running,
            _ => MonitorState::Stopped,
        }
    }
}

pub struct ConnectionMonitor {
    db: Arc<Database>,
    logger: Arc<Logger>,
    interval: Duration,
}

impl ConnectionMonitor {
    pub fn new(db: Arc<Database>, logger: Arc<Logger>, interval: Duration) -> Self {
        Self {
            db,
            logger,
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    /// Spawn the sampling loop. It runs until `shutdown` fires or its sender is dropped.
    pub fn start(self, mut shutdown: broadcast::Receiver<()>) -> MonitorHandle {
        let state = Arc::new(AtomicU8::new(MonitorState::Running as u8));
        let ticks = Arc::new(AtomicU64::new(0));

        let task_state = Arc::clone(&state);
        let task_ticks = Arc::clone(&ticks);
        let task = tokio::spawn(async move {
            tracing::info!(interval_ms = self.interval.as_millis() as u64, "Connection monitor starting");

            let mut ticker = time::interval_at(Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sample();
                        task_ticks.fetch_add(1, Ordering::Relaxed);
                    }
                    _ = shutdown.recv() => {
                        break;
                    }
                }
            }

            drop(ticker);
            task_state.store(MonitorState::Stopped as u8, Ordering::Release);
            self.logger.info("Database connection monitoring stopped", &[]);
        });

        MonitorHandle { state, ticks, task }
    }

    fn sample(&self) {
        self.db.record_connection_metrics();
        let reaped = self.db.pool().reap_idle();
        let stats = self.db.stats();
        self.logger.info(
            &format!("DB Stats - {}", stats),
            &[
                KeyValue::new("db.open", saturating_i64(stats.open_connections)),
                KeyValue::new("db.in_use", saturating_i64(stats.in_use)),
                KeyValue::new("db.idle", saturating_i64(stats.idle)),
                KeyValue::new("db.wait_count", saturating_i64(stats.wait_count)),
                KeyValue::new("db.reaped", saturating_i64(reaped)),
            ],
        );
    }
}

/// Owner of the running monitor task.
pub struct MonitorHandle {
    state: Arc<AtomicU8>,
    ticks: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn state(&self) -> MonitorState {
        MonitorState::from(self.state.load(Ordering::Acquire))
    }

    /// Completed samples so far.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Wait for the task to exit; returns the number of samples taken.
    pub async fn join(self) -> u64 {
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Connection monitor task failed");
        }
        self.ticks.load(Ordering::Relaxed)
    }
}
