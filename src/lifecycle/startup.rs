//! Startup orchestration.
//!
//! # Responsibilities
//! - Initialize telemetry (degrading to disabled on failure)
//! - Connect the database and bind the listener
//! - Run the server and the connection monitor until asked to stop
//! - Shut down in order: drain HTTP, join the monitor, close the pool,
//!   flush telemetry
//!
//! # Design Decisions
//! - Telemetry failures never abort startup; database and bind failures do
//! - Every shutdown phase is bounded by its configured deadline

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;

use crate::config::{AppConfig, TelemetryConfig};
use crate::database::{ConnectionMonitor, Database, DbError, MemoryConnector};
use crate::http::HttpServer;
use crate::lifecycle::shutdown::Shutdown;
use crate::observability::{self, init_telemetry, Severity, Telemetry};

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("database: {0}")]
    Database(#[from] DbError),

    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server: {0}")]
    Serve(#[from] std::io::Error),
}

/// Telemetry from `cfg`, or a disabled bundle when initialization fails.
pub fn telemetry_or_disabled(cfg: &TelemetryConfig) -> Telemetry {
    match init_telemetry(cfg) {
        Ok(providers) => Telemetry::new(providers, Severity::parse_or_default(&cfg.log_level)),
        Err(e) => {
            tracing::warn!(error = %e, "Telemetry initialization failed; continuing without export");
            Telemetry::disabled(cfg)
        }
    }
}

/// A started, not yet serving, application.
pub struct Application {
    config: AppConfig,
    telemetry: Arc<Telemetry>,
    db: Arc<Database>,
    listener: TcpListener,
    shutdown: Shutdown,
}

impl Application {
    /// Build every subsystem from `config` using the process telemetry.
    pub async fn start(config: AppConfig) -> Result<Self, StartupError> {
        let telemetry = Arc::new(telemetry_or_disabled(&config.telemetry));
        if observability::install_global(Arc::clone(&telemetry)).is_err() {
            tracing::warn!("Telemetry already installed; keeping the existing global");
        }
        Self::with_telemetry(config, telemetry).await
    }

    /// Build every subsystem around an already constructed telemetry bundle.
    pub async fn with_telemetry(config: AppConfig, telemetry: Arc<Telemetry>) -> Result<Self, StartupError> {
        let db = Arc::new(Database::connect(&MemoryConnector, &config.database, telemetry.as_ref())?);

        let address = config.server.bind_address();
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|source| StartupError::Bind { address, source })?;

        tracing::info!(
            service = %config.telemetry.service_name,
            environment = %config.telemetry.environment,
            tracing = config.telemetry.enable_tracing,
            metrics = config.telemetry.enable_metrics,
            logging = config.telemetry.enable_logging,
            "Application started"
        );

        Ok(Self {
            config,
            telemetry,
            db,
            listener,
            shutdown: Shutdown::new(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Serve until `stop` resolves, then shut everything down.
    pub async fn run(self, stop: impl Future<Output = ()> + Send + 'static) -> Result<(), StartupError> {
        let Self {
            config,
            telemetry,
            db,
            listener,
            shutdown,
        } = self;

        let monitor = ConnectionMonitor::new(Arc::clone(&db), telemetry.logger(), config.database.monitor_interval())
            .start(shutdown.subscribe());

        let server = HttpServer::new(config.server.clone(), Arc::clone(&db), &telemetry);
        let serve = server.run(listener, shutdown.signalled());
        tokio::pin!(serve);

        let served = tokio::select! {
            result = &mut serve => result,
            _ = stop => {
                shutdown.trigger();
                match tokio::time::timeout(config.server.shutdown_timeout(), &mut serve).await {
                    Ok(result) => result,
                    Err(_) => {
                        tracing::warn!(
                            timeout_secs = config.server.shutdown_timeout_secs,
                            "HTTP drain deadline exceeded; abandoning open connections"
                        );
                        Ok(())
                    }
                }
            }
        };
        shutdown.trigger();

        let samples = monitor.join().await;
        tracing::info!(samples, "Connection monitor joined");
        db.close();

        if let Err(e) = telemetry.shutdown(config.telemetry.shutdown_timeout()).await {
            tracing::warn!(error = %e, "Telemetry shutdown incomplete");
        }

        tracing::info!("Shutdown complete");
        served.map_err(StartupError::Serve)
    }
}
