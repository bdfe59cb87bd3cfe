//! Users API with request-scoped telemetry.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client Request
//!     ──────────────▶ request id ─▶ telemetry::track ─▶ log_requests ─▶ handler
//!                                   (server span,        (completion     │
//!                                    request metrics)     log)           ▼
//!                                                                  UserRepository
//!                                                                  (child spans,
//!                                                                   query metrics)
//!                                                                        │
//!                                                                        ▼
//!                                                                    Database
//!                                                                  (pool + table)
//!
//!     Background: ConnectionMonitor ──▶ pool metrics + stats log
//!     Export:     spans / logs (batched), metrics (periodic) ──▶ OTLP/gRPC collector
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use otel_user_api::config::{load_config, AppConfig};
use otel_user_api::lifecycle::{signals, Application};

#[derive(Parser, Debug)]
#[command(name = "otel-user-api", version, about = "Users REST API with OpenTelemetry instrumentation")]
struct Cli {
    /// Optional TOML configuration file; environment variables override it.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Print the effective configuration and exit.
    #[arg(long)]
    print_config: bool,
}

fn init_subscriber(config: &AppConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("otel_user_api={0},app={0},tower_http=info", config.telemetry.log_level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if config.telemetry.is_production() {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    if cli.print_config {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    init_subscriber(&config);
    tracing::info!(
        service = %config.telemetry.service_name,
        version = %config.telemetry.service_version,
        bind_address = %config.server.bind_address(),
        otlp_endpoint = %config.telemetry.otlp_endpoint,
        "Configuration loaded"
    );

    let app = Application::start(config).await?;
    tracing::info!(address = %app.local_addr()?, "Listening for connections");

    app.run(async {
        let signal = signals::wait_for_signal().await;
        tracing::info!(signal, "Shutdown signal received");
    })
    .await?;

    Ok(())
}
