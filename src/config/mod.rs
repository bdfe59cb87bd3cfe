//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! optional config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → loader.rs (environment overrides)
//!     → validation.rs (semantic checks)
//!     → AppConfig (validated, immutable)
//!     → handed to telemetry init, the pool, and the HTTP server
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::AppConfig;
pub use schema::DatabaseConfig;
pub use schema::ServerConfig;
pub use schema::TelemetryConfig;
