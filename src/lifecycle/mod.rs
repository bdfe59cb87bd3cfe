//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Config → Telemetry → Database → Listener → Monitor + Server
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Stop accepting → Drain connections
//!         → Join monitor → Close pool → Flush telemetry → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then telemetry, then data, then listeners
//! - Ordered shutdown: stop accept, drain, join background tasks, flush
//! - Shutdown has timeouts: HTTP drain and telemetry flush are both bounded

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
pub use startup::{telemetry_or_disabled, Application, StartupError};
