//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, middleware stack)
//!     → request.rs (request id, inbound traceparent)
//!     → middleware/telemetry.rs (server span, request metrics)
//!     → middleware/logging.rs (completion log)
//!     → handlers/ (users, health, metrics)
//!     → response.rs (JSON envelopes, error mapping)
//!     → Send to client (x-request-id, traceparent)
//! ```

pub mod handlers;
pub mod middleware;
pub mod request;
pub mod response;
pub mod server;

pub use request::{RequestIdExt, X_REQUEST_ID};
pub use server::{build_router, AppState, HttpServer};
