//! Route handlers.

pub mod health;
pub mod metrics;
pub mod users;

pub use health::{health_check, readiness_check};
pub use metrics::get_metrics;
pub use users::{api_index, create_user, delete_user, get_user, get_users, update_user};
