//! Domain entities exchanged between the HTTP layer and the repository.

pub mod user;

pub use user::{CreateUserRequest, UpdateUserRequest, User};
