//! Repositories: traced, metered data access for the HTTP handlers.

pub mod user;

use crate::database::DbError;

pub use user::UserRepository;

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("user not found")]
    NotFound,

    #[error("email already exists: {0}")]
    DuplicateEmail(String),

    #[error(transparent)]
    Db(DbError),
}

impl From<DbError> for RepositoryError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound => RepositoryError::NotFound,
            DbError::DuplicateEmail(email) => RepositoryError::DuplicateEmail(email),
            other => RepositoryError::Db(other),
        }
    }
}
