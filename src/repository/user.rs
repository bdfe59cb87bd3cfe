//! Traced access to the `users` table.
//!
//! Each operation opens a `UserRepository.<Op>` span under the caller's
//! context and runs inside it, so nested calls (`Create` reading back via
//! `GetByID`) become grandchildren of the request span. Every table access
//! records one query through `DbMetrics::record_query_metrics`.

use std::sync::Arc;
use std::time::Instant;

use opentelemetry::trace::FutureExt;

use crate::database::{Database, DbError, UserTable, USERS_TABLE};
use crate::models::{CreateUserRequest, UpdateUserRequest, User};
use crate::observability::context::current_span_context;
use crate::observability::trace::Span;
use crate::observability::{saturating_i64, KeyValue, Tracer};
use crate::repository::RepositoryError;

pub struct UserRepository {
    db: Arc<Database>,
    tracer: Tracer,
}

fn db_attrs(operation: &'static str) -> [KeyValue; 2] {
    [
        KeyValue::new("db.operation", operation),
        KeyValue::new("db.table", USERS_TABLE),
    ]
}

fn fail(span: &Span, err: DbError) -> RepositoryError {
    span.set_attribute(KeyValue::new("db.query.success", false));
    span.record_error(&err);
    RepositoryError::from(err)
}

impl UserRepository {
    pub fn new(db: Arc<Database>, tracer: Tracer) -> Self {
        Self { db, tracer }
    }

    async fn query<T>(
        &self,
        operation: &'static str,
        op: impl FnOnce(&UserTable) -> Result<T, DbError>,
    ) -> Result<T, DbError> {
        let started = Instant::now();
        let result = self.db.with_users(op).await;
        // A missing row is an answer, not a failed query.
        let error = match &result {
            Err(DbError::NotFound) | Ok(_) => None,
            Err(e) => Some(e),
        };
        self.db.metrics().record_query_metrics(
            current_span_context().as_ref(),
            operation,
            USERS_TABLE,
            started.elapsed(),
            error,
        );
        result
    }

    pub async fn get_all(&self, limit: usize, offset: usize) -> Result<Vec<User>, RepositoryError> {
        let span = self.tracer.start("UserRepository.GetAll");
        span.set_attributes([
            KeyValue::new("pagination.limit", saturating_i64(limit)),
            KeyValue::new("pagination.offset", saturating_i64(offset)),
        ]);
        span.set_attributes(db_attrs("SELECT"));

        async {
            match self.query("SELECT", |t| Ok(t.list(limit, offset))).await {
                Ok(users) => {
                    span.set_attributes([
                        KeyValue::new("result.count", saturating_i64(users.len())),
                        KeyValue::new("db.query.success", true),
                    ]);
                    Ok(users)
                }
                Err(e) => Err(fail(&span, e)),
            }
        }
        .with_context(span.otel_context().clone())
        .await
    }

    pub async fn get_by_id(&self, id: i64) -> Result<User, RepositoryError> {
        let span = self.tracer.start("UserRepository.GetByID");
        span.set_attribute(KeyValue::new("user.id", id));
        span.set_attributes(db_attrs("SELECT"));

        async {
            match self.query("SELECT", |t| t.get(id).ok_or(DbError::NotFound)).await {
                Ok(user) => {
                    span.set_attributes([
                        KeyValue::new("user.found", true),
                        KeyValue::new("db.query.success", true),
                    ]);
                    Ok(user)
                }
                Err(DbError::NotFound) => {
                    span.set_attributes([
                        KeyValue::new("user.found", false),
                        KeyValue::new("db.query.success", true),
                    ]);
                    Err(RepositoryError::NotFound)
                }
                Err(e) => Err(fail(&span, e)),
            }
        }
        .with_context(span.otel_context().clone())
        .await
    }

    pub async fn get_by_email(&self, email: &str) -> Result<User, RepositoryError> {
        let span = self.tracer.start("UserRepository.GetByEmail");
        span.set_attribute(KeyValue::new("user.email", email.to_string()));
        span.set_attributes(db_attrs("SELECT"));

        async {
            match self
                .query("SELECT", |t| t.find_by_email(email).ok_or(DbError::NotFound))
                .await
            {
                Ok(user) => {
                    span.set_attribute(KeyValue::new("user.found", true));
                    Ok(user)
                }
                Err(DbError::NotFound) => {
                    span.set_attribute(KeyValue::new("user.found", false));
                    Err(RepositoryError::NotFound)
                }
                Err(e) => Err(fail(&span, e)),
            }
        }
        .with_context(span.otel_context().clone())
        .await
    }

    pub async fn create(&self, req: &CreateUserRequest) -> Result<User, RepositoryError> {
        let span = self.tracer.start("UserRepository.Create");
        span.set_attributes([
            KeyValue::new("user.name", req.name.clone()),
            KeyValue::new("user.email", req.email.clone()),
        ]);
        span.set_attributes(db_attrs("INSERT"));

        async {
            let id = match self.query("INSERT", |t| t.insert(req)).await {
                Ok(user) => user.id,
                Err(e) => return Err(fail(&span, e)),
            };
            span.set_attributes([
                KeyValue::new("user.id", id),
                KeyValue::new("db.query.success", true),
            ]);
            self.get_by_id(id).await
        }
        .with_context(span.otel_context().clone())
        .await
    }

    pub async fn update(&self, id: i64, req: &UpdateUserRequest) -> Result<User, RepositoryError> {
        let span = self.tracer.start("UserRepository.Update");
        span.set_attribute(KeyValue::new("user.id", id));
        span.set_attributes(db_attrs("UPDATE"));

        async {
            let existing = self.get_by_id(id).await?;
            if req.is_empty() {
                span.set_attribute(KeyValue::new("user.no_changes", true));
                return Ok(existing);
            }
            if let Some(name) = &req.name {
                span.set_attribute(KeyValue::new("user.name", name.clone()));
            }
            if let Some(email) = &req.email {
                span.set_attribute(KeyValue::new("user.email", email.clone()));
            }

            match self.query("UPDATE", |t| t.update(id, req)).await {
                Ok(user) => {
                    span.set_attribute(KeyValue::new("db.query.success", true));
                    Ok(user)
                }
                Err(DbError::NotFound) => Err(RepositoryError::NotFound),
                Err(e) => Err(fail(&span, e)),
            }
        }
        .with_context(span.otel_context().clone())
        .await
    }

    pub async fn delete(&self, id: i64) -> Result<(), RepositoryError> {
        let span = self.tracer.start("UserRepository.Delete");
        span.set_attribute(KeyValue::new("user.id", id));
        span.set_attributes(db_attrs("DELETE"));

        async {
            self.get_by_id(id).await?;
            match self.query("DELETE", |t| t.delete(id)).await {
                Ok(()) => {
                    span.set_attribute(KeyValue::new("user.deleted", true));
                    Ok(())
                }
                Err(DbError::NotFound) => Err(RepositoryError::NotFound),
                Err(e) => Err(fail(&span, e)),
            }
        }
        .with_context(span.otel_context().clone())
        .await
    }

    pub async fn count(&self) -> Result<usize, RepositoryError> {
        let span = self.tracer.start("UserRepository.Count");
        span.set_attributes(db_attrs("SELECT"));

        async {
            match self.query("SELECT", |t| Ok(t.count())).await {
                Ok(n) => {
                    span.set_attribute(KeyValue::new("result.count", saturating_i64(n)));
                    Ok(n)
                }
                Err(e) => Err(fail(&span, e)),
            }
        }
        .with_context(span.otel_context().clone())
        .await
    }
}
