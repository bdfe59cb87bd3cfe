//! In-memory `users` table.
//!
//! Rows live in a `DashMap` keyed by id; a second map indexes emails so
//! uniqueness is enforced with the entry API instead of a table-wide lock.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::database::DbError;
use crate::models::{CreateUserRequest, UpdateUserRequest, User};

pub const USERS_TABLE: &str = "users";

#[derive(Default)]
pub struct UserTable {
    rows: DashMap<i64, User>,
    emails: DashMap<String, i64>,
    next_id: AtomicI64,
}

impl UserTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Newest first, then `offset`/`limit` applied.
    pub fn list(&self, limit: usize, offset: usize) -> Vec<User> {
        let mut users: Vec<User> = self.rows.iter().map(|row| row.value().clone()).collect();
        users.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        users.into_iter().skip(offset).take(limit).collect()
    }

    pub fn get(&self, id: i64) -> Option<User> {
        self.rows.get(&id).map(|row| row.value().clone())
    }

    pub fn find_by_email(&self, email: &str) -> Option<User> {
        let id = *self.emails.get(email)?;
        self.get(id)
    }

    pub fn count(&self) -> usize {
        self.rows.len()
    }

    pub fn insert(&self, req: &CreateUserRequest) -> Result<User, DbError> {
        match self.emails.entry(req.email.clone()) {
            Entry::Occupied(_) => Err(DbError::DuplicateEmail(req.email.clone())),
            Entry::Vacant(slot) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
                let now = Utc::now();
                let user = User {
                    id,
                    name: req.name.clone(),
                    email: req.email.clone(),
                    bio: req.bio.clone(),
                    created_at: now,
                    updated_at: now,
                };
                slot.insert(id);
                self.rows.insert(id, user.clone());
                Ok(user)
            }
        }
    }

    /// Apply the present fields. An email change claims the new address first.
    pub fn update(&self, id: i64, req: &UpdateUserRequest) -> Result<User, DbError> {
        let current = self.get(id).ok_or(DbError::NotFound)?;

        let mut released = None;
        if let Some(email) = req.email.as_ref().filter(|e| **e != current.email) {
            match self.emails.entry(email.clone()) {
                Entry::Occupied(_) => return Err(DbError::DuplicateEmail(email.clone())),
                Entry::Vacant(slot) => {
                    slot.insert(id);
                    released = Some(current.email.clone());
                }
            }
        }

        let mut row = self.rows.get_mut(&id).ok_or(DbError::NotFound)?;
        if let Some(name) = &req.name {
            row.name = name.clone();
        }
        if let Some(email) = &req.email {
            row.email = email.clone();
        }
        if let Some(bio) = &req.bio {
            row.bio = bio.clone();
        }
        row.updated_at = Utc::now();
        let updated = row.value().clone();
        drop(row);

        if let Some(old) = released {
            self.emails.remove(&old);
        }
        Ok(updated)
    }

    pub fn delete(&self, id: i64) -> Result<(), DbError> {
        let (_, user) = self.rows.remove(&id).ok_or(DbError::NotFound)?;
        self.emails.remove(&user.email);
        Ok(())
    }
}
