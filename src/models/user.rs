//! User entity and its request/response shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub bio: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateUserRequest {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub bio: String,
}

impl CreateUserRequest {
    /// Reject requests with an empty name or a malformed email.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("name is required".to_string());
        }
        if !is_valid_email(&self.email) {
            return Err("email must be a valid email address".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateUserRequest {
    pub name: Option<String>,
    pub email: Option<String>,
    pub bio: Option<String>,
}

impl UpdateUserRequest {
    pub fn validate(&self) -> Result<(), String> {
        if let Some(name) = &self.name {
            if name.trim().is_empty() {
                return Err("name must not be empty".to_string());
            }
        }
        if let Some(email) = &self.email {
            if !is_valid_email(email) {
                return Err("email must be a valid email address".to_string());
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.email.is_none() && self.bio.is_none()
    }
}

/// Syntactic check: one `@`, non-empty local part, dotted domain, no whitespace.
pub fn is_valid_email(email: &str) -> bool {
    if email.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_syntax() {
        assert!(is_valid_email("ada@example.com"));
        assert!(!is_valid_email("ada@example"));
        assert!(!is_valid_email("@example.com"));
        assert!(!is_valid_email("ada@@example.com"));
        assert!(!is_valid_email("ada @example.com"));
        assert!(!is_valid_email("ada@example.com."));
    }

    #[test]
    fn test_create_validation() {
        let ok = CreateUserRequest {
            name: "Ada".into(),
            email: "ada@example.com".into(),
            bio: String::new(),
        };
        assert!(ok.validate().is_ok());

        let nameless = CreateUserRequest {
            name: "  ".into(),
            ..ok.clone()
        };
        assert!(nameless.validate().is_err());
    }

    #[test]
    fn test_update_validation() {
        assert!(UpdateUserRequest::default().is_empty());
        let bad = UpdateUserRequest {
            email: Some("nope".into()),
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
