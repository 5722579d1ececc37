//! Common type definitions shared across the crate.
//!
//! - Type aliases for entity IDs ([`SubjectId`], [`RoleId`])
//! - [`Permission`]: a parsed `resource.action` capability string
//! - Small normalisation helpers for emails and usernames
//!
//! # Permission strings
//!
//! Permissions are plain strings of the form `resource.action`, e.g. `users.read` or
//! `products.write`. Two wildcard forms are recognised when checking grants:
//!
//! - `*` grants every permission
//! - `resource.*` grants every action on `resource`
//!
//! ```ignore
//! use authcore::types::Permission;
//!
//! let granted: Permission = "products.*".parse()?;
//! assert!(granted.grants(&"products.write".parse()?));
//! ```

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use uuid::Uuid;

// Type aliases for IDs
pub type SubjectId = Uuid;
pub type RoleId = Uuid;

/// Abbreviate a UUID to its first 8 characters for more readable logs and traces
/// Example: "550e8400-e29b-41d4-a716-446655440000" -> "550e8400"
pub fn abbrev_uuid(uuid: &Uuid) -> String {
    uuid.to_string().chars().take(8).collect()
}

/// Lowercase and trim an email address for storage and comparison.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Minimal structural email check: one `@`, non-empty local part, dotted domain.
pub fn is_plausible_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !email.chars().any(char::is_whitespace)
}

/// Usernames are 3 to 50 characters from `[A-Za-z0-9_-]`.
pub fn is_valid_username(username: &str) -> bool {
    (3..=50).contains(&username.chars().count()) && username.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// A capability string of the form `resource.action`, or a wildcard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Permission(String);

impl Permission {
    pub const WILDCARD: &'static str = "*";

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn resource(&self) -> &str {
        self.0.split_once('.').map(|(r, _)| r).unwrap_or(&self.0)
    }

    /// Does holding `self` satisfy a requirement for `required`?
    pub fn grants(&self, required: &Permission) -> bool {
        if self.0 == Self::WILDCARD || self.0 == required.0 {
            return true;
        }
        match self.0.split_once('.') {
            Some((resource, "*")) => required.resource() == resource,
            _ => false,
        }
    }
}

/// Whether any permission in `held` grants `required`.
pub fn any_grants<'a>(held: impl IntoIterator<Item = &'a String>, required: &str) -> bool {
    let Ok(required) = required.parse::<Permission>() else {
        return false;
    };
    held.into_iter()
        .filter_map(|p| p.parse::<Permission>().ok())
        .any(|p| p.grants(&required))
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid permission '{0}': expected 'resource.action'")]
pub struct InvalidPermission(pub String);

impl FromStr for Permission {
    type Err = InvalidPermission;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == Self::WILDCARD {
            return Ok(Self(s.to_string()));
        }
        let valid_part = |part: &str| !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        match s.split_once('.') {
            Some((resource, action)) if valid_part(resource) && (action == "*" || valid_part(action)) => Ok(Self(s.to_lowercase())),
            _ => Err(InvalidPermission(s.to_string())),
        }
    }
}

impl TryFrom<String> for Permission {
    type Error = InvalidPermission;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Permission> for String {
    fn from(value: Permission) -> Self {
        value.0
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_email() {
        assert_eq!(normalize_email("  Alice@Example.COM "), "alice@example.com");
    }

    #[test]
    fn test_plausible_email() {
        assert!(is_plausible_email("user1@example.com"));
        assert!(!is_plausible_email("user1example.com"));
        assert!(!is_plausible_email("@example.com"));
        assert!(!is_plausible_email("user@localhost"));
        assert!(!is_plausible_email("us er@example.com"));
        assert!(!is_plausible_email("a@b@example.com"));
    }

    #[test]
    fn test_username_rules() {
        assert!(is_valid_username("abc"));
        assert!(is_valid_username("user_name-1"));
        assert!(!is_valid_username("ab"));
        assert!(!is_valid_username(&"a".repeat(51)));
        assert!(!is_valid_username("user.name"));
        assert!(!is_valid_username("user name"));
    }

    #[test]
    fn test_permission_parsing() {
        assert!("users.read".parse::<Permission>().is_ok());
        assert!("products.*".parse::<Permission>().is_ok());
        assert!("*".parse::<Permission>().is_ok());
        assert!("users".parse::<Permission>().is_err());
        assert!(".read".parse::<Permission>().is_err());
        assert!("users.".parse::<Permission>().is_err());
        assert_eq!("Users.Read".parse::<Permission>().unwrap().as_str(), "users.read");
    }

    #[test]
    fn test_permission_grants() {
        let exact: Permission = "products.read".parse().unwrap();
        let resource_wildcard: Permission = "products.*".parse().unwrap();
        let all: Permission = "*".parse().unwrap();
        let write: Permission = "products.write".parse().unwrap();
        let users: Permission = "users.read".parse().unwrap();

        assert!(exact.grants(&exact));
        assert!(!exact.grants(&write));
        assert!(resource_wildcard.grants(&write));
        assert!(!resource_wildcard.grants(&users));
        assert!(all.grants(&users));
    }

    #[test]
    fn test_any_grants() {
        let held = vec!["orders.read".to_string(), "products.*".to_string()];
        assert!(any_grants(&held, "products.delete"));
        assert!(!any_grants(&held, "orders.write"));
        assert!(!any_grants(&held, "not-a-permission"));
    }
}
