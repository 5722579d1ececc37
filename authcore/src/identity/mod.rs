//! Identity store: subjects, roles, role assignments and role permissions.
//!
//! The authentication core only talks to identities through [`IdentityStore`]. Two
//! implementations ship with the crate:
//!
//! - [`postgres::PgIdentityStore`], the production store
//! - [`memory::MemoryIdentityStore`], used by tests and single-node demos
//!
//! Both report failures as [`DbError`](crate::db::errors::DbError) so callers map them the same way.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::db::errors::Result;
use crate::types::{RoleId, SubjectId, any_grants};

/// A stored identity, including its password digest.
///
/// Never hand this to a client: use [`SubjectView`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subject {
    pub id: SubjectId,
    pub email: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_digest: String,
    pub display_name: Option<String>,
    pub active: bool,
    pub verified: bool,
    pub last_login: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Externally visible subject. Has no digest field at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct SubjectView {
    #[schema(value_type = String, format = "uuid")]
    pub id: SubjectId,
    pub email: String,
    pub username: String,
    pub display_name: Option<String>,
    pub active: bool,
    pub verified: bool,
    pub last_login: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Subject> for SubjectView {
    fn from(subject: &Subject) -> Self {
        Self {
            id: subject.id,
            email: subject.email.clone(),
            username: subject.username.clone(),
            display_name: subject.display_name.clone(),
            active: subject.active,
            verified: subject.verified,
            last_login: subject.last_login,
            created_at: subject.created_at,
            updated_at: subject.updated_at,
        }
    }
}

impl From<Subject> for SubjectView {
    fn from(subject: Subject) -> Self {
        Self::from(&subject)
    }
}

/// Fields of a subject about to be created. Email must already be normalised.
#[derive(Debug, Clone)]
pub struct NewSubject {
    pub email: String,
    pub username: String,
    pub password_digest: String,
    pub display_name: Option<String>,
}

/// Partial update. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct SubjectUpdate {
    pub email: Option<String>,
    pub username: Option<String>,
    pub password_digest: Option<String>,
    pub display_name: Option<Option<String>>,
    pub active: Option<bool>,
    pub verified: Option<bool>,
}

/// Filter and pagination for listing subjects.
#[derive(Debug, Clone, Deserialize, ToSchema, utoipa::IntoParams)]
#[serde(default)]
#[into_params(parameter_in = Query)]
pub struct SubjectFilter {
    /// Case-insensitive substring match on email or username
    pub search: Option<String>,
    pub active: Option<bool>,
    /// Only subjects holding this role
    pub role: Option<String>,
    pub skip: i64,
    pub limit: i64,
}

impl Default for SubjectFilter {
    fn default() -> Self {
        Self {
            search: None,
            active: None,
            role: None,
            skip: 0,
            limit: 50,
        }
    }
}

impl SubjectFilter {
    pub const MAX_LIMIT: i64 = 500;

    /// Clamp pagination to sane bounds.
    pub fn normalized(&self) -> Self {
        Self {
            skip: self.skip.max(0),
            limit: self.limit.clamp(1, Self::MAX_LIMIT),
            search: self.search.as_ref().map(|s| s.trim().to_lowercase()).filter(|s| !s.is_empty()),
            ..self.clone()
        }
    }
}

/// A named bundle of permissions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Role {
    #[schema(value_type = String, format = "uuid")]
    pub id: RoleId,
    pub name: String,
    pub description: String,
    /// Sorted, deduplicated `resource.action` strings
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct RoleAssignment {
    #[schema(value_type = String, format = "uuid")]
    pub subject_id: SubjectId,
    pub role: String,
    pub assigned_at: DateTime<Utc>,
    #[schema(value_type = Option<String>, format = "uuid")]
    pub assigned_by: Option<SubjectId>,
}

/// Sort and deduplicate a permission or role list.
pub fn canonical(mut items: Vec<String>) -> Vec<String> {
    items.sort();
    items.dedup();
    items
}

/// Persistence of subjects and their authorization data.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn get_by_id(&self, id: SubjectId) -> Result<Option<Subject>>;

    /// Lookup by normalised email
    async fn get_by_email(&self, email: &str) -> Result<Option<Subject>>;

    async fn get_by_username(&self, username: &str) -> Result<Option<Subject>>;

    async fn exists_by_email(&self, email: &str) -> Result<bool> {
        Ok(self.get_by_email(email).await?.is_some())
    }

    async fn exists_by_username(&self, username: &str) -> Result<bool> {
        Ok(self.get_by_username(username).await?.is_some())
    }

    /// Persist a subject and assign `roles`, atomically. Unknown roles fail the whole call.
    async fn create(&self, subject: NewSubject, roles: &[String]) -> Result<Subject>;

    async fn update(&self, id: SubjectId, update: SubjectUpdate) -> Result<Subject>;

    /// Soft delete: the subject is deactivated, not removed
    async fn delete(&self, id: SubjectId) -> Result<()>;

    async fn list(&self, filter: &SubjectFilter) -> Result<Vec<Subject>>;

    async fn count(&self, filter: &SubjectFilter) -> Result<i64>;

    async fn update_last_login(&self, id: SubjectId) -> Result<()>;

    /// Sorted role names
    async fn roles_of_subject(&self, id: SubjectId) -> Result<Vec<String>>;

    /// Idempotent: assigning a held role returns the existing assignment
    async fn assign_role(&self, subject_id: SubjectId, role: &str, assigned_by: Option<SubjectId>) -> Result<RoleAssignment>;

    /// Returns whether an assignment was removed
    async fn remove_role(&self, subject_id: SubjectId, role: &str) -> Result<bool>;

    /// Union of the permissions of every assigned role, sorted and deduplicated
    async fn permissions_of_subject(&self, id: SubjectId) -> Result<Vec<String>>;

    async fn user_has_all(&self, id: SubjectId, required: &[&str]) -> Result<bool> {
        let held = self.permissions_of_subject(id).await?;
        Ok(required.iter().all(|p| any_grants(&held, p)))
    }

    async fn user_has_any(&self, id: SubjectId, required: &[&str]) -> Result<bool> {
        let held = self.permissions_of_subject(id).await?;
        Ok(required.iter().any(|p| any_grants(&held, p)))
    }

    async fn get_role(&self, name: &str) -> Result<Option<Role>>;

    async fn list_roles(&self) -> Result<Vec<Role>>;

    async fn create_role(&self, name: &str, description: &str, permissions: &[String]) -> Result<Role>;

    /// Replace the permission set of a role
    async fn set_role_permissions(&self, role: &str, permissions: &[String]) -> Result<Role>;

    async fn subjects_with_role(&self, role: &str) -> Result<Vec<SubjectId>>;

    async fn ping(&self) -> Result<()>;
}
