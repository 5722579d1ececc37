//! Role mutations that keep the permission cache honest.
//!
//! Every mutation invalidates the affected subjects before the store call and again
//! after it. The first pass makes sure no caller sees pre-mutation state once the
//! mutation is reported; the second drops anything a concurrent lookup loaded while the
//! mutation was in flight. A mutation whose invalidation fails reports the failure.

use std::sync::Arc;
use tracing::{info, instrument};

use crate::auth::permission_cache::PermissionCache;
use crate::db::errors::DbError;
use crate::errors::{Error, FieldErrors, Result};
use crate::identity::{IdentityStore, Role, RoleAssignment, canonical};
use crate::types::{Permission, SubjectId, abbrev_uuid};

#[derive(Clone)]
pub struct RoleManager {
    store: Arc<dyn IdentityStore>,
    cache: Arc<PermissionCache>,
}

fn role_not_found(role: &str) -> Error {
    Error::NotFound {
        resource: "Role".to_string(),
        id: role.to_string(),
    }
}

/// Parse and canonicalise a permission list, reporting every malformed entry.
pub fn parse_permissions(permissions: &[String]) -> Result<Vec<String>> {
    let mut parsed = Vec::with_capacity(permissions.len());
    let mut invalid = Vec::new();
    for permission in permissions {
        match permission.parse::<Permission>() {
            Ok(p) => parsed.push(p.as_str().to_string()),
            Err(_) => invalid.push(format!("invalid_format:{permission}")),
        }
    }
    if !invalid.is_empty() {
        let mut details = FieldErrors::new();
        details.insert("permissions".to_string(), invalid);
        return Err(Error::Validation {
            message: "Permissions must have the form resource.action".to_string(),
            details,
        });
    }
    Ok(canonical(parsed))
}

impl RoleManager {
    pub fn new(store: Arc<dyn IdentityStore>, cache: Arc<PermissionCache>) -> Self {
        Self { store, cache }
    }

    async fn ensure_subject(&self, subject_id: SubjectId) -> Result<()> {
        match self.store.get_by_id(subject_id).await? {
            Some(_) => Ok(()),
            None => Err(Error::NotFound {
                resource: "Subject".to_string(),
                id: subject_id.to_string(),
            }),
        }
    }

    #[instrument(skip(self), fields(subject_id = %abbrev_uuid(&subject_id)), err)]
    pub async fn assign_role(&self, subject_id: SubjectId, role: &str, assigned_by: Option<SubjectId>) -> Result<RoleAssignment> {
        self.ensure_subject(subject_id).await?;
        if self.store.get_role(role).await?.is_none() {
            return Err(role_not_found(role));
        }

        self.cache.invalidate(subject_id).await?;
        let assignment = self.store.assign_role(subject_id, role, assigned_by).await.map_err(|e| match e {
            DbError::NotFound => role_not_found(role),
            other => other.into(),
        });
        self.cache.invalidate(subject_id).await?;

        let assignment = assignment?;
        info!(role, "Role assigned");
        Ok(assignment)
    }

    /// Returns whether the subject held the role.
    #[instrument(skip(self), fields(subject_id = %abbrev_uuid(&subject_id)), err)]
    pub async fn remove_role(&self, subject_id: SubjectId, role: &str) -> Result<bool> {
        self.ensure_subject(subject_id).await?;

        self.cache.invalidate(subject_id).await?;
        let removed = self.store.remove_role(subject_id, role).await;
        self.cache.invalidate(subject_id).await?;

        let removed = removed?;
        if removed {
            info!(role, "Role removed");
        }
        Ok(removed)
    }

    /// Replace the permissions of `role`, invalidating every subject holding it.
    #[instrument(skip(self, permissions), err)]
    pub async fn set_role_permissions(&self, role: &str, permissions: &[String]) -> Result<Role> {
        let permissions = parse_permissions(permissions)?;
        if self.store.get_role(role).await?.is_none() {
            return Err(role_not_found(role));
        }

        let holders = self.store.subjects_with_role(role).await?;
        self.invalidate_all(role, &holders).await?;
        let updated = self.store.set_role_permissions(role, &permissions).await.map_err(|e| match e {
            DbError::NotFound => role_not_found(role),
            other => other.into(),
        });

        // Holders are read again: someone may have been granted the role meanwhile
        let mut holders = holders;
        holders.extend(self.store.subjects_with_role(role).await?);
        holders.sort_unstable();
        holders.dedup();
        self.invalidate_all(role, &holders).await?;

        let updated = updated?;
        info!(role, holders = holders.len(), permissions = updated.permissions.len(), "Role permissions replaced");
        Ok(updated)
    }

    async fn invalidate_all(&self, role: &str, holders: &[SubjectId]) -> Result<()> {
        self.cache.invalidate_role(role).await?;
        for subject_id in holders {
            self.cache.invalidate(*subject_id).await?;
        }
        Ok(())
    }
}
