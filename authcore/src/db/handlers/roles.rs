//! Database repository for roles, role permissions and role assignments.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgConnection};
use tracing::instrument;
use uuid::Uuid;

use crate::db::errors::{DbError, Result};
use crate::identity::{Role, RoleAssignment, canonical};
use crate::types::{RoleId, SubjectId, abbrev_uuid};

#[derive(Debug, Clone, FromRow)]
struct RoleRow {
    id: RoleId,
    name: String,
    description: String,
    permissions: Vec<String>,
}

impl From<RoleRow> for Role {
    fn from(row: RoleRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            description: row.description,
            permissions: canonical(row.permissions),
        }
    }
}

#[derive(Debug, Clone, FromRow)]
struct AssignmentRow {
    subject_id: SubjectId,
    role: String,
    assigned_at: DateTime<Utc>,
    assigned_by: Option<SubjectId>,
}

impl From<AssignmentRow> for RoleAssignment {
    fn from(row: AssignmentRow) -> Self {
        Self {
            subject_id: row.subject_id,
            role: row.role,
            assigned_at: row.assigned_at,
            assigned_by: row.assigned_by,
        }
    }
}

const ROLE_SELECT: &str = r#"
    SELECT r.id, r.name, r.description,
        COALESCE(ARRAY_AGG(rp.permission) FILTER (WHERE rp.permission IS NOT NULL), '{}') AS permissions
    FROM roles r
    LEFT JOIN role_permissions rp ON rp.role_id = r.id
"#;

pub struct Roles<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Roles<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self), err)]
    pub async fn get(&mut self, name: &str) -> Result<Option<Role>> {
        let row = sqlx::query_as::<_, RoleRow>(&format!("{ROLE_SELECT} WHERE r.name = $1 GROUP BY r.id"))
            .bind(name)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(row.map(Role::from))
    }

    #[instrument(skip(self), err)]
    pub async fn list(&mut self) -> Result<Vec<Role>> {
        let rows = sqlx::query_as::<_, RoleRow>(&format!("{ROLE_SELECT} GROUP BY r.id ORDER BY r.name"))
            .fetch_all(&mut *self.db)
            .await?;
        Ok(rows.into_iter().map(Role::from).collect())
    }

    #[instrument(skip(self, permissions), err)]
    pub async fn create(&mut self, name: &str, description: &str, permissions: &[String]) -> Result<Role> {
        let id = Uuid::new_v4();
        sqlx::query("INSERT INTO roles (id, name, description) VALUES ($1, $2, $3)")
            .bind(id)
            .bind(name)
            .bind(description)
            .execute(&mut *self.db)
            .await?;
        let permissions = canonical(permissions.to_vec());
        self.insert_permissions(id, &permissions).await?;
        Ok(Role {
            id,
            name: name.to_string(),
            description: description.to_string(),
            permissions,
        })
    }

    /// Replace the permission set of a role.
    #[instrument(skip(self, permissions), err)]
    pub async fn set_permissions(&mut self, name: &str, permissions: &[String]) -> Result<Role> {
        let role = self.get(name).await?.ok_or(DbError::NotFound)?;
        sqlx::query("DELETE FROM role_permissions WHERE role_id = $1")
            .bind(role.id)
            .execute(&mut *self.db)
            .await?;
        let permissions = canonical(permissions.to_vec());
        self.insert_permissions(role.id, &permissions).await?;
        Ok(Role { permissions, ..role })
    }

    async fn insert_permissions(&mut self, role_id: RoleId, permissions: &[String]) -> Result<()> {
        if permissions.is_empty() {
            return Ok(());
        }
        sqlx::query(
            "INSERT INTO role_permissions (role_id, permission) SELECT $1, UNNEST($2::TEXT[]) ON CONFLICT DO NOTHING",
        )
        .bind(role_id)
        .bind(permissions)
        .execute(&mut *self.db)
        .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(subject_id = %abbrev_uuid(&subject_id)), err)]
    pub async fn roles_of_subject(&mut self, subject_id: SubjectId) -> Result<Vec<String>> {
        let roles = sqlx::query_scalar::<_, String>(
            r#"
            SELECT r.name FROM subject_roles sr JOIN roles r ON r.id = sr.role_id
            WHERE sr.subject_id = $1
            ORDER BY r.name
            "#,
        )
        .bind(subject_id)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(roles)
    }

    /// Assign a role. Assigning a role the subject already holds returns the existing
    /// assignment. Unknown roles or subjects give [`DbError::NotFound`].
    #[instrument(skip(self, assigned_by), fields(subject_id = %abbrev_uuid(&subject_id)), err)]
    pub async fn assign(&mut self, subject_id: SubjectId, role: &str, assigned_by: Option<SubjectId>) -> Result<RoleAssignment> {
        let inserted = sqlx::query_as::<_, AssignmentRow>(
            r#"
            INSERT INTO subject_roles (subject_id, role_id, assigned_by)
            SELECT $1, r.id, $3 FROM roles r WHERE r.name = $2
            ON CONFLICT (subject_id, role_id) DO NOTHING
            RETURNING subject_id, $2::TEXT AS role, assigned_at, assigned_by
            "#,
        )
        .bind(subject_id)
        .bind(role)
        .bind(assigned_by)
        .fetch_optional(&mut *self.db)
        .await;

        let inserted = match inserted {
            Ok(row) => row,
            // The subject does not exist
            Err(sqlx::Error::Database(e)) if e.is_foreign_key_violation() => return Err(DbError::NotFound),
            Err(e) => return Err(e.into()),
        };
        if let Some(row) = inserted {
            return Ok(row.into());
        }

        // Either already assigned or the role does not exist
        let existing = sqlx::query_as::<_, AssignmentRow>(
            r#"
            SELECT sr.subject_id, r.name AS role, sr.assigned_at, sr.assigned_by
            FROM subject_roles sr JOIN roles r ON r.id = sr.role_id
            WHERE sr.subject_id = $1 AND r.name = $2
            "#,
        )
        .bind(subject_id)
        .bind(role)
        .fetch_optional(&mut *self.db)
        .await?;
        existing.map(RoleAssignment::from).ok_or(DbError::NotFound)
    }

    #[instrument(skip(self), fields(subject_id = %abbrev_uuid(&subject_id)), err)]
    pub async fn remove(&mut self, subject_id: SubjectId, role: &str) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM subject_roles WHERE subject_id = $1 AND role_id = (SELECT id FROM roles WHERE name = $2)",
        )
        .bind(subject_id)
        .bind(role)
        .execute(&mut *self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(subject_id = %abbrev_uuid(&subject_id)), err)]
    pub async fn permissions_of_subject(&mut self, subject_id: SubjectId) -> Result<Vec<String>> {
        let permissions = sqlx::query_scalar::<_, String>(
            r#"
            SELECT DISTINCT rp.permission
            FROM subject_roles sr JOIN role_permissions rp ON rp.role_id = sr.role_id
            WHERE sr.subject_id = $1
            ORDER BY rp.permission
            "#,
        )
        .bind(subject_id)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(permissions)
    }

    #[instrument(skip(self), err)]
    pub async fn subjects_with_role(&mut self, role: &str) -> Result<Vec<SubjectId>> {
        let ids = sqlx::query_scalar::<_, SubjectId>(
            "SELECT sr.subject_id FROM subject_roles sr JOIN roles r ON r.id = sr.role_id WHERE r.name = $1",
        )
        .bind(role)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(ids)
    }
}
